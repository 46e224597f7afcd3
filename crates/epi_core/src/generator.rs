use crate::error::ModelError;
use crate::model::{Endpoint, ModelGraph, BIRTH_SYMBOL, DEATH_SYMBOL};
use crate::symbolic::Expr;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// An infection-tagged flow into a compartment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfectionInflow {
    pub source: Endpoint,
    pub rate: Expr,
}

/// `d(compartment)/dt = rhs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEquation {
    pub compartment: String,
    pub label: String,
    pub rhs: Expr,
    pub infection_inflows: Vec<InfectionInflow>,
}

impl DerivedEquation {
    pub fn to_latex(&self) -> String {
        format!(
            "\\frac{{d{}}}{{dt}} = {}",
            Expr::sym(self.compartment.as_str()).to_latex(),
            self.rhs.to_latex()
        )
    }
}

impl fmt::Display for DerivedEquation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}/dt = {}", self.compartment, self.rhs)
    }
}

/// One equation per compartment, in model order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedSystem {
    pub equations: Vec<DerivedEquation>,
    /// Free symbols that are not compartments, sorted.
    pub parameters: Vec<String>,
}

impl DerivedSystem {
    pub fn compartment_ids(&self) -> Vec<String> {
        self.equations.iter().map(|e| e.compartment.clone()).collect()
    }

    pub fn equation(&self, compartment: &str) -> Option<&DerivedEquation> {
        self.equations.iter().find(|e| e.compartment == compartment)
    }

    pub fn len(&self) -> usize {
        self.equations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.equations.is_empty()
    }
}

/// Compiles the graph into its system of ordinary differential equations.
///
/// Each compartment receives the rates of its inbound transitions minus the
/// rates of its outbound ones. With births on, `tau` flows into the first
/// compartment only; with deaths on, every compartment loses `mu*X`.
pub fn generate(graph: &ModelGraph) -> Result<DerivedSystem, ModelError> {
    if graph.is_empty() {
        return Err(ModelError::EmptyModel);
    }
    let vital = graph.vital_dynamics();

    let mut equations = Vec::with_capacity(graph.compartments().len());
    for (index, compartment) in graph.compartments().iter().enumerate() {
        let id = compartment.id.as_str();
        let mut terms = Vec::new();
        let mut infection_inflows = Vec::new();

        for transition in graph.transitions() {
            // A self-loop contributes both terms, which cancel.
            if transition.destination.is(id) {
                terms.push(transition.rate.clone());
                if transition.is_infection {
                    infection_inflows.push(InfectionInflow {
                        source: transition.source.clone(),
                        rate: transition.rate.clone(),
                    });
                }
            }
            if transition.source.is(id) {
                terms.push(-transition.rate.clone());
            }
        }

        if vital.birth && index == 0 {
            terms.push(Expr::sym(BIRTH_SYMBOL));
        }
        if vital.death {
            terms.push(-(Expr::sym(DEATH_SYMBOL) * Expr::sym(id)));
        }

        let rhs = Expr::sum(terms).simplify();
        debug!("d{id}/dt = {rhs}");
        equations.push(DerivedEquation {
            compartment: compartment.id.clone(),
            label: compartment.label.clone(),
            rhs,
            infection_inflows,
        });
    }

    let compartment_ids: BTreeSet<String> = graph.compartment_ids().into_iter().collect();
    let parameters = equations
        .iter()
        .flat_map(|e| e.rhs.free_symbols())
        .collect::<BTreeSet<_>>()
        .difference(&compartment_ids)
        .cloned()
        .collect();

    Ok(DerivedSystem {
        equations,
        parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;
    use crate::model::VitalDynamics;

    fn expr(text: &str) -> Expr {
        parse(text).expect("expression should parse").simplify()
    }

    fn sir(vital: VitalDynamics) -> ModelGraph {
        let mut graph = ModelGraph::new();
        graph.add_compartment("S", "Susceptible", false).expect("S");
        graph.add_compartment("I", "Infected", true).expect("I");
        graph.add_compartment("R", "Recovered", false).expect("R");
        graph.declare_parameter("beta").expect("beta");
        graph.declare_parameter("gamma").expect("gamma");
        graph.add_infection_transition("S", "I", "beta*S*I").expect("infection");
        graph.add_transition("I", "R", "gamma*I").expect("recovery");
        graph.set_vital_dynamics(vital).expect("vital dynamics");
        graph
    }

    #[test]
    fn classic_sir_equations() {
        let system = generate(&sir(VitalDynamics::default())).expect("generate");
        assert_eq!(system.compartment_ids(), vec!["S", "I", "R"]);
        assert_eq!(system.equations[0].rhs, expr("-beta*S*I"));
        assert_eq!(system.equations[1].rhs, expr("beta*S*I - gamma*I"));
        assert_eq!(system.equations[2].rhs, expr("gamma*I"));
        assert_eq!(system.parameters, vec!["beta", "gamma"]);

        assert_eq!(system.equations[1].to_string(), "dI/dt = I*S*beta - I*gamma");
        assert_eq!(system.equations[1].infection_inflows.len(), 1);
        assert_eq!(system.equations[1].infection_inflows[0].source, Endpoint::from("S"));
        assert!(system.equations[0].infection_inflows.is_empty());
    }

    #[test]
    fn vital_dynamics_add_birth_to_first_and_death_to_all() {
        let system = generate(&sir(VitalDynamics { birth: true, death: true })).expect("generate");
        assert_eq!(system.equations[0].rhs, expr("tau - beta*S*I - mu*S"));
        assert_eq!(system.equations[1].rhs, expr("beta*S*I - gamma*I - mu*I"));
        assert_eq!(system.equations[2].rhs, expr("gamma*I - mu*R"));
        assert_eq!(system.parameters, vec!["beta", "gamma", "mu", "tau"]);
    }

    #[test]
    fn reorder_moves_only_the_birth_term() {
        let vital = VitalDynamics { birth: true, death: true };
        let before = generate(&sir(vital)).expect("generate");

        let mut graph = sir(vital);
        graph.reorder(&["I", "S", "R"]).expect("reorder");
        let after = generate(&graph).expect("generate");

        assert_eq!(after.compartment_ids(), vec!["I", "S", "R"]);
        let birth = Expr::sym(BIRTH_SYMBOL);
        let s_before = before.equation("S").map(|e| e.rhs.clone()).expect("S");
        let i_before = before.equation("I").map(|e| e.rhs.clone()).expect("I");
        let s_after = after.equation("S").map(|e| e.rhs.clone()).expect("S");
        let i_after = after.equation("I").map(|e| e.rhs.clone()).expect("I");
        assert_eq!((s_before - birth.clone()).simplify(), s_after);
        assert_eq!((i_before + birth).simplify(), i_after);
        assert_eq!(before.equation("R"), after.equation("R"));
    }

    #[test]
    fn parallel_transitions_are_summed_and_outside_flows_counted() {
        let mut graph = ModelGraph::new();
        graph.add_compartment("A", "", false).expect("A");
        graph.add_compartment("B", "", false).expect("B");
        graph.declare_parameter("k").expect("k");
        graph.declare_parameter("lambda").expect("lambda");
        graph.add_transition("A", "B", "k*A").expect("first");
        graph.add_transition("A", "B", "k*A").expect("second");
        graph.add_transition(Endpoint::Outside, "A", "lambda").expect("immigration");
        graph.add_transition("B", Endpoint::Outside, "k*B").expect("emigration");

        let system = generate(&graph).expect("generate");
        assert_eq!(system.equations[0].rhs, expr("lambda - 2*k*A"));
        assert_eq!(system.equations[1].rhs, expr("2*k*A - k*B"));
    }

    #[test]
    fn self_loops_cancel() {
        let mut graph = ModelGraph::new();
        graph.add_compartment("A", "", false).expect("A");
        graph.declare_parameter("k").expect("k");
        graph.add_transition("A", "A", "k*A").expect("loop");
        let system = generate(&graph).expect("generate");
        assert!(system.equations[0].rhs.is_zero());
    }

    #[test]
    fn empty_model_is_rejected() {
        assert_eq!(generate(&ModelGraph::new()), Err(ModelError::EmptyModel));
    }

    #[test]
    fn equations_render_as_latex() {
        let system = generate(&sir(VitalDynamics::default())).expect("generate");
        assert_eq!(
            system.equations[2].to_latex(),
            "\\frac{dR}{dt} = I \\gamma"
        );
    }
}
