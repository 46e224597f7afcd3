//! Disease-free equilibrium of a derived system.
//!
//! With every infected compartment set to zero, the uninfected equations are
//! solved symbolically when they are linear in the uninfected compartments.
//! Otherwise, given parameter values, a damped Newton iteration finds the
//! fixed point numerically.

use crate::equation_engine::{Bytecode, Compiler, VM};
use crate::error::ModelError;
use crate::generator::DerivedSystem;
use crate::parameters::ParameterSet;
use crate::symbolic::{solve_linear, Expr, LinearSolution};
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseFreeEquilibrium {
    /// Equilibrium value of each uninfected compartment, in model order.
    pub values: Vec<(String, Expr)>,
    /// Uninfected compartments the equations leave undetermined. Their
    /// entry in `values` is their own symbol, standing for the current value.
    pub free: Vec<String>,
    /// False when the values come from Newton iteration.
    pub is_exact: bool,
}

impl DiseaseFreeEquilibrium {
    pub fn value(&self, compartment: &str) -> Option<&Expr> {
        self.values
            .iter()
            .find(|(id, _)| id == compartment)
            .map(|(_, value)| value)
    }

    /// Substitution map placing a system at this equilibrium: infected
    /// compartments map to zero, uninfected ones to their value.
    pub fn substitutions(&self, infected: &[String]) -> HashMap<String, Expr> {
        let mut map: HashMap<String, Expr> = infected
            .iter()
            .map(|id| (id.clone(), Expr::zero()))
            .collect();
        for (id, value) in &self.values {
            map.insert(id.clone(), value.clone());
        }
        map
    }
}

/// Solves the uninfected subsystem of `system` with `infected` held at zero.
///
/// `guess` holds the starting point for Newton iteration, one value per
/// uninfected compartment; it is only read when the subsystem is nonlinear.
pub fn disease_free_equilibrium(
    system: &DerivedSystem,
    infected: &[String],
    uninfected: &[String],
    parameters: Option<&ParameterSet>,
    guess: &[f64],
    settings: NewtonSettings,
) -> Result<DiseaseFreeEquilibrium, ModelError> {
    let zeros: HashMap<String, Expr> = infected
        .iter()
        .map(|id| (id.clone(), Expr::zero()))
        .collect();
    let equations = uninfected
        .iter()
        .map(|id| {
            system
                .equation(id)
                .map(|e| e.rhs.subs(&zeros))
                .ok_or_else(|| ModelError::UnknownCompartment(id.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    match solve_linear(&equations, uninfected) {
        LinearSolution::Solved(solution) => {
            let mut values = Vec::with_capacity(uninfected.len());
            let mut free = Vec::new();
            for (id, value) in uninfected.iter().zip(solution) {
                match value {
                    Some(value) => values.push((id.clone(), value)),
                    None => {
                        free.push(id.clone());
                        values.push((id.clone(), Expr::sym(id.as_str())));
                    }
                }
            }
            debug!("Disease-free equilibrium solved symbolically; free: {free:?}");
            Ok(DiseaseFreeEquilibrium {
                values,
                free,
                is_exact: true,
            })
        }
        LinearSolution::Inconsistent(residual) => Err(ModelError::NoDiseaseFreeEquilibrium(
            format!("with no infection the uninfected equations require {residual} = 0"),
        )),
        LinearSolution::Nonlinear(equation) => match parameters {
            Some(parameters) => numeric_equilibrium(&equations, uninfected, parameters, guess, settings),
            None => Err(ModelError::NoDiseaseFreeEquilibrium(format!(
                "the uninfected subsystem is nonlinear ({equation} = 0); \
                 parameter values are needed to solve it numerically"
            ))),
        },
    }
}

fn numeric_equilibrium(
    equations: &[Expr],
    unknowns: &[String],
    parameters: &ParameterSet,
    guess: &[f64],
    settings: NewtonSettings,
) -> Result<DiseaseFreeEquilibrium, ModelError> {
    let unknown_set: BTreeSet<&str> = unknowns.iter().map(String::as_str).collect();
    let missing: BTreeSet<String> = equations
        .iter()
        .flat_map(Expr::free_symbols)
        .filter(|s| !unknown_set.contains(s.as_str()) && !parameters.contains(s))
        .collect();
    if !missing.is_empty() {
        return Err(ModelError::UnboundParameter(missing.into_iter().collect()));
    }

    let param_names: Vec<String> = parameters.names().map(str::to_string).collect();
    let param_values: Vec<f64> = parameters.iter().map(|(_, v)| v).collect();
    let compiler = Compiler::new(unknowns, &param_names);
    let compile = |expr: &Expr| {
        compiler
            .compile(expr)
            .map_err(|symbol| ModelError::UnboundParameter(vec![symbol]))
    };

    let residuals = equations.iter().map(&compile).collect::<Result<Vec<_>, _>>()?;
    let mut jacobian = Vec::with_capacity(unknowns.len() * unknowns.len());
    for equation in equations {
        for unknown in unknowns {
            jacobian.push(compile(&equation.diff(unknown))?);
        }
    }

    let state = newton(&residuals, &jacobian, &param_values, guess, settings)
        .map_err(|err| ModelError::NoDiseaseFreeEquilibrium(format!("{err:#}")))?;
    debug!("Disease-free equilibrium found numerically: {state:?}");

    Ok(DiseaseFreeEquilibrium {
        values: unknowns
            .iter()
            .cloned()
            .zip(state.into_iter().map(Expr::num))
            .collect(),
        free: Vec::new(),
        is_exact: false,
    })
}

fn newton(
    residuals: &[Bytecode],
    jacobian: &[Bytecode],
    params: &[f64],
    initial_guess: &[f64],
    settings: NewtonSettings,
) -> Result<Vec<f64>> {
    let dim = residuals.len();
    if initial_guess.len() != dim {
        bail!(
            "Initial guess dimension mismatch. Expected {}, got {}.",
            dim,
            initial_guess.len()
        );
    }
    if settings.max_steps == 0 {
        bail!("max_steps must be greater than zero.");
    }
    if settings.damping <= 0.0 {
        bail!("damping must be positive.");
    }
    if settings.tolerance <= 0.0 {
        bail!("tolerance must be positive.");
    }

    let mut stack = Vec::with_capacity(64);
    let mut state = initial_guess.to_vec();
    let mut residual = evaluate(residuals, &state, params, &mut stack);
    let mut residual_norm = l2_norm(&residual);
    let mut iterations = 0usize;

    loop {
        if !residual_norm.is_finite() {
            bail!("Residual became non-finite after {} Newton steps.", iterations);
        }
        if residual_norm <= settings.tolerance {
            break;
        }
        if iterations >= settings.max_steps {
            bail!(
                "Newton solver failed to converge in {} steps (‖f(x)‖ = {}).",
                settings.max_steps,
                residual_norm
            );
        }

        let values = evaluate(jacobian, &state, params, &mut stack);
        let delta = solve_linear_system(dim, &values, &residual)
            .context("Failed to solve linear system during Newton iteration.")?;

        for i in 0..dim {
            state[i] -= settings.damping * delta[i];
        }

        iterations += 1;
        residual = evaluate(residuals, &state, params, &mut stack);
        residual_norm = l2_norm(&residual);
    }

    Ok(state)
}

fn evaluate(code: &[Bytecode], state: &[f64], params: &[f64], stack: &mut Vec<f64>) -> Vec<f64> {
    code.iter()
        .map(|c| VM::execute(c, state, params, stack))
        .collect()
}

/// Least-squares solve through the SVD so that rank-deficient Jacobians
/// (compartments the equations do not pin down) still give a step.
fn solve_linear_system(dim: usize, jacobian: &[f64], residual: &[f64]) -> Result<Vec<f64>> {
    let j_matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let rhs = DVector::from_column_slice(residual);
    j_matrix
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map(|v| v.iter().cloned().collect())
        .map_err(|msg| anyhow!("Jacobian is singular: {msg}"))
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;
    use crate::generator::generate;
    use crate::model::{Endpoint, ModelGraph, VitalDynamics};

    fn expr(text: &str) -> Expr {
        parse(text).expect("expression should parse").simplify()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn sir(vital: VitalDynamics) -> DerivedSystem {
        let mut graph = ModelGraph::new();
        graph.add_compartment("S", "", false).expect("S");
        graph.add_compartment("I", "", true).expect("I");
        graph.add_compartment("R", "", false).expect("R");
        graph.declare_parameter("beta").expect("beta");
        graph.declare_parameter("gamma").expect("gamma");
        graph.add_infection_transition("S", "I", "beta*S*I").expect("infection");
        graph.add_transition("I", "R", "gamma*I").expect("recovery");
        graph.set_vital_dynamics(vital).expect("vital");
        generate(&graph).expect("generate")
    }

    fn logistic() -> DerivedSystem {
        let mut graph = ModelGraph::new();
        graph.add_compartment("S", "", false).expect("S");
        graph.add_compartment("I", "", true).expect("I");
        for name in ["r", "K", "beta", "gamma"] {
            graph.declare_parameter(name).expect("parameter");
        }
        graph.add_transition(Endpoint::Outside, "S", "r*S*(1 - S/K)").expect("growth");
        graph.add_infection_transition("S", "I", "beta*S*I").expect("infection");
        graph.add_transition("I", Endpoint::Outside, "gamma*I").expect("removal");
        generate(&graph).expect("generate")
    }

    #[test]
    fn closed_sir_leaves_uninfected_compartments_free() {
        let dfe = disease_free_equilibrium(
            &sir(VitalDynamics::default()),
            &ids(&["I"]),
            &ids(&["S", "R"]),
            None,
            &[],
            NewtonSettings::default(),
        )
        .expect("dfe");
        assert_eq!(dfe.free, ids(&["S", "R"]));
        assert_eq!(dfe.value("S"), Some(&Expr::sym("S")));
        assert!(dfe.is_exact);
    }

    #[test]
    fn vital_dynamics_fix_the_susceptible_level() {
        let dfe = disease_free_equilibrium(
            &sir(VitalDynamics { birth: true, death: true }),
            &ids(&["I"]),
            &ids(&["S", "R"]),
            None,
            &[],
            NewtonSettings::default(),
        )
        .expect("dfe");
        assert_eq!(dfe.value("S"), Some(&expr("tau/mu")));
        assert_eq!(dfe.value("R"), Some(&Expr::zero()));
        assert!(dfe.free.is_empty());

        let subs = dfe.substitutions(&ids(&["I"]));
        assert_eq!(subs.get("I"), Some(&Expr::zero()));
    }

    #[test]
    fn births_without_deaths_have_no_equilibrium() {
        let err = disease_free_equilibrium(
            &sir(VitalDynamics { birth: true, death: false }),
            &ids(&["I"]),
            &ids(&["S", "R"]),
            None,
            &[],
            NewtonSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::NoDiseaseFreeEquilibrium(_)));
    }

    #[test]
    fn nonlinear_subsystem_needs_parameters() {
        let system = logistic();
        let err = disease_free_equilibrium(
            &system,
            &ids(&["I"]),
            &ids(&["S"]),
            None,
            &[80.0],
            NewtonSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::NoDiseaseFreeEquilibrium(_)));

        let partial = ParameterSet::new().with("r", 1.0);
        let err = disease_free_equilibrium(
            &system,
            &ids(&["I"]),
            &ids(&["S"]),
            Some(&partial),
            &[80.0],
            NewtonSettings::default(),
        )
        .unwrap_err();
        assert_eq!(err, ModelError::UnboundParameter(vec!["K".to_string()]));
    }

    #[test]
    fn newton_finds_the_carrying_capacity() {
        let params = ParameterSet::new()
            .with("r", 1.0)
            .with("K", 100.0)
            .with("beta", 0.01)
            .with("gamma", 0.5);
        let dfe = disease_free_equilibrium(
            &logistic(),
            &ids(&["I"]),
            &ids(&["S"]),
            Some(&params),
            &[80.0],
            NewtonSettings::default(),
        )
        .expect("dfe");
        assert!(!dfe.is_exact);
        let value = dfe.value("S").and_then(Expr::as_num).expect("numeric value");
        assert!((value - 100.0).abs() < 1e-6);
    }

    #[test]
    fn newton_reports_non_convergence() {
        let params = ParameterSet::new()
            .with("r", 1.0)
            .with("K", 100.0)
            .with("beta", 0.01)
            .with("gamma", 0.5);
        let settings = NewtonSettings {
            max_steps: 1,
            ..NewtonSettings::default()
        };
        let err = disease_free_equilibrium(
            &logistic(),
            &ids(&["I"]),
            &ids(&["S"]),
            Some(&params),
            &[80.0],
            settings,
        )
        .unwrap_err();
        match err {
            ModelError::NoDiseaseFreeEquilibrium(reason) => {
                assert!(reason.contains("failed to converge"), "{reason}")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
