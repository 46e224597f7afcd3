//! Equation, R0, simulation and export calls.

use crate::model::{js_error, serialize, WasmModel};
use epi_core::export::to_csv_string;
use epi_core::generator::generate;
use epi_core::parameters::ParameterSet;
use epi_core::r0::compute_r0;
use epi_core::simulation::{simulate, SimulationResult, SimulationSettings, SolverKind};
use serde::Serialize;
use wasm_bindgen::prelude::*;

#[derive(Serialize)]
pub(crate) struct EquationPayload {
    compartment: String,
    label: String,
    plaintext: String,
    latex: String,
}

#[derive(Serialize)]
pub(crate) struct R0Payload {
    plaintext: String,
    latex: String,
    value: Option<f64>,
    is_exact: bool,
    infected: Vec<String>,
    disease_free_equilibrium: Vec<(String, String)>,
    next_generation_matrix: Vec<Vec<String>>,
    /// `[re, im]` pairs.
    eigenvalues: Vec<[f64; 2]>,
}

#[derive(Serialize)]
pub(crate) struct SimulationPayload<'a> {
    times: &'a [f64],
    series: &'a [epi_core::simulation::CompartmentSeries],
    accepted_steps: usize,
    rejected_steps: usize,
    warnings: Vec<String>,
}

pub(crate) fn bind_parameters(names: Vec<String>, values: Vec<f64>) -> Result<ParameterSet, String> {
    if names.len() != values.len() {
        return Err(format!(
            "Parameter name/value count mismatch ({} names, {} values).",
            names.len(),
            values.len()
        ));
    }
    Ok(names.into_iter().zip(values).collect())
}

pub(crate) fn solver_kind(name: &str) -> Result<SolverKind, String> {
    match name {
        "tsit5" => Ok(SolverKind::Tsit5),
        "rk4" => Ok(SolverKind::Rk4),
        _ => Err("Unknown solver".to_string()),
    }
}

impl WasmModel {
    pub(crate) fn equation_payload(&self) -> Result<Vec<EquationPayload>, String> {
        let system = generate(&self.graph).map_err(|e| e.to_string())?;
        Ok(system
            .equations
            .iter()
            .map(|equation| EquationPayload {
                compartment: equation.compartment.clone(),
                label: equation.label.clone(),
                plaintext: equation.to_string(),
                latex: equation.to_latex(),
            })
            .collect())
    }

    pub(crate) fn r0_payload(&self, names: Vec<String>, values: Vec<f64>) -> Result<R0Payload, String> {
        let parameters = bind_parameters(names, values)?;
        let system = generate(&self.graph).map_err(|e| e.to_string())?;
        let bound = (!parameters.is_empty()).then_some(&parameters);
        let result =
            compute_r0(&system, self.graph.compartments(), bound).map_err(|e| e.to_string())?;

        Ok(R0Payload {
            plaintext: result.plaintext,
            latex: result.latex,
            value: result.value,
            is_exact: result.is_exact,
            infected: result.infected,
            disease_free_equilibrium: result
                .disease_free_equilibrium
                .values
                .iter()
                .map(|(id, value)| (id.clone(), value.to_string()))
                .collect(),
            next_generation_matrix: result
                .next_generation_matrix
                .iter()
                .map(|row| row.iter().map(ToString::to_string).collect())
                .collect(),
            eigenvalues: result.eigenvalues.iter().map(|z| [z.re, z.im]).collect(),
        })
    }

    pub(crate) fn run_simulation(
        &mut self,
        names: Vec<String>,
        values: Vec<f64>,
        t_end: f64,
        step_count: usize,
        solver: &str,
    ) -> Result<&SimulationResult, String> {
        let parameters = bind_parameters(names, values)?;
        let settings = SimulationSettings {
            solver: solver_kind(solver)?,
            ..SimulationSettings::default()
        };
        let system = generate(&self.graph).map_err(|e| e.to_string())?;
        let result = simulate(
            &system,
            &parameters,
            &self.graph.initial_values(),
            (0.0, t_end),
            step_count,
            &settings,
        )
        .map_err(|e| e.to_string())?;
        Ok(self.last_result.insert(result))
    }

    pub(crate) fn last_csv(&self) -> Result<String, String> {
        let result = self
            .last_result
            .as_ref()
            .ok_or_else(|| "No simulation has been run yet.".to_string())?;
        to_csv_string(result).map_err(|e| e.to_string())
    }
}

#[wasm_bindgen]
impl WasmModel {
    /// Derived equations as `{ compartment, label, plaintext, latex }` records.
    pub fn equations(&self) -> Result<JsValue, JsValue> {
        let payload = self.equation_payload().map_err(js_error)?;
        serialize(&payload)
    }

    /// Symbols the generated equations need values for.
    pub fn parameter_names(&self) -> Result<Vec<String>, JsValue> {
        generate(&self.graph)
            .map(|system| system.parameters)
            .map_err(js_error)
    }

    /// Empty `names` leaves the result symbolic.
    pub fn compute_r0(&self, names: Vec<String>, values: Vec<f64>) -> Result<JsValue, JsValue> {
        let payload = self.r0_payload(names, values).map_err(js_error)?;
        serialize(&payload)
    }

    /// Simulates from t = 0 using the current compartment values and keeps
    /// the result for `simulation_csv`.
    pub fn simulate(
        &mut self,
        names: Vec<String>,
        values: Vec<f64>,
        t_end: f64,
        step_count: u32,
        solver: &str,
    ) -> Result<JsValue, JsValue> {
        let result = self
            .run_simulation(names, values, t_end, step_count as usize, solver)
            .map_err(js_error)?;
        let payload = SimulationPayload {
            times: &result.times,
            series: &result.series,
            accepted_steps: result.stats.accepted_steps,
            rejected_steps: result.stats.rejected_steps,
            warnings: result.warnings.iter().map(ToString::to_string).collect(),
        };
        serialize(&payload)
    }

    pub fn simulation_csv(&self) -> Result<String, JsValue> {
        self.last_csv().map_err(js_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sir() -> WasmModel {
        let mut model = WasmModel::default();
        model.graph.add_compartment("S", "Susceptible", false).expect("S");
        model.graph.add_compartment("I", "Infected", true).expect("I");
        model.graph.add_compartment("R", "Recovered", false).expect("R");
        model.graph.declare_parameter("beta").expect("beta");
        model.graph.declare_parameter("gamma").expect("gamma");
        model
            .insert_transition(Some("S".into()), Some("I".into()), "beta*S*I", true)
            .expect("infection");
        model
            .insert_transition(Some("I".into()), Some("R".into()), "gamma*I", false)
            .expect("recovery");
        model.graph.set_value("S", 0.99).expect("S value");
        model.graph.set_value("I", 0.01).expect("I value");
        model
    }

    fn sir_parameters() -> (Vec<String>, Vec<f64>) {
        (vec!["beta".into(), "gamma".into()], vec![0.3, 0.1])
    }

    #[test]
    fn equations_are_rendered_both_ways() {
        let payload = sir().equation_payload().expect("equations");
        assert_eq!(payload.len(), 3);
        assert_eq!(payload[2].plaintext, "dR/dt = I*gamma");
        assert_eq!(payload[2].latex, "\\frac{dR}{dt} = I \\gamma");
    }

    #[test]
    fn r0_is_bound_when_values_are_given() {
        let model = sir();
        let symbolic = model.r0_payload(Vec::new(), Vec::new()).expect("symbolic");
        assert_eq!(symbolic.plaintext, "S*beta/gamma");
        assert_eq!(symbolic.value, None);

        let (names, values) = sir_parameters();
        let bound = model.r0_payload(names, values).expect("bound");
        let value = bound.value.expect("value");
        assert!((value - 2.97).abs() < 1e-9);
        assert_eq!(bound.infected, vec!["I"]);
    }

    #[test]
    fn simulation_feeds_the_csv_export() {
        let mut model = sir();
        assert!(model.last_csv().is_err());

        let (names, values) = sir_parameters();
        let result = model
            .run_simulation(names, values, 10.0, 11, "rk4")
            .expect("simulate");
        assert_eq!(result.samples(), 11);

        let csv = model.last_csv().expect("csv");
        assert!(csv.starts_with("Time,Susceptible,Infected,Recovered\n"));
        assert_eq!(csv.lines().count(), 12);
    }

    #[test]
    fn bad_inputs_are_reported() {
        let mut model = sir();
        assert!(bind_parameters(vec!["beta".into()], Vec::new())
            .unwrap_err()
            .contains("mismatch"));
        let (names, values) = sir_parameters();
        assert_eq!(
            model.run_simulation(names, values, 10.0, 11, "euler").unwrap_err(),
            "Unknown solver"
        );
        assert!(model
            .run_simulation(vec!["beta".into()], vec![0.3], 10.0, 11, "tsit5")
            .unwrap_err()
            .contains("gamma"));
    }
}

#[cfg(all(test, target_arch = "wasm32"))]
mod wasm_tests {
    use super::*;
    use wasm_bindgen_test::*;

    #[wasm_bindgen_test]
    fn errors_reach_javascript_as_strings() {
        let mut model = WasmModel::new();
        model.add_compartment("S", "", false).expect("S");
        let err = model.add_compartment("S", "", false).unwrap_err();
        assert!(err.as_string().is_some());
        assert!(model.simulation_csv().is_err());
    }
}
