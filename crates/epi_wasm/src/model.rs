//! Mutable model handle and graph editing calls.

use epi_core::error::ModelError;
use epi_core::model::{Endpoint, ModelGraph, VitalDynamics};
use epi_core::simulation::SimulationResult;
use serde_wasm_bindgen::to_value;
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
#[derive(Default)]
pub struct WasmModel {
    pub(crate) graph: ModelGraph,
    pub(crate) last_result: Option<SimulationResult>,
}

pub(crate) fn js_error(err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

pub(crate) fn serialize<T: serde::Serialize>(value: &T) -> Result<JsValue, JsValue> {
    to_value(value).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

impl WasmModel {
    pub(crate) fn insert_transition(
        &mut self,
        source: Option<String>,
        destination: Option<String>,
        rate: &str,
        infection: bool,
    ) -> Result<usize, ModelError> {
        // `None` stands for the outside of the modelled population.
        let (source, destination) = (Endpoint::from(source), Endpoint::from(destination));
        let transition = if infection {
            self.graph.add_infection_transition(source, destination, rate)?
        } else {
            self.graph.add_transition(source, destination, rate)?
        };
        Ok(transition.id)
    }
}

#[wasm_bindgen]
impl WasmModel {
    #[wasm_bindgen(constructor)]
    pub fn new() -> WasmModel {
        console_error_panic_hook::set_once();
        WasmModel::default()
    }

    pub fn add_compartment(&mut self, id: &str, label: &str, infectious: bool) -> Result<(), JsValue> {
        self.graph
            .add_compartment(id, label, infectious)
            .map(|_| ())
            .map_err(js_error)
    }

    /// Removes a compartment. Without `cascade` the call fails while any
    /// transition still depends on it.
    pub fn remove_compartment(&mut self, id: &str, cascade: bool) -> Result<(), JsValue> {
        self.graph.remove_compartment(id, cascade).map(|_| ()).map_err(js_error)
    }

    pub fn dependent_transitions(&self, id: &str) -> Vec<u32> {
        self.graph
            .dependent_transitions(id)
            .into_iter()
            .map(|t| t as u32)
            .collect()
    }

    pub fn declare_parameter(&mut self, name: &str) -> Result<(), JsValue> {
        self.graph.declare_parameter(name).map_err(js_error)
    }

    pub fn add_transition(
        &mut self,
        source: Option<String>,
        destination: Option<String>,
        rate: &str,
        infection: bool,
    ) -> Result<u32, JsValue> {
        self.insert_transition(source, destination, rate, infection)
            .map(|id| id as u32)
            .map_err(js_error)
    }

    pub fn remove_transition(&mut self, id: u32) -> Result<(), JsValue> {
        self.graph.remove_transition(id as usize).map(|_| ()).map_err(js_error)
    }

    pub fn set_rate(&mut self, id: u32, rate: &str) -> Result<(), JsValue> {
        self.graph.set_rate(id as usize, rate).map_err(js_error)
    }

    pub fn set_description(&mut self, id: u32, description: Option<String>) -> Result<(), JsValue> {
        self.graph.set_description(id as usize, description).map_err(js_error)
    }

    pub fn set_infection_tag(&mut self, id: u32, tag: bool) -> Result<(), JsValue> {
        self.graph.set_infection_tag(id as usize, tag).map_err(js_error)
    }

    pub fn infer_infection_tags(&mut self) -> u32 {
        self.graph.infer_infection_tags() as u32
    }

    pub fn reorder(&mut self, order: Vec<String>) -> Result<(), JsValue> {
        self.graph.reorder(&order).map_err(js_error)
    }

    pub fn move_compartment(&mut self, id: &str, index: u32) -> Result<(), JsValue> {
        self.graph.move_compartment(id, index as usize).map_err(js_error)
    }

    pub fn toggle_infectious(&mut self, id: &str) -> Result<bool, JsValue> {
        self.graph.toggle_infectious(id).map_err(js_error)
    }

    pub fn set_label(&mut self, id: &str, label: &str) -> Result<(), JsValue> {
        self.graph.set_label(id, label).map_err(js_error)
    }

    pub fn set_value(&mut self, id: &str, value: f64) -> Result<(), JsValue> {
        self.graph.set_value(id, value).map_err(js_error)
    }

    pub fn set_vital_dynamics(&mut self, birth: bool, death: bool) -> Result<(), JsValue> {
        self.graph
            .set_vital_dynamics(VitalDynamics { birth, death })
            .map_err(js_error)
    }

    pub fn compartments(&self) -> Result<JsValue, JsValue> {
        serialize(&self.graph.compartments())
    }

    pub fn transitions(&self) -> Result<JsValue, JsValue> {
        serialize(&self.graph.transitions())
    }

    /// The whole graph, for saving editor state.
    pub fn snapshot(&self) -> Result<JsValue, JsValue> {
        serialize(&self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_endpoints_come_from_missing_ids() {
        let mut model = WasmModel::default();
        model.graph.add_compartment("S", "", false).expect("S");
        model.graph.declare_parameter("lambda").expect("lambda");
        let id = model
            .insert_transition(None, Some("S".into()), "lambda", false)
            .expect("immigration");
        let transition = model.graph.transition(id).expect("stored");
        assert_eq!(transition.source, Endpoint::Outside);
        assert_eq!(transition.destination, Endpoint::from("S"));
        assert!(!transition.is_infection);
    }

    #[test]
    fn infection_flag_tags_the_transition() {
        let mut model = WasmModel::default();
        model.graph.add_compartment("S", "", false).expect("S");
        model.graph.add_compartment("I", "", true).expect("I");
        model.graph.declare_parameter("beta").expect("beta");
        let id = model
            .insert_transition(Some("S".into()), Some("I".into()), "beta*S*I", true)
            .expect("infection");
        assert!(model.graph.transition(id).expect("stored").is_infection);
        assert_eq!(model.dependent_transitions("S"), vec![id as u32]);
    }
}
