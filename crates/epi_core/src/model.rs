//! The model graph: compartments, transitions between them and the
//! vital-dynamics switches.
//!
//! The graph only stores and validates structure. Equations are derived from
//! it by [`crate::generator::generate`] and never written back.

use crate::equation_engine::parse;
use crate::error::ModelError;
use crate::parameters::InitialValues;
use crate::symbolic::{Expr, Func};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Birth rate symbol added to the first compartment when births are on.
pub const BIRTH_SYMBOL: &str = "tau";
/// Per-capita death rate symbol applied to every compartment when deaths are on.
pub const DEATH_SYMBOL: &str = "mu";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compartment {
    pub id: String,
    pub label: String,
    pub is_infectious: bool,
    /// Current value, used as the initial condition of simulations and as
    /// the value of a free disease-free-equilibrium coordinate.
    pub value: f64,
}

/// One end of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// Flows entering or leaving the modelled population.
    Outside,
    Compartment(String),
}

impl Endpoint {
    pub fn compartment(&self) -> Option<&str> {
        match self {
            Endpoint::Outside => None,
            Endpoint::Compartment(id) => Some(id),
        }
    }

    pub fn is(&self, id: &str) -> bool {
        self.compartment() == Some(id)
    }
}

impl From<&str> for Endpoint {
    fn from(id: &str) -> Self {
        Endpoint::Compartment(id.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(id: String) -> Self {
        Endpoint::Compartment(id)
    }
}

impl From<Option<String>> for Endpoint {
    fn from(id: Option<String>) -> Self {
        id.map_or(Endpoint::Outside, Endpoint::Compartment)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Outside => f.write_str("Outside"),
            Endpoint::Compartment(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Stable id, never reused within a graph.
    pub id: usize,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub rate: Expr,
    /// The rate as the user typed it.
    pub rate_text: String,
    /// Marks the flow as creating new infections (the F part of the
    /// next-generation split).
    pub is_infection: bool,
    pub description: Option<String>,
}

impl Transition {
    pub fn touches(&self, id: &str) -> bool {
        self.source.is(id) || self.destination.is(id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VitalDynamics {
    pub birth: bool,
    pub death: bool,
}

impl VitalDynamics {
    pub fn reserved_symbols(&self) -> Vec<&'static str> {
        let mut symbols = Vec::new();
        if self.birth {
            symbols.push(BIRTH_SYMBOL);
        }
        if self.death {
            symbols.push(DEATH_SYMBOL);
        }
        symbols
    }
}

/// Returns true for names usable as compartment or parameter symbols.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_');
    starts_well
        && chars.all(|c| c.is_alphanumeric() || c == '_')
        && Func::from_name(name).is_none()
        && name != "sqrt"
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelGraph {
    compartments: Vec<Compartment>,
    transitions: Vec<Transition>,
    parameters: BTreeSet<String>,
    vital_dynamics: VitalDynamics,
    next_transition_id: usize,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn compartment(&self, id: &str) -> Option<&Compartment> {
        self.compartments.iter().find(|c| c.id == id)
    }

    pub fn compartment_ids(&self) -> Vec<String> {
        self.compartments.iter().map(|c| c.id.clone()).collect()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.compartments.iter().position(|c| c.id == id)
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn transition(&self, id: usize) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.id == id)
    }

    pub fn parameters(&self) -> &BTreeSet<String> {
        &self.parameters
    }

    pub fn vital_dynamics(&self) -> VitalDynamics {
        self.vital_dynamics
    }

    pub fn is_empty(&self) -> bool {
        self.compartments.is_empty()
    }

    fn compartment_mut(&mut self, id: &str) -> Result<&mut Compartment, ModelError> {
        self.compartments
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ModelError::UnknownCompartment(id.to_string()))
    }

    fn transition_mut(&mut self, id: usize) -> Result<&mut Transition, ModelError> {
        self.transitions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(ModelError::UnknownTransition(id))
    }

    /// Adds a compartment at the end of the order. An empty label falls back
    /// to the id.
    pub fn add_compartment(
        &mut self,
        id: &str,
        label: &str,
        is_infectious: bool,
    ) -> Result<&Compartment, ModelError> {
        if !is_identifier(id) {
            return Err(ModelError::InvalidIdentifier(id.to_string()));
        }
        if self.compartment(id).is_some()
            || self.parameters.contains(id)
            || self.vital_dynamics.reserved_symbols().contains(&id)
        {
            return Err(ModelError::DuplicateIdentifier(id.to_string()));
        }

        debug!("Adding compartment '{id}' (infectious: {is_infectious})");
        self.compartments.push(Compartment {
            id: id.to_string(),
            label: if label.is_empty() { id.to_string() } else { label.to_string() },
            is_infectious,
            value: 0.0,
        });
        let index = self.compartments.len() - 1;
        Ok(&self.compartments[index])
    }

    /// Registers a free parameter symbol that rate expressions may use.
    /// Declaring an existing parameter again is a no-op.
    pub fn declare_parameter(&mut self, name: &str) -> Result<(), ModelError> {
        if !is_identifier(name) {
            return Err(ModelError::InvalidIdentifier(name.to_string()));
        }
        if self.compartment(name).is_some() {
            return Err(ModelError::DuplicateIdentifier(name.to_string()));
        }
        self.parameters.insert(name.to_string());
        Ok(())
    }

    pub fn add_transition(
        &mut self,
        source: impl Into<Endpoint>,
        destination: impl Into<Endpoint>,
        rate: &str,
    ) -> Result<&Transition, ModelError> {
        self.insert_transition(source.into(), destination.into(), rate, false)
    }

    /// Adds a transition tagged as producing new infections.
    pub fn add_infection_transition(
        &mut self,
        source: impl Into<Endpoint>,
        destination: impl Into<Endpoint>,
        rate: &str,
    ) -> Result<&Transition, ModelError> {
        self.insert_transition(source.into(), destination.into(), rate, true)
    }

    fn insert_transition(
        &mut self,
        source: Endpoint,
        destination: Endpoint,
        rate_text: &str,
        is_infection: bool,
    ) -> Result<&Transition, ModelError> {
        if source == Endpoint::Outside && destination == Endpoint::Outside {
            return Err(ModelError::InvalidTransition(
                "a transition needs at least one compartment endpoint".to_string(),
            ));
        }
        for endpoint in [&source, &destination] {
            if let Some(id) = endpoint.compartment() {
                if self.compartment(id).is_none() {
                    return Err(ModelError::UnknownCompartment(id.to_string()));
                }
            }
        }
        let rate = self.parse_rate(rate_text)?;

        let id = self.next_transition_id;
        self.next_transition_id += 1;
        debug!("Adding transition #{id}: {source} -> {destination} at rate {rate}");
        self.transitions.push(Transition {
            id,
            source,
            destination,
            rate,
            rate_text: rate_text.to_string(),
            is_infection,
            description: None,
        });
        let index = self.transitions.len() - 1;
        Ok(&self.transitions[index])
    }

    fn known_symbol(&self, name: &str) -> bool {
        self.compartment(name).is_some()
            || self.parameters.contains(name)
            || self.vital_dynamics.reserved_symbols().contains(&name)
    }

    fn parse_rate(&self, text: &str) -> Result<Expr, ModelError> {
        let invalid = |reason: String| ModelError::InvalidExpression {
            expression: text.to_string(),
            reason,
        };
        let rate = parse(text).map_err(invalid)?;
        if let Some(unknown) = rate.free_symbols().into_iter().find(|s| !self.known_symbol(s)) {
            return Err(invalid(format!(
                "'{unknown}' is neither a compartment nor a declared parameter"
            )));
        }
        Ok(rate.simplify())
    }

    /// Replaces the rate of an existing transition.
    pub fn set_rate(&mut self, transition: usize, rate_text: &str) -> Result<(), ModelError> {
        self.transition(transition)
            .ok_or(ModelError::UnknownTransition(transition))?;
        let rate = self.parse_rate(rate_text)?;
        let entry = self.transition_mut(transition)?;
        entry.rate = rate;
        entry.rate_text = rate_text.to_string();
        Ok(())
    }

    pub fn set_description(
        &mut self,
        transition: usize,
        description: Option<String>,
    ) -> Result<(), ModelError> {
        self.transition_mut(transition)?.description = description;
        Ok(())
    }

    /// Reorders compartments. `order` must name every compartment exactly once.
    pub fn reorder<S: AsRef<str>>(&mut self, order: &[S]) -> Result<(), ModelError> {
        if order.len() != self.compartments.len() {
            return Err(ModelError::InvalidOrder(format!(
                "expected {} compartments, got {}",
                self.compartments.len(),
                order.len()
            )));
        }
        let mut seen = HashSet::new();
        let mut reordered = Vec::with_capacity(order.len());
        for id in order {
            let id = id.as_ref();
            if !seen.insert(id) {
                return Err(ModelError::InvalidOrder(format!("'{id}' appears twice")));
            }
            let compartment = self
                .compartment(id)
                .ok_or_else(|| ModelError::InvalidOrder(format!("unknown compartment '{id}'")))?;
            reordered.push(compartment.clone());
        }
        self.compartments = reordered;
        Ok(())
    }

    /// Moves one compartment to `index`, shifting the others.
    pub fn move_compartment(&mut self, id: &str, index: usize) -> Result<(), ModelError> {
        let from = self
            .position(id)
            .ok_or_else(|| ModelError::UnknownCompartment(id.to_string()))?;
        if index >= self.compartments.len() {
            return Err(ModelError::InvalidOrder(format!(
                "index {index} is out of range for {} compartments",
                self.compartments.len()
            )));
        }
        let compartment = self.compartments.remove(from);
        self.compartments.insert(index, compartment);
        Ok(())
    }

    /// Flips the infectious flag and returns the new value.
    pub fn toggle_infectious(&mut self, id: &str) -> Result<bool, ModelError> {
        let compartment = self.compartment_mut(id)?;
        compartment.is_infectious = !compartment.is_infectious;
        Ok(compartment.is_infectious)
    }

    pub fn set_infectious(&mut self, id: &str, is_infectious: bool) -> Result<(), ModelError> {
        self.compartment_mut(id)?.is_infectious = is_infectious;
        Ok(())
    }

    pub fn set_label(&mut self, id: &str, label: &str) -> Result<(), ModelError> {
        self.compartment_mut(id)?.label = label.to_string();
        Ok(())
    }

    pub fn set_infection_tag(&mut self, transition: usize, tag: bool) -> Result<(), ModelError> {
        self.transition_mut(transition)?.is_infection = tag;
        Ok(())
    }

    /// Tags every untagged transition that moves individuals from a
    /// non-infectious compartment into an infectious one. Returns how many
    /// transitions were newly tagged.
    pub fn infer_infection_tags(&mut self) -> usize {
        let infectious: HashSet<String> = self
            .compartments
            .iter()
            .filter(|c| c.is_infectious)
            .map(|c| c.id.clone())
            .collect();
        let mut tagged = 0;
        for transition in &mut self.transitions {
            let from_susceptible = transition
                .source
                .compartment()
                .is_some_and(|id| !infectious.contains(id));
            let into_infectious = transition
                .destination
                .compartment()
                .is_some_and(|id| infectious.contains(id));
            if from_susceptible && into_infectious && !transition.is_infection {
                transition.is_infection = true;
                tagged += 1;
            }
        }
        tagged
    }

    /// Transitions that would dangle without `id`: those with it as an
    /// endpoint and those whose rate mentions its symbol.
    pub fn dependent_transitions(&self, id: &str) -> Vec<usize> {
        self.transitions
            .iter()
            .filter(|t| t.touches(id) || t.rate.contains_symbol(id))
            .map(|t| t.id)
            .collect()
    }

    pub fn remove_compartment(&mut self, id: &str, cascade: bool) -> Result<Compartment, ModelError> {
        let index = self
            .position(id)
            .ok_or_else(|| ModelError::UnknownCompartment(id.to_string()))?;
        let dependents = self.dependent_transitions(id);
        if !dependents.is_empty() && !cascade {
            return Err(ModelError::HasDependentTransitions {
                id: id.to_string(),
                count: dependents.len(),
            });
        }
        if !dependents.is_empty() {
            debug!("Removing {} transition(s) with compartment '{id}'", dependents.len());
        }
        self.transitions.retain(|t| !dependents.contains(&t.id));
        Ok(self.compartments.remove(index))
    }

    pub fn remove_transition(&mut self, id: usize) -> Result<Transition, ModelError> {
        let index = self
            .transitions
            .iter()
            .position(|t| t.id == id)
            .ok_or(ModelError::UnknownTransition(id))?;
        Ok(self.transitions.remove(index))
    }

    pub fn set_value(&mut self, id: &str, value: f64) -> Result<(), ModelError> {
        self.compartment_mut(id)?.value = value;
        Ok(())
    }

    pub fn initial_values(&self) -> InitialValues {
        self.compartments
            .iter()
            .map(|c| (c.id.clone(), c.value))
            .collect()
    }

    /// Switches births and deaths on or off. Enabling requires the reserved
    /// symbol to be free; disabling requires no rate to still use it, unless
    /// it is also a declared parameter.
    pub fn set_vital_dynamics(&mut self, vital: VitalDynamics) -> Result<(), ModelError> {
        for symbol in vital.reserved_symbols() {
            if self.compartment(symbol).is_some() {
                return Err(ModelError::DuplicateIdentifier(symbol.to_string()));
            }
        }
        for symbol in self.vital_dynamics.reserved_symbols() {
            if vital.reserved_symbols().contains(&symbol) || self.parameters.contains(symbol) {
                continue;
            }
            if let Some(t) = self.transitions.iter().find(|t| t.rate.contains_symbol(symbol)) {
                return Err(ModelError::InvalidExpression {
                    expression: t.rate_text.clone(),
                    reason: format!("'{symbol}' is only defined while vital dynamics use it"),
                });
            }
        }
        self.vital_dynamics = vital;
        Ok(())
    }
}
