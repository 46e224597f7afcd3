use std::time::Duration;
use thiserror::Error;

/// Every failure the engine reports to its caller.
///
/// Variants are grouped by [`ErrorCategory`]: structural errors come from a
/// model edit and are fixed by correcting that edit, analysis errors require
/// changing the model or its inputs before re-running, and `TimedOut` is a
/// warning that allows a retry with relaxed settings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("Identifier '{0}' is already in use.")]
    DuplicateIdentifier(String),
    #[error("Unknown compartment '{0}'.")]
    UnknownCompartment(String),
    #[error("Invalid expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
    #[error(
        "Compartment '{id}' has {count} dependent transition(s); remove them or cascade the deletion."
    )]
    HasDependentTransitions { id: String, count: usize },
    #[error("The model has no compartments.")]
    EmptyModel,
    #[error("No disease-free equilibrium: {0}")]
    NoDiseaseFreeEquilibrium(String),
    #[error("The transfer matrix V is singular at the disease-free equilibrium.")]
    SingularVMatrix,
    #[error("Unbound parameter(s): {}.", .0.join(", "))]
    UnboundParameter(Vec<String>),
    #[error("Missing initial value for compartment '{0}'.")]
    MissingInitialValue(String),
    #[error("Simulation timed out after {0:?}.")]
    TimedOut(Duration),
    #[error("'{0}' is not a valid identifier.")]
    InvalidIdentifier(String),
    #[error("Unknown transition #{0}.")]
    UnknownTransition(usize),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Invalid compartment order: {0}")]
    InvalidOrder(String),
    #[error("No compartment is marked infectious.")]
    NoInfectedCompartments,
    #[error("Invalid time span: {0}")]
    InvalidTimeSpan(String),
    #[error("Integration failed: {0}")]
    IntegrationFailed(String),
    #[error("Export failed: {0}")]
    Export(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caused by a model edit; correct the edit.
    Structure,
    /// Caused by the model or run inputs; adjust them and re-invoke.
    Analysis,
    /// Not a hard failure; the caller may retry with relaxed settings.
    Warning,
}

impl ModelError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ModelError::DuplicateIdentifier(_)
            | ModelError::UnknownCompartment(_)
            | ModelError::InvalidExpression { .. }
            | ModelError::HasDependentTransitions { .. }
            | ModelError::EmptyModel
            | ModelError::InvalidIdentifier(_)
            | ModelError::UnknownTransition(_)
            | ModelError::InvalidTransition(_)
            | ModelError::InvalidOrder(_) => ErrorCategory::Structure,
            ModelError::TimedOut(_) => ErrorCategory::Warning,
            _ => ErrorCategory::Analysis,
        }
    }
}

impl From<csv::Error> for ModelError {
    fn from(err: csv::Error) -> Self {
        ModelError::Export(err.to_string())
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        ModelError::Export(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_recovery_path() {
        assert_eq!(ModelError::EmptyModel.category(), ErrorCategory::Structure);
        assert_eq!(
            ModelError::SingularVMatrix.category(),
            ErrorCategory::Analysis
        );
        assert_eq!(
            ModelError::MissingInitialValue("S".into()).category(),
            ErrorCategory::Analysis
        );
        assert_eq!(
            ModelError::TimedOut(Duration::from_millis(5)).category(),
            ErrorCategory::Warning
        );
    }

    #[test]
    fn unbound_parameter_lists_every_symbol() {
        let err = ModelError::UnboundParameter(vec!["beta".into(), "gamma".into()]);
        assert_eq!(err.to_string(), "Unbound parameter(s): beta, gamma.");
    }
}
