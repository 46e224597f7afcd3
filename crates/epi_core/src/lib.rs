//! The `epi_core` crate is the engine behind the compartmental model builder.
//! A model is edited as a graph of compartments and rate-labelled transitions;
//! everything downstream works on the differential equations derived from it.
//!
//! Key components:
//! - **Model**: `ModelGraph` holds compartments, transitions and vital dynamics.
//! - **Generator**: derives one symbolic equation per compartment.
//! - **R0**: next-generation matrix analysis at the disease-free equilibrium.
//! - **Simulation**: numerical integration (Tsit5, RK4) through the bytecode VM, plus CSV export.
//! - **Symbolic**: the expression type shared by all of the above.

pub mod equation_engine;
pub mod equilibrium;
pub mod error;
pub mod export;
pub mod generator;
pub mod model;
pub mod parameters;
pub mod r0;
pub mod simulation;
pub mod solvers;
pub mod symbolic;
pub mod traits;

pub use error::{ErrorCategory, ModelError};
pub use generator::{generate, DerivedEquation, DerivedSystem};
pub use model::{Compartment, Endpoint, ModelGraph, Transition, VitalDynamics};
pub use parameters::{InitialValues, ParameterSet};
pub use r0::{compute_r0, R0Result};
pub use simulation::{simulate, SimulationResult, SimulationSettings, SolverKind};
pub use symbolic::Expr;
