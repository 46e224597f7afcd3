//! WebAssembly bridge between `epi_core` and the browser model editor.
//!
//! `WasmModel` owns the model graph; editing calls live in `model`, derived
//! equations, R0, simulation and CSV export in `analysis`. Errors reach
//! JavaScript as strings.

mod analysis;
mod model;

pub use model::WasmModel;
