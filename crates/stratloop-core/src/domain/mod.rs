//! Domain models for stratloop.
//!
//! - `CodeArtifact`: one version of a generated strategy
//! - `ExecutionResult`: what a run of that strategy produced
//! - `TradingParams`: instrument / date range / period for generation
//! - `ForgeError` / `ExecutionError`: the error taxonomy

pub mod artifact;
pub mod error;
pub mod execution;
pub mod params;

pub use artifact::CodeArtifact;
pub use error::{ExecutionError, ForgeError, Result};
pub use execution::ExecutionResult;
pub use params::TradingParams;
