//! Multi-environment runner: one tokio task per environment, retrieval
//! under timeout and retries, ctrl-c cancellation between changes.

mod error;
pub mod factory;
mod runtime;

pub use error::RunnerError;
pub use factory::{DefaultFactory, EnvironmentFactory};
pub use runtime::{run, start_blocking, Outcome, RunSummary};
