pub mod error;
pub mod orchestration;
pub mod orchestrator;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorStats};
