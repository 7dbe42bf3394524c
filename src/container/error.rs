//! Orchestration error handling

use thiserror::Error;

/// Errors surfaced by the orchestration client.
///
/// Runtime failures never show up here: they are logged and turned into a
/// failed [`ContainerCreationStatus`](crate::models::ContainerCreationStatus).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),
}
