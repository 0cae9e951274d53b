use crate::config::ConfigError;
use formlern_core::{ArmId, ContextError, SinkError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Context rejected: {0}")]
    Context(#[from] ContextError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Unknown arm: {0}")]
    UnknownArm(ArmId),
    #[error("Decision sink failed: {0}")]
    Sink(SinkError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
