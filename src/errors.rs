// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] serde_json::Error),

    #[error("Cycle detected in task graph: {0}")]
    GraphCycle(String),

    #[error("Task '{task}' depends on unknown key '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Invalid transition for '{key}': {start} -> {finish} ({stimulus_id})")]
    InvalidTransition {
        key: String,
        start: String,
        finish: String,
        stimulus_id: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Inconsistent state: {0}")]
    InvalidState(String),

    #[error("Too many transitions in one step ({0}); possible transition loop")]
    TransitionLoop(usize),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlotillaError {
    /// Whether this error signals a bookkeeping bug rather than an
    /// environmental problem.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            FlotillaError::InvalidTransition { .. }
                | FlotillaError::InvalidState(_)
                | FlotillaError::TransitionLoop(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlotillaError>;
