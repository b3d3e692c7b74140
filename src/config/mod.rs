// src/config/mod.rs

//! Configuration loading and validation for flotilla.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Parse duration strings (`duration.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate limits and the task graph (`validate.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{default_config_path, load_and_validate, load_from_path, load_from_str};
pub use model::{
    AmmConfig, ConfigFile, RawConfigFile, ResolvedWorker, SchedulerConfig, TaskConfig,
    WorkerConfig, WorkerDefaults,
};
