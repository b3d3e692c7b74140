// src/graph/mod.rs

//! Submitted task graphs.
//!
//! - [`spec`] holds the per-task submission record and content-addressed
//!   key generation.
//! - [`validate`] checks a submission against the keys the scheduler
//!   already knows (unknown dependencies, cycles) and yields a
//!   topological order used for priorities.

pub mod spec;
pub mod validate;

pub use spec::{tokenize, TaskSpec};
pub use validate::validate_submission;
