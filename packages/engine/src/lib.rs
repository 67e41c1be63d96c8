// packages/engine/src/lib.rs
//! Agentnet Simulation Engine Library
//!
//! This library is the execution core of the agentnet multi-agent network
//! simulation platform: experiments run a pluggable agent model over a
//! pluggable graph topology, trial by trial, across a bounded worker pool
//! with cooperative preemption.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: trials, experiments and the worker-pool manager
//! - **attrs**: typed attribute values and validation scopes
//! - **inputs**: parsing and validation of experiment definitions
//! - **graph**: node sets, the graph capability set, built-in topologies
//! - **model**: the model capability set and built-in models
//! - **output**: file-backed per-trial column sinks
//! - **project**: keyed experiment collections with import/save
//! - **app**: the main controller holding registries and the manager
//! - **utils**: configuration, errors and observer channels

pub mod app;
pub mod attrs;
pub mod graph;
pub mod inputs;
pub mod model;
pub mod output;
pub mod project;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use app::App;
pub use attrs::{AttrDef, AttrScope, Attributes, Value};
pub use inputs::{CacheSpec, ExpInputs};
pub use output::Output;
pub use project::Project;
pub use runtime::{ExpStatus, Experiment, ExperimentsMgr, ProcessId, Trial, TrialStatus};
pub use utils::{EngineConfig, EngineError, Result, Signal, SlotId};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard cap on trials per experiment.
pub const MAX_TRIALS: u16 = 1000;

/// Hard cap on nodes per trial.
pub const MAX_NODES: usize = 100_000;

/// Hard cap on the stop-at step.
pub const MAX_STEPS: u64 = 100_000_000;
