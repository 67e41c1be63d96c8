// packages/engine/src/model/mod.rs
//! Agent models
//!
//! A model owns the per-step update rule applied to a trial's node set. The
//! engine never sees model internals; it drives the capability set below
//! and reads named output columns for the trial's sinks.

pub mod plugins;

use crate::attrs::{AttrScope, Attributes, Value};
use crate::graph::{Graph, Nodes};
use crate::utils::errors::Result;

/// What the model reported after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep stepping.
    Continue,
    /// The simulation reached its own stopping condition.
    Terminate,
}

/// Capability set every model plugin provides.
pub trait Model: Send {
    /// Plugin name, for diagnostics.
    fn name(&self) -> &str;

    /// Bind the model to a trial's node set and graph. Called once per
    /// trial dispatch; validates the model parameters.
    fn init(&mut self, nodes: &mut Nodes, graph: &dyn Graph, params: &Attributes) -> Result<()>;

    /// Apply one update to the node set.
    fn step(&mut self, nodes: &mut Nodes, graph: &dyn Graph) -> Result<StepOutcome>;

    /// Current value of one named output column, or None if the column is
    /// not one of this model's custom outputs.
    fn custom_output(&self, column: &str, nodes: &Nodes) -> Option<Value>;
}

/// Produces model instances and describes their scopes.
pub trait ModelFactory: Send + Sync {
    fn id(&self) -> &str;

    /// Scope of the model-specific parameter block.
    fn attrs_scope(&self) -> AttrScope;

    /// Scope of the per-node attributes this model expects.
    fn node_attrs_scope(&self) -> AttrScope;

    /// Names of the output columns instances of this model can produce.
    fn custom_outputs(&self) -> Vec<String>;

    fn create(&self) -> Box<dyn Model>;
}
