// packages/engine/src/graph/mod.rs
//! Graph topologies
//!
//! The engine is polymorphic over graph plugins through the `Graph`
//! capability set and a `GraphFactory` registered by id. The adjacency list
//! is authoritative storage: nodes do not duplicate their neighbourhoods.

pub mod node;
pub mod plugins;

pub use node::{Edge, Neighbours, Node, NodeId, Nodes};

use crate::attrs::{AttrScope, Attributes};
use crate::utils::errors::{EngineError, Result};
use std::collections::HashMap;

/// Adjacency: node id to its ordered neighbourhood.
pub type AdjacencyList = HashMap<NodeId, Neighbours>;

/// Whether edges are traversable both ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphType {
    Undirected,
    Directed,
}

impl GraphType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "undirected" => Ok(GraphType::Undirected),
            "directed" => Ok(GraphType::Directed),
            _ => Err(EngineError::Config(format!(
                "unrecognized graph type '{}'",
                raw
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GraphType::Undirected => "undirected",
            GraphType::Directed => "directed",
        }
    }
}

/// Capability set every graph plugin provides.
pub trait Graph: Send {
    /// Plugin name, for diagnostics.
    fn name(&self) -> &str;

    /// Build the topology over a node set. Called once per trial dispatch;
    /// validates the graph parameters.
    fn init(&mut self, nodes: &Nodes, graph_type: GraphType, params: &Attributes) -> Result<()>;

    /// Restore the initial neighbourhood of every node.
    fn reset_network(&mut self);

    /// Ordered neighbourhood of one node. Empty for unknown ids.
    fn neighbours(&self, id: NodeId) -> &[Edge];

    /// Number of nodes the topology was built over.
    fn population(&self) -> usize;

    /// Current value of the graph parameters.
    fn graph_params(&self) -> Attributes;

    /// Optional visualization hook: assign spatial coordinates to nodes.
    /// Plugins without a meaningful embedding return false.
    fn build_coordinates(&mut self) -> bool {
        false
    }

    /// Coordinates assigned by `build_coordinates`, if any.
    fn coordinate(&self, _id: NodeId) -> Option<(f64, f64)> {
        None
    }
}

/// Produces graph instances and describes their parameter scope.
pub trait GraphFactory: Send + Sync {
    fn id(&self) -> &str;

    /// Scope of the graph-specific parameter block.
    fn attrs_scope(&self) -> AttrScope;

    fn create(&self) -> Box<dyn Graph>;
}
