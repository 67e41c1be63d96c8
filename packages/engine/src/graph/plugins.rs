// packages/engine/src/graph/plugins.rs
//! Built-in graph plugins
//!
//! Plugin loading is out of scope for the engine; these built-ins are
//! registered at startup so experiments can run end-to-end:
//!
//! - `line`: a path over the node order
//! - `cycle`: the line with the ends joined
//! - `random`: Erdős–Rényi with `probability` and `seed` parameters

use crate::attrs::{AttrDef, AttrScope, Attributes, Value};
use crate::graph::{AdjacencyList, Edge, Graph, GraphFactory, GraphType, NodeId, Nodes};
use crate::utils::errors::{EngineError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NO_NEIGHBOURS: &[Edge] = &[];

fn link(adjacency: &mut AdjacencyList, from: NodeId, to: NodeId, graph_type: GraphType) {
    adjacency.entry(from).or_default().push(Edge::new(to));
    if graph_type == GraphType::Undirected {
        adjacency.entry(to).or_default().push(Edge::new(from));
    }
}

/// A path graph: node k is linked to node k+1.
#[derive(Default)]
pub struct LineGraph {
    adjacency: AdjacencyList,
    initial: AdjacencyList,
    population: usize,
    coords: Vec<(f64, f64)>,
}

impl Graph for LineGraph {
    fn name(&self) -> &str {
        "line"
    }

    fn init(&mut self, nodes: &Nodes, graph_type: GraphType, _params: &Attributes) -> Result<()> {
        self.population = nodes.len();
        self.adjacency.clear();
        for id in 0..nodes.len().saturating_sub(1) {
            link(&mut self.adjacency, id as NodeId, id as NodeId + 1, graph_type);
        }
        self.initial = self.adjacency.clone();
        Ok(())
    }

    fn reset_network(&mut self) {
        self.adjacency = self.initial.clone();
    }

    fn neighbours(&self, id: NodeId) -> &[Edge] {
        self.adjacency.get(&id).map_or(NO_NEIGHBOURS, |n| n)
    }

    fn population(&self) -> usize {
        self.population
    }

    fn graph_params(&self) -> Attributes {
        Attributes::new()
    }

    fn build_coordinates(&mut self) -> bool {
        self.coords = (0..self.population).map(|i| (i as f64, 0.0)).collect();
        true
    }

    fn coordinate(&self, id: NodeId) -> Option<(f64, f64)> {
        self.coords.get(id as usize).copied()
    }
}

pub struct LineGraphFactory;

impl GraphFactory for LineGraphFactory {
    fn id(&self) -> &str {
        "line"
    }

    fn attrs_scope(&self) -> AttrScope {
        AttrScope::new()
    }

    fn create(&self) -> Box<dyn Graph> {
        Box::new(LineGraph::default())
    }
}

/// A ring: the line graph with the last node linked back to the first.
#[derive(Default)]
pub struct CycleGraph {
    adjacency: AdjacencyList,
    initial: AdjacencyList,
    population: usize,
    coords: Vec<(f64, f64)>,
}

impl Graph for CycleGraph {
    fn name(&self) -> &str {
        "cycle"
    }

    fn init(&mut self, nodes: &Nodes, graph_type: GraphType, _params: &Attributes) -> Result<()> {
        self.population = nodes.len();
        self.adjacency.clear();
        for id in 0..nodes.len().saturating_sub(1) {
            link(&mut self.adjacency, id as NodeId, id as NodeId + 1, graph_type);
        }
        if nodes.len() > 2 {
            link(&mut self.adjacency, nodes.len() as NodeId - 1, 0, graph_type);
        }
        self.initial = self.adjacency.clone();
        Ok(())
    }

    fn reset_network(&mut self) {
        self.adjacency = self.initial.clone();
    }

    fn neighbours(&self, id: NodeId) -> &[Edge] {
        self.adjacency.get(&id).map_or(NO_NEIGHBOURS, |n| n)
    }

    fn population(&self) -> usize {
        self.population
    }

    fn graph_params(&self) -> Attributes {
        Attributes::new()
    }

    fn build_coordinates(&mut self) -> bool {
        let n = self.population.max(1) as f64;
        self.coords = (0..self.population)
            .map(|i| {
                let angle = (i as f64 / n) * std::f64::consts::TAU;
                (angle.cos(), angle.sin())
            })
            .collect();
        true
    }

    fn coordinate(&self, id: NodeId) -> Option<(f64, f64)> {
        self.coords.get(id as usize).copied()
    }
}

pub struct CycleGraphFactory;

impl GraphFactory for CycleGraphFactory {
    fn id(&self) -> &str {
        "cycle"
    }

    fn attrs_scope(&self) -> AttrScope {
        AttrScope::new()
    }

    fn create(&self) -> Box<dyn Graph> {
        Box::new(CycleGraph::default())
    }
}

/// Erdős–Rényi: each node pair is linked with probability `probability`,
/// drawn from a seeded generator so trials are reproducible.
#[derive(Default)]
pub struct RandomGraph {
    adjacency: AdjacencyList,
    initial: AdjacencyList,
    population: usize,
    probability: f64,
    seed: u64,
}

impl Graph for RandomGraph {
    fn name(&self) -> &str {
        "random"
    }

    fn init(&mut self, nodes: &Nodes, graph_type: GraphType, params: &Attributes) -> Result<()> {
        self.probability = params
            .get("probability")
            .and_then(Value::as_double)
            .ok_or_else(|| EngineError::Config("random graph requires 'probability'".into()))?;
        self.seed = params
            .get("seed")
            .and_then(Value::as_ulong)
            .ok_or_else(|| EngineError::Config("random graph requires 'seed'".into()))?;

        self.population = nodes.len();
        self.adjacency.clear();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let n = nodes.len() as NodeId;
        for a in 0..n {
            for b in (a + 1)..n {
                if rng.gen_bool(self.probability) {
                    link(&mut self.adjacency, a, b, graph_type);
                }
            }
        }
        self.initial = self.adjacency.clone();
        Ok(())
    }

    fn reset_network(&mut self) {
        self.adjacency = self.initial.clone();
    }

    fn neighbours(&self, id: NodeId) -> &[Edge] {
        self.adjacency.get(&id).map_or(NO_NEIGHBOURS, |n| n)
    }

    fn population(&self) -> usize {
        self.population
    }

    fn graph_params(&self) -> Attributes {
        let mut params = Attributes::new();
        params.set("probability", Value::Double(self.probability));
        params.set("seed", Value::ULong(self.seed));
        params
    }
}

pub struct RandomGraphFactory;

impl GraphFactory for RandomGraphFactory {
    fn id(&self) -> &str {
        "random"
    }

    fn attrs_scope(&self) -> AttrScope {
        AttrScope::new()
            .with("probability", AttrDef::Double { min: 0.0, max: 1.0 })
            .with("seed", AttrDef::ULong { min: 0, max: u64::MAX })
    }

    fn create(&self) -> Box<dyn Graph> {
        Box::new(RandomGraph::default())
    }
}
