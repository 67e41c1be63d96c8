// packages/engine/src/graph/node.rs
//! Nodes and edges
//!
//! A `Nodes` set is the per-trial agent population. It is built once from a
//! descriptor string and then either deep-cloned or moved into trials (the
//! clonable-seed protocol lives in the experiment).

use crate::attrs::{AttrScope, Attributes};
use crate::utils::errors::{EngineError, Result};
use crate::MAX_NODES;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Index of a node within its trial's node set.
pub type NodeId = u32;

/// One agent: a unique id plus the attributes declared by the model's node
/// scope. Neighbourhoods are stored in the graph, not here.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub attrs: Attributes,
}

/// A link to a neighbouring node, optionally carrying its own attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub neighbour: NodeId,
    pub attrs: Option<Attributes>,
}

impl Edge {
    pub fn new(neighbour: NodeId) -> Self {
        Self {
            neighbour,
            attrs: None,
        }
    }
}

/// Ordered neighbourhood of one node.
pub type Neighbours = Vec<Edge>;

/// The node set owned by one trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nodes(Vec<Node>);

impl Nodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a node set from a descriptor: `*N;min`, `*N;max` or
    /// `*N;rand_SEED`, where each node's attributes come from the model's
    /// node scope (minimum, maximum or seeded-uniform values).
    pub fn from_cmd(cmd: &str, node_scope: &AttrScope) -> Result<Nodes> {
        let body = cmd
            .strip_prefix('*')
            .ok_or_else(|| EngineError::Construction(format!("bad node descriptor '{}'", cmd)))?;
        let (count_raw, mode) = body.split_once(';').ok_or_else(|| {
            EngineError::Construction(format!("bad node descriptor '{}': missing mode", cmd))
        })?;

        let count: usize = count_raw.parse().map_err(|_| {
            EngineError::Construction(format!("bad node count '{}' in '{}'", count_raw, cmd))
        })?;
        if count == 0 {
            return Err(EngineError::Construction(
                "node descriptor yields an empty node set".to_string(),
            ));
        }
        if count > MAX_NODES {
            return Err(EngineError::Construction(format!(
                "node descriptor yields {} nodes; the maximum is {}",
                count, MAX_NODES
            )));
        }

        let mut rng = match mode {
            "min" | "max" => None,
            _ => {
                let seed = mode.strip_prefix("rand_").and_then(|s| s.parse::<u64>().ok());
                match seed {
                    Some(seed) => Some(StdRng::seed_from_u64(seed)),
                    None => {
                        return Err(EngineError::Construction(format!(
                            "unknown node descriptor mode '{}'",
                            mode
                        )))
                    }
                }
            }
        };

        let mut nodes = Vec::with_capacity(count);
        for id in 0..count {
            let mut attrs = Attributes::new();
            for (name, def) in node_scope.iter() {
                let value = match (mode, rng.as_mut()) {
                    ("min", _) => def.min_value(),
                    ("max", _) => def.max_value(),
                    (_, Some(rng)) => def.rand_value(rng),
                    _ => unreachable!("mode validated above"),
                };
                attrs.set(name, value);
            }
            nodes.push(Node {
                id: id as NodeId,
                attrs,
            });
        }
        Ok(Nodes(nodes))
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.0.get(id as usize)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.0.get_mut(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{AttrDef, Value};

    fn scope() -> AttrScope {
        AttrScope::new().with("age", AttrDef::Int { min: 0, max: 90 })
    }

    #[test]
    fn test_min_descriptor() {
        let nodes = Nodes::from_cmd("*3;min", &scope()).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes.get(2).unwrap().attrs.get("age"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_max_descriptor() {
        let nodes = Nodes::from_cmd("*2;max", &scope()).unwrap();
        assert_eq!(nodes.get(0).unwrap().attrs.get("age"), Some(&Value::Int(90)));
    }

    #[test]
    fn test_seeded_rand_is_reproducible() {
        let a = Nodes::from_cmd("*10;rand_7", &scope()).unwrap();
        let b = Nodes::from_cmd("*10;rand_7", &scope()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_empty_and_malformed() {
        assert!(Nodes::from_cmd("*0;min", &scope()).is_err());
        assert!(Nodes::from_cmd("5;min", &scope()).is_err());
        assert!(Nodes::from_cmd("*5;speckled", &scope()).is_err());
    }
}
