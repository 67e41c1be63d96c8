// packages/engine/src/model/plugins.rs
//! Built-in model plugins
//!
//! - `identity`: leaves the node set untouched and never terminates on its
//!   own; useful for exercising the scheduler. Output column: `nodeCount`.
//! - `aging`: increments every node's `age` each step and terminates when
//!   the mean age reaches the `maxAge` parameter. Output column: `meanAge`.

use crate::attrs::{AttrDef, AttrScope, Attributes, Value};
use crate::graph::{Graph, Nodes};
use crate::model::{Model, ModelFactory, StepOutcome};
use crate::utils::errors::{EngineError, Result};

/// No-op update rule.
#[derive(Default)]
pub struct IdentityModel;

impl Model for IdentityModel {
    fn name(&self) -> &str {
        "identity"
    }

    fn init(&mut self, _nodes: &mut Nodes, _graph: &dyn Graph, _params: &Attributes) -> Result<()> {
        Ok(())
    }

    fn step(&mut self, _nodes: &mut Nodes, _graph: &dyn Graph) -> Result<StepOutcome> {
        Ok(StepOutcome::Continue)
    }

    fn custom_output(&self, column: &str, nodes: &Nodes) -> Option<Value> {
        match column {
            "nodeCount" => Some(Value::ULong(nodes.len() as u64)),
            _ => None,
        }
    }
}

pub struct IdentityModelFactory;

impl ModelFactory for IdentityModelFactory {
    fn id(&self) -> &str {
        "identity"
    }

    fn attrs_scope(&self) -> AttrScope {
        AttrScope::new()
    }

    fn node_attrs_scope(&self) -> AttrScope {
        AttrScope::new()
    }

    fn custom_outputs(&self) -> Vec<String> {
        vec!["nodeCount".to_string()]
    }

    fn create(&self) -> Box<dyn Model> {
        Box::new(IdentityModel)
    }
}

/// Every node ages by one per step; the run terminates once the mean age
/// reaches `maxAge`.
#[derive(Default)]
pub struct AgingModel {
    max_age: i32,
}

impl AgingModel {
    fn mean_age(nodes: &Nodes) -> f64 {
        if nodes.is_empty() {
            return 0.0;
        }
        let total: i64 = nodes
            .iter()
            .map(|n| n.attrs.get("age").and_then(Value::as_int).unwrap_or(0) as i64)
            .sum();
        total as f64 / nodes.len() as f64
    }
}

impl Model for AgingModel {
    fn name(&self) -> &str {
        "aging"
    }

    fn init(&mut self, nodes: &mut Nodes, _graph: &dyn Graph, params: &Attributes) -> Result<()> {
        self.max_age = params
            .get("maxAge")
            .and_then(Value::as_int)
            .ok_or_else(|| EngineError::Config("aging model requires 'maxAge'".into()))?;
        for node in nodes.iter() {
            if node.attrs.get("age").and_then(Value::as_int).is_none() {
                return Err(EngineError::Construction(format!(
                    "node {} is missing the 'age' attribute",
                    node.id
                )));
            }
        }
        Ok(())
    }

    fn step(&mut self, nodes: &mut Nodes, _graph: &dyn Graph) -> Result<StepOutcome> {
        for node in nodes.iter_mut() {
            let age = node.attrs.get("age").and_then(Value::as_int).unwrap_or(0);
            node.attrs.set("age", Value::Int(age.saturating_add(1)));
        }
        if Self::mean_age(nodes) >= f64::from(self.max_age) {
            Ok(StepOutcome::Terminate)
        } else {
            Ok(StepOutcome::Continue)
        }
    }

    fn custom_output(&self, column: &str, nodes: &Nodes) -> Option<Value> {
        match column {
            "meanAge" => Some(Value::Double(Self::mean_age(nodes))),
            _ => None,
        }
    }
}

pub struct AgingModelFactory;

impl ModelFactory for AgingModelFactory {
    fn id(&self) -> &str {
        "aging"
    }

    fn attrs_scope(&self) -> AttrScope {
        AttrScope::new().with("maxAge", AttrDef::Int { min: 1, max: i32::MAX })
    }

    fn node_attrs_scope(&self) -> AttrScope {
        AttrScope::new().with("age", AttrDef::Int { min: 0, max: i32::MAX })
    }

    fn custom_outputs(&self) -> Vec<String> {
        vec!["meanAge".to_string()]
    }

    fn create(&self) -> Box<dyn Model> {
        Box::new(AgingModel::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::plugins::LineGraphFactory;
    use crate::graph::{GraphFactory, GraphType};

    fn line_over(nodes: &Nodes) -> Box<dyn Graph> {
        let mut graph = LineGraphFactory.create();
        graph
            .init(nodes, GraphType::Undirected, &Attributes::new())
            .unwrap();
        graph
    }

    #[test]
    fn test_identity_never_terminates() {
        let factory = IdentityModelFactory;
        let mut nodes = Nodes::from_cmd("*4;min", &factory.node_attrs_scope()).unwrap();
        let graph = line_over(&nodes);

        let mut model = factory.create();
        model.init(&mut nodes, &*graph, &Attributes::new()).unwrap();
        for _ in 0..50 {
            assert_eq!(model.step(&mut nodes, &*graph).unwrap(), StepOutcome::Continue);
        }
        assert_eq!(
            model.custom_output("nodeCount", &nodes),
            Some(Value::ULong(4))
        );
    }

    #[test]
    fn test_aging_terminates_at_max_age() {
        let factory = AgingModelFactory;
        let mut nodes = Nodes::from_cmd("*3;min", &factory.node_attrs_scope()).unwrap();
        let graph = line_over(&nodes);

        let mut params = Attributes::new();
        params.set("maxAge", Value::Int(5));

        let mut model = factory.create();
        model.init(&mut nodes, &*graph, &params).unwrap();

        let mut steps = 0;
        loop {
            steps += 1;
            match model.step(&mut nodes, &*graph).unwrap() {
                StepOutcome::Continue => assert!(steps < 5),
                StepOutcome::Terminate => break,
            }
        }
        assert_eq!(steps, 5);
        assert_eq!(
            model.custom_output("meanAge", &nodes),
            Some(Value::Double(5.0))
        );
    }

    #[test]
    fn test_aging_rejects_missing_params() {
        let factory = AgingModelFactory;
        let mut nodes = Nodes::from_cmd("*3;min", &factory.node_attrs_scope()).unwrap();
        let graph = line_over(&nodes);

        let mut model = factory.create();
        assert!(model.init(&mut nodes, &*graph, &Attributes::new()).is_err());
    }
}
