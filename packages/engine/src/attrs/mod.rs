// packages/engine/src/attrs/mod.rs
//! Attributes and attribute scopes
//!
//! An `AttrScope` describes, in insertion order, the name, type and valid
//! range of each attribute a component accepts. It is immutable after
//! construction and drives both parsing and validation. An `Attributes`
//! instance carries only values, co-ordered with its scope.

pub mod value;

pub use value::Value;

use rand::Rng;

/// Type and valid range of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrDef {
    Bool,
    Int { min: i32, max: i32 },
    ULong { min: u64, max: u64 },
    Double { min: f64, max: f64 },
    Text,
    Enum(Vec<String>),
}

impl AttrDef {
    /// Parse the canonical text form into a value of this definition's tag,
    /// enforcing the range.
    pub fn parse(&self, raw: &str) -> Result<Value, String> {
        let value = match self {
            AttrDef::Bool => raw
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|_| format!("'{}' is not a bool", raw))?,
            AttrDef::Int { .. } => raw
                .parse::<i32>()
                .map(Value::Int)
                .map_err(|_| format!("'{}' is not an int", raw))?,
            AttrDef::ULong { .. } => raw
                .parse::<u64>()
                .map(Value::ULong)
                .map_err(|_| format!("'{}' is not an unsigned integer", raw))?,
            AttrDef::Double { .. } => raw
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| format!("'{}' is not a double", raw))?,
            AttrDef::Text => Value::Text(raw.to_string()),
            AttrDef::Enum(options) => {
                if options.iter().any(|o| o == raw) {
                    Value::Text(raw.to_string())
                } else {
                    return Err(format!("'{}' is not one of {:?}", raw, options));
                }
            }
        };
        if !self.validate(&value) {
            return Err(format!("{} is out of range", value));
        }
        Ok(value)
    }

    /// Check a value against this definition's tag and range.
    pub fn validate(&self, value: &Value) -> bool {
        match (self, value) {
            (AttrDef::Bool, Value::Bool(_)) => true,
            (AttrDef::Int { min, max }, Value::Int(v)) => v >= min && v <= max,
            (AttrDef::ULong { min, max }, Value::ULong(v)) => v >= min && v <= max,
            (AttrDef::Double { min, max }, Value::Double(v)) => v >= min && v <= max,
            (AttrDef::Text, Value::Text(_)) => true,
            (AttrDef::Enum(options), Value::Text(s)) => options.iter().any(|o| o == s),
            _ => false,
        }
    }

    /// Smallest valid value (used by the `*N;min` node descriptor).
    pub fn min_value(&self) -> Value {
        match self {
            AttrDef::Bool => Value::Bool(false),
            AttrDef::Int { min, .. } => Value::Int(*min),
            AttrDef::ULong { min, .. } => Value::ULong(*min),
            AttrDef::Double { min, .. } => Value::Double(*min),
            AttrDef::Text => Value::Text(String::new()),
            AttrDef::Enum(options) => Value::Text(options.first().cloned().unwrap_or_default()),
        }
    }

    /// Largest valid value (used by the `*N;max` node descriptor).
    pub fn max_value(&self) -> Value {
        match self {
            AttrDef::Bool => Value::Bool(true),
            AttrDef::Int { max, .. } => Value::Int(*max),
            AttrDef::ULong { max, .. } => Value::ULong(*max),
            AttrDef::Double { max, .. } => Value::Double(*max),
            AttrDef::Text => Value::Text(String::new()),
            AttrDef::Enum(options) => Value::Text(options.last().cloned().unwrap_or_default()),
        }
    }

    /// Uniformly random valid value (used by the `*N;rand_SEED` descriptor).
    pub fn rand_value<R: Rng>(&self, rng: &mut R) -> Value {
        match self {
            AttrDef::Bool => Value::Bool(rng.gen()),
            AttrDef::Int { min, max } => Value::Int(rng.gen_range(*min..=*max)),
            AttrDef::ULong { min, max } => Value::ULong(rng.gen_range(*min..=*max)),
            AttrDef::Double { min, max } => Value::Double(rng.gen_range(*min..=*max)),
            AttrDef::Text => Value::Text(String::new()),
            AttrDef::Enum(options) => {
                let i = rng.gen_range(0..options.len().max(1));
                Value::Text(options.get(i).cloned().unwrap_or_default())
            }
        }
    }
}

/// Ordered mapping from attribute name to its definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrScope {
    entries: Vec<(String, AttrDef)>,
}

impl AttrScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion; last definition wins on duplicate names.
    pub fn with(mut self, name: &str, def: AttrDef) -> Self {
        self.entries.retain(|(n, _)| n != name);
        self.entries.push((name.to_string(), def));
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrDef> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrDef)> {
        self.entries.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered mapping from attribute name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: Vec<(String, Value)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every entry against a scope, and every scope entry for
    /// presence. Returns the first offending attribute name.
    pub fn validate(&self, scope: &AttrScope) -> Result<(), String> {
        for (name, def) in scope.iter() {
            match self.get(name) {
                Some(value) if def.validate(value) => {}
                Some(value) => {
                    return Err(format!("'{}' rejected value {}", name, value));
                }
                None => return Err(format!("'{}' is missing", name)),
            }
        }
        Ok(())
    }
}
