// packages/engine/src/inputs.rs
//! Experiment inputs
//!
//! An `ExpInputs` is one validated experiment definition: the general
//! attribute block plus the model- and graph-specific blocks, and the
//! output cache specs. Rows arrive as a header/values pair from a
//! delimited experiments file; model and graph attributes are prefixed
//! `<modelId>_<attr>` / `<graphId>_<attr>` there.
//!
//! Unknown plugin ids do NOT fail parsing: the row is kept with its raw
//! values so the experiment can be created live-but-Invalid and report the
//! resolution error itself.

use crate::app::App;
use crate::attrs::{AttrDef, AttrScope, Attributes, Value};
use crate::utils::errors::{EngineError, Result};
use crate::{MAX_STEPS, MAX_TRIALS};
use std::collections::HashMap;

pub const ATTR_EXPID: &str = "id";
pub const ATTR_TRIALS: &str = "trials";
pub const ATTR_STOPAT: &str = "stopAt";
pub const ATTR_NODES: &str = "nodes";
pub const ATTR_GRAPHID: &str = "graphId";
pub const ATTR_MODELID: &str = "modelId";
pub const ATTR_GRAPHTYPE: &str = "graphType";
pub const ATTR_AUTODELETE: &str = "autoDelete";
pub const ATTR_OUTDIR: &str = "outDir";
pub const ATTR_OUTCOLUMNS: &str = "outColumns";

/// Scope of the general block. The optional attributes accept an empty
/// cell and fall back to a default.
pub fn general_attrs_scope() -> AttrScope {
    AttrScope::new()
        .with(ATTR_EXPID, AttrDef::Int { min: 0, max: i32::MAX })
        .with(ATTR_TRIALS, AttrDef::Int { min: 1, max: MAX_TRIALS as i32 })
        .with(ATTR_STOPAT, AttrDef::ULong { min: 0, max: MAX_STEPS })
        .with(ATTR_NODES, AttrDef::Text)
        .with(ATTR_GRAPHID, AttrDef::Text)
        .with(ATTR_MODELID, AttrDef::Text)
        .with(
            ATTR_GRAPHTYPE,
            AttrDef::Enum(vec!["undirected".to_string(), "directed".to_string()]),
        )
        .with(ATTR_AUTODELETE, AttrDef::Bool)
        .with(ATTR_OUTDIR, AttrDef::Text)
        .with(ATTR_OUTCOLUMNS, AttrDef::Text)
}

fn optional_default(name: &str) -> Option<Value> {
    match name {
        ATTR_AUTODELETE => Some(Value::Bool(false)),
        ATTR_OUTDIR | ATTR_OUTCOLUMNS => Some(Value::Text(String::new())),
        _ => None,
    }
}

/// Columns one output sink should carry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSpec {
    pub columns: Vec<String>,
}

/// One experiment's validated input blocks.
#[derive(Debug, Clone)]
pub struct ExpInputs {
    general: Attributes,
    model: Attributes,
    graph: Attributes,
    caches: Vec<CacheSpec>,
}

impl ExpInputs {
    /// Parse one header/values row. Returns the inputs plus non-fatal
    /// warnings (ignored columns, unresolved plugin scopes).
    pub fn parse(app: &App, header: &[String], values: &[String]) -> Result<(ExpInputs, Vec<String>)> {
        let mut warnings = Vec::new();
        let mut raw: HashMap<&str, &str> = HashMap::new();
        for (i, name) in header.iter().enumerate() {
            let cell = values.get(i).map_or("", |v| v.as_str());
            if raw.insert(name.as_str(), cell).is_some() {
                warnings.push(format!("duplicate column '{}'; last value wins", name));
            }
        }

        // General block first; it names the plugins the other blocks need.
        let general_scope = app.general_attrs_scope();
        let mut general = Attributes::new();
        for (name, def) in general_scope.iter() {
            let cell = raw.remove(name).unwrap_or("");
            let value = if cell.is_empty() {
                optional_default(name).ok_or_else(|| EngineError::InvalidValue {
                    attr: name.to_string(),
                    reason: "required attribute is missing".to_string(),
                })?
            } else {
                def.parse(cell).map_err(|reason| EngineError::InvalidValue {
                    attr: name.to_string(),
                    reason,
                })?
            };
            general.set(name, value);
        }

        let model_id = general
            .get(ATTR_MODELID)
            .and_then(Value::as_text)
            .unwrap_or("")
            .to_string();
        let graph_id = general
            .get(ATTR_GRAPHID)
            .and_then(Value::as_text)
            .unwrap_or("")
            .to_string();

        let model = match app.model(&model_id) {
            Some(factory) => {
                parse_block(&factory.attrs_scope(), &model_id, &mut raw).map_err(
                    |(attr, reason)| EngineError::InvalidValue {
                        attr: format!("{}_{}", model_id, attr),
                        reason,
                    },
                )?
            }
            None => {
                warnings.push(format!(
                    "model plugin '{}' is not registered; its attributes were kept unvalidated",
                    model_id
                ));
                take_prefixed(&model_id, &mut raw)
            }
        };

        let graph = match app.graph(&graph_id) {
            Some(factory) => {
                parse_block(&factory.attrs_scope(), &graph_id, &mut raw).map_err(
                    |(attr, reason)| EngineError::InvalidValue {
                        attr: format!("{}_{}", graph_id, attr),
                        reason,
                    },
                )?
            }
            None => {
                warnings.push(format!(
                    "graph plugin '{}' is not registered; its attributes were kept unvalidated",
                    graph_id
                ));
                take_prefixed(&graph_id, &mut raw)
            }
        };

        for (name, cell) in raw {
            if !cell.is_empty() {
                warnings.push(format!("ignored unknown column '{}'", name));
            }
        }

        // Output caches, declared as a ';'-joined column list.
        let mut caches = Vec::new();
        let out_columns = general
            .get(ATTR_OUTCOLUMNS)
            .and_then(Value::as_text)
            .unwrap_or("");
        if !out_columns.is_empty() {
            let known: Option<Vec<String>> = app.model(&model_id).map(|f| f.custom_outputs());
            let mut columns = Vec::new();
            for column in out_columns.split(';').map(str::trim).filter(|c| !c.is_empty()) {
                let valid = column == "step"
                    || known.as_ref().map_or(true, |k| k.iter().any(|c| c == column));
                if !valid {
                    return Err(EngineError::InvalidValue {
                        attr: ATTR_OUTCOLUMNS.to_string(),
                        reason: format!("'{}' is not an output of model '{}'", column, model_id),
                    });
                }
                columns.push(column.to_string());
            }
            caches.push(CacheSpec { columns });
        }

        Ok((
            ExpInputs {
                general,
                model,
                graph,
                caches,
            },
            warnings,
        ))
    }

    pub fn general(&self, name: &str) -> Option<&Value> {
        self.general.get(name)
    }

    pub fn model_attrs(&self) -> &Attributes {
        &self.model
    }

    pub fn graph_attrs(&self) -> &Attributes {
        &self.graph
    }

    pub fn caches(&self) -> &[CacheSpec] {
        &self.caches
    }

    pub fn exp_id(&self) -> Option<i32> {
        self.general.get(ATTR_EXPID).and_then(Value::as_int)
    }

    pub fn num_trials(&self) -> Option<u16> {
        self.general
            .get(ATTR_TRIALS)
            .and_then(Value::as_int)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn stop_at(&self) -> Option<u64> {
        self.general.get(ATTR_STOPAT).and_then(Value::as_ulong)
    }

    pub fn nodes_cmd(&self) -> &str {
        self.general
            .get(ATTR_NODES)
            .and_then(Value::as_text)
            .unwrap_or("")
    }

    pub fn model_id(&self) -> &str {
        self.general
            .get(ATTR_MODELID)
            .and_then(Value::as_text)
            .unwrap_or("")
    }

    pub fn graph_id(&self) -> &str {
        self.general
            .get(ATTR_GRAPHID)
            .and_then(Value::as_text)
            .unwrap_or("")
    }

    pub fn graph_type_raw(&self) -> &str {
        self.general
            .get(ATTR_GRAPHTYPE)
            .and_then(Value::as_text)
            .unwrap_or("")
    }

    pub fn auto_delete(&self) -> bool {
        self.general
            .get(ATTR_AUTODELETE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn out_dir(&self) -> &str {
        self.general
            .get(ATTR_OUTDIR)
            .and_then(Value::as_text)
            .unwrap_or("")
    }

    /// Attribute names as they appear in an experiments file: general names
    /// plus the prefixed model and graph names.
    pub fn export_attr_names(&self) -> Vec<String> {
        let model_id = self.model_id().to_string();
        let graph_id = self.graph_id().to_string();
        let mut names: Vec<String> = self.general.names().map(str::to_string).collect();
        names.extend(self.model.names().map(|n| format!("{}_{}", model_id, n)));
        names.extend(self.graph.names().map(|n| format!("{}_{}", graph_id, n)));
        names
    }

    /// Look up an exported attribute by its file column name.
    pub fn export_value(&self, column: &str) -> Option<&Value> {
        let model_prefix = format!("{}_", self.model_id());
        let graph_prefix = format!("{}_", self.graph_id());
        if let Some(name) = column.strip_prefix(&model_prefix) {
            if let Some(value) = self.model.get(name) {
                return Some(value);
            }
        }
        if let Some(name) = column.strip_prefix(&graph_prefix) {
            if let Some(value) = self.graph.get(name) {
                return Some(value);
            }
        }
        self.general.get(column)
    }
}

fn parse_block(
    scope: &AttrScope,
    prefix: &str,
    raw: &mut HashMap<&str, &str>,
) -> std::result::Result<Attributes, (String, String)> {
    let mut attrs = Attributes::new();
    for (name, def) in scope.iter() {
        let column = format!("{}_{}", prefix, name);
        let cell = raw.remove(column.as_str()).unwrap_or("");
        if cell.is_empty() {
            return Err((name.to_string(), "required attribute is missing".to_string()));
        }
        let value = def.parse(cell).map_err(|reason| (name.to_string(), reason))?;
        attrs.set(name, value);
    }
    Ok(attrs)
}

/// Keep prefixed columns of an unresolved plugin as raw text.
fn take_prefixed(prefix: &str, raw: &mut HashMap<&str, &str>) -> Attributes {
    let prefix = format!("{}_", prefix);
    let mut attrs = Attributes::new();
    let keys: Vec<String> = raw
        .keys()
        .filter(|k| k.starts_with(&prefix))
        .map(|k| k.to_string())
        .collect();
    for key in keys {
        if let Some(cell) = raw.remove(key.as_str()) {
            if let Some(name) = key.strip_prefix(&prefix) {
                attrs.set(name, Value::Text(cell.to_string()));
            }
        }
    }
    attrs
}
