use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::config::FlattenConfig;
use crate::error::{KilnError, TraversalError};
use crate::naming::NameBuilder;
use crate::types::Record;

/// Identity of a source node for the duration of one traversal. Input trees
/// are not mutated while being processed, so addresses are stable.
fn identity(node: &Value) -> usize {
    node as *const Value as usize
}

/// True when the array would contribute rows to a child table: at least one
/// element is an object. Such arrays are the extractor's business; arrays of
/// scalars (or of further arrays) stay with the flattener.
pub(crate) fn has_object_elements(items: &[Value]) -> bool {
    items.iter().any(Value::is_object)
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Node identities active on the current recursion path. Entries are removed
/// on normal return from each node, so a set outlives one record's traversal
/// only when a fault unwound it; callers clear it then.
#[derive(Debug, Default)]
pub struct VisitedSet {
    active: HashSet<usize>,
}

impl VisitedSet {
    pub fn new() -> Self {
        VisitedSet::default()
    }

    /// Marks a node as active. Returns false when the node is already on the
    /// path, which means the traversal has looped.
    pub fn enter(&mut self, node: &Value) -> bool {
        self.active.insert(identity(node))
    }

    pub fn leave(&mut self, node: &Value) {
        self.active.remove(&identity(node));
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Flatten results keyed by node identity, shared across the call sites of
/// one batch so a record flattened for the main table is not recomputed when
/// the extractor revisits it. Addresses are only stable while the input
/// values are alive and unmoved, so the cache must be cleared between
/// batches.
#[derive(Debug, Default)]
pub struct FlattenCache {
    entries: HashMap<usize, Record>,
}

impl FlattenCache {
    pub fn new() -> Self {
        FlattenCache::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How arrays that qualify for extraction are treated in the flat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlattenMode {
    /// Standalone flattening: every array is serialized or expanded in place.
    Full,
    /// Orchestrated flattening: arrays with object elements are omitted from
    /// the flat record because they become child tables.
    SkipTabular,
}

/// Recursive object→flat-record transform.
///
/// Nested objects expand into separator-joined field names; arrays are
/// serialized to one string field or, with `expand_arrays`, expanded with
/// index-qualified names. Depth is checked before every descent and branches
/// past `max_depth` are dropped with a debug event rather than an error.
#[derive(Debug)]
pub struct Flattener {
    config: FlattenConfig,
    names: NameBuilder,
}

impl Flattener {
    pub fn new(config: FlattenConfig) -> Self {
        let names = NameBuilder::from_config(&config);
        Flattener { config, names }
    }

    pub fn names(&self) -> &NameBuilder {
        &self.names
    }

    /// Flattens one object into a flat record. `path_prefix` seeds the field
    /// names (separator-joined; empty for none).
    pub fn flatten(&self, node: &Value, path_prefix: &str) -> Result<Record, KilnError> {
        let mut visited = VisitedSet::new();
        self.flatten_record(node, path_prefix, &mut visited, FlattenMode::Full)
            .map_err(|err| err.into_kiln(None))
    }

    /// Flattening entry point for orchestrated runs: the caller owns the
    /// cycle guard and chooses the array mode.
    pub(crate) fn flatten_record(
        &self,
        node: &Value,
        path_prefix: &str,
        visited: &mut VisitedSet,
        mode: FlattenMode,
    ) -> Result<Record, TraversalError> {
        if !node.is_object() {
            return Err(TraversalError::NotARecord {
                found: json_type_name(node),
            });
        }
        let mut path: Vec<String> = self
            .names
            .split_path(path_prefix)
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut out = Record::new();
        self.descend_object(node, &mut path, 0, visited, mode, &mut out)?;
        Ok(out)
    }

    /// Flattens through the shared cache. Used for orchestrated rows (main
    /// records and array elements), which are always flattened with an empty
    /// prefix and with extractable arrays omitted.
    pub(crate) fn flatten_cached(
        &self,
        node: &Value,
        visited: &mut VisitedSet,
        cache: &mut FlattenCache,
    ) -> Result<Record, TraversalError> {
        let key = identity(node);
        if let Some(record) = cache.entries.get(&key) {
            return Ok(record.clone());
        }
        let record = self.flatten_record(node, "", visited, FlattenMode::SkipTabular)?;
        cache.entries.insert(key, record.clone());
        Ok(record)
    }

    /// Best-effort salvage for the partial-processing recovery policy: keeps
    /// only the top-level scalar fields, never recurses, never fails.
    pub(crate) fn salvage_top_level(&self, node: &Value) -> Record {
        let mut out = Record::new();
        if let Value::Object(fields) = node {
            for (key, value) in fields {
                if value.is_object() || value.is_array() {
                    continue;
                }
                let path = [self.names.sanitize(key)];
                self.emit_scalar(value, &path, &mut out);
            }
        }
        out
    }

    fn descend_object(
        &self,
        node: &Value,
        path: &mut Vec<String>,
        depth: usize,
        visited: &mut VisitedSet,
        mode: FlattenMode,
        out: &mut Record,
    ) -> Result<(), TraversalError> {
        let Value::Object(fields) = node else {
            return Ok(());
        };
        if !visited.enter(node) {
            return Err(TraversalError::Cycle {
                path: self.names.join_path(path),
            });
        }
        let mut outcome = Ok(());
        for (key, value) in fields {
            if let Value::Array(items) = value {
                if mode == FlattenMode::SkipTabular && has_object_elements(items) {
                    continue;
                }
            }
            path.push(self.names.sanitize(key));
            outcome = self.flatten_value(value, path, depth, visited, mode, out);
            path.pop();
            if outcome.is_err() {
                break;
            }
        }
        visited.leave(node);
        outcome
    }

    fn flatten_value(
        &self,
        value: &Value,
        path: &mut Vec<String>,
        depth: usize,
        visited: &mut VisitedSet,
        mode: FlattenMode,
        out: &mut Record,
    ) -> Result<(), TraversalError> {
        match value {
            Value::Object(_) => {
                let next = depth + 1;
                if next > self.config.max_depth {
                    debug!(
                        path = %self.names.join_path(path),
                        max_depth = self.config.max_depth,
                        "max depth reached, dropping nested object"
                    );
                    return Ok(());
                }
                self.descend_object(value, path, next, visited, mode, out)
            }
            Value::Array(items) => {
                if self.config.expand_arrays {
                    let next = depth + 1;
                    if next > self.config.max_depth {
                        debug!(
                            path = %self.names.join_path(path),
                            max_depth = self.config.max_depth,
                            "max depth reached, dropping array"
                        );
                        return Ok(());
                    }
                    self.expand_array(items, path, next, visited, mode, out)
                } else {
                    self.serialize_array(value, path, out)
                }
            }
            scalar => {
                self.emit_scalar(scalar, path, out);
                Ok(())
            }
        }
    }

    fn expand_array(
        &self,
        items: &[Value],
        path: &mut Vec<String>,
        depth: usize,
        visited: &mut VisitedSet,
        mode: FlattenMode,
        out: &mut Record,
    ) -> Result<(), TraversalError> {
        for (index, element) in items.iter().enumerate() {
            path.push(index.to_string());
            let result = match element {
                Value::Object(_) | Value::Array(_) => {
                    self.flatten_value(element, path, depth, visited, mode, out)
                }
                scalar => {
                    self.emit_scalar(scalar, path, out);
                    Ok(())
                }
            };
            path.pop();
            result?;
        }
        Ok(())
    }

    fn serialize_array(
        &self,
        value: &Value,
        path: &mut Vec<String>,
        out: &mut Record,
    ) -> Result<(), TraversalError> {
        let rendered = serde_json::to_string(value).map_err(|err| {
            TraversalError::Unrepresentable {
                path: self.names.join_path(path),
                reason: err.to_string(),
                value: value.clone(),
            }
        })?;
        self.insert_field(path, Value::String(rendered), out);
        Ok(())
    }

    fn emit_scalar(&self, value: &Value, path: &[String], out: &mut Record) {
        let rendered = match value {
            Value::Null => {
                if self.config.skip_null {
                    return;
                }
                // A rendered null is kept even when empty strings are not.
                Value::String(String::new())
            }
            Value::String(s) if s.is_empty() && !self.config.include_empty => return,
            Value::Bool(b) if self.config.cast_to_string => Value::String(b.to_string()),
            Value::Number(n) if self.config.cast_to_string => Value::String(n.to_string()),
            other => other.clone(),
        };
        self.insert_field(path, rendered, out);
    }

    fn insert_field(&self, path: &[String], value: Value, out: &mut Record) {
        let name = self.names.field_name(path);
        if out.insert(name.clone(), value).is_some() {
            debug!(field = %name, "field name collision, keeping latest value");
        }
    }
}
