use serde_json::Value;
use tracing::debug;

use crate::config::FlattenConfig;
use crate::error::{KilnError, TraversalError};
use crate::flatten::{has_object_elements, json_type_name, FlattenCache, Flattener, VisitedSet};
use crate::metadata::MetadataGenerator;
use crate::types::TableMap;

/// Recursive array discovery: every array with object elements reachable
/// from a record becomes rows in a child table, linked to the enclosing
/// row's identifier.
///
/// Child rows carry a fresh identifier of their own, and grandchild rows
/// point at their immediate parent element, never at the root record.
#[derive(Debug)]
pub struct Extractor {
    entity: String,
    config: FlattenConfig,
    flattener: Flattener,
    metadata: MetadataGenerator,
}

impl Extractor {
    pub fn new(entity: impl Into<String>, config: FlattenConfig) -> Self {
        let metadata = MetadataGenerator::from_config(&config);
        let flattener = Flattener::new(config.clone());
        Extractor {
            entity: entity.into(),
            config,
            flattener,
            metadata,
        }
    }

    /// Standalone extraction for one record: walks `node` for arrays and
    /// returns the child tables, rows linked to `parent_id`. `path_prefix`
    /// seeds table names (separator-joined; empty for none).
    pub fn extract(
        &self,
        node: &Value,
        parent_id: &str,
        path_prefix: &str,
    ) -> Result<TableMap, KilnError> {
        let mut visited = VisitedSet::new();
        let mut cache = FlattenCache::new();
        let timestamp = MetadataGenerator::batch_timestamp();
        self.extract_tables(
            node,
            parent_id,
            path_prefix,
            &timestamp,
            &mut visited,
            &mut cache,
        )
        .map_err(|err| err.into_kiln(Some(&self.entity)))
    }

    /// Extraction entry point for orchestrated runs: the caller owns the
    /// cycle guard, the shared flatten cache, and the batch timestamp.
    pub(crate) fn extract_tables(
        &self,
        node: &Value,
        parent_id: &str,
        path_prefix: &str,
        timestamp: &str,
        visited: &mut VisitedSet,
        cache: &mut FlattenCache,
    ) -> Result<TableMap, TraversalError> {
        if !node.is_object() {
            return Err(TraversalError::NotARecord {
                found: json_type_name(node),
            });
        }
        let mut path: Vec<String> = self
            .flattener
            .names()
            .split_path(path_prefix)
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut out = TableMap::new();
        self.walk(
            node, parent_id, &mut path, 0, 0, visited, cache, timestamp, &mut out,
        )?;
        Ok(out)
    }

    /// One object level: arrays with object elements become tables, nested
    /// objects are walked under the same parent, everything else belongs to
    /// the flattener.
    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        node: &Value,
        parent_id: &str,
        path: &mut Vec<String>,
        depth: usize,
        table_depth: usize,
        visited: &mut VisitedSet,
        cache: &mut FlattenCache,
        timestamp: &str,
        out: &mut TableMap,
    ) -> Result<(), TraversalError> {
        let Value::Object(fields) = node else {
            return Ok(());
        };
        let names = self.flattener.names();
        if !visited.enter(node) {
            return Err(TraversalError::Cycle {
                path: names.join_path(path),
            });
        }

        let mut outcome = Ok(());
        for (key, value) in fields {
            match value {
                Value::Array(items) if has_object_elements(items) => {
                    if table_depth + 1 > self.config.max_nesting_depth {
                        debug!(
                            field = %key,
                            max_nesting_depth = self.config.max_nesting_depth,
                            "max nesting depth reached, dropping array"
                        );
                        continue;
                    }
                    path.push(names.sanitize(key));
                    outcome = self.extract_array(
                        items,
                        parent_id,
                        path,
                        depth,
                        table_depth + 1,
                        visited,
                        cache,
                        timestamp,
                        out,
                    );
                    path.pop();
                }
                Value::Object(_) => {
                    if depth + 1 > self.config.max_depth {
                        debug!(
                            field = %key,
                            max_depth = self.config.max_depth,
                            "max depth reached, not descending"
                        );
                        continue;
                    }
                    path.push(names.sanitize(key));
                    outcome = self.walk(
                        value,
                        parent_id,
                        path,
                        depth + 1,
                        table_depth,
                        visited,
                        cache,
                        timestamp,
                        out,
                    );
                    path.pop();
                }
                _ => {}
            }
            if outcome.is_err() {
                break;
            }
        }

        visited.leave(node);
        outcome
    }

    /// Turns one array into child-table rows and recurses into each element
    /// with the element's own identifier as the new parent.
    #[allow(clippy::too_many_arguments)]
    fn extract_array(
        &self,
        items: &[Value],
        parent_id: &str,
        path: &mut Vec<String>,
        depth: usize,
        table_depth: usize,
        visited: &mut VisitedSet,
        cache: &mut FlattenCache,
        timestamp: &str,
        out: &mut TableMap,
    ) -> Result<(), TraversalError> {
        let table_name = self.flattener.names().table_name(&self.entity, path);
        let source_field = self.config.id_source_fields.get(&table_name);

        for element in items {
            if !element.is_object() {
                debug!(
                    table = %table_name,
                    element_type = json_type_name(element),
                    "skipping non-object array element"
                );
                continue;
            }

            let mut row = self.flattener.flatten_cached(element, visited, cache)?;
            let row_id = self
                .metadata
                .generate_id(&row, source_field.map(String::as_str));
            MetadataGenerator::annotate(&mut row, &row_id, Some(parent_id), timestamp);
            out.entry(table_name.clone()).or_default().push(row);

            self.walk(
                element,
                &row_id,
                path,
                depth,
                table_depth,
                visited,
                cache,
                timestamp,
                out,
            )?;
        }
        Ok(())
    }
}
