//! Drives flattening, metadata assignment and array extraction across whole
//! inputs: all at once, in fixed-size batches, or over a pull-based stream.

use serde_json::Value;

use crate::config::FlattenConfig;
use crate::error::{FieldViolation, KilnError};
use crate::extract::Extractor;
use crate::flatten::{FlattenCache, Flattener, VisitedSet};
use crate::metadata::MetadataGenerator;
use crate::naming::NameBuilder;
use crate::recovery::{FaultContext, RecoveryDecision, RecoveryStrategy};
use crate::types::{ProcessingResult, Record};

/// Per-record outcome of the flatten pass.
enum Flattened {
    Ready(Record),
    Salvaged(Record),
    Skipped,
}

/// Per-record state after metadata assignment. `Full` rows go through
/// extraction; `Partial` rows are kept without children.
enum Slot {
    Full { row: Record, id: String },
    Partial { row: Record, id: String },
    Empty,
}

/// Orchestrates the transform for one entity.
///
/// The three strategies ([`process`], [`process_batched`], [`process_stream`])
/// produce equivalent output for the same input: every top-level record gets
/// exactly one root identifier, and every reachable array of objects becomes
/// rows in the same-named child table, linked to its immediate parent.
///
/// [`process`]: HierarchyProcessor::process
/// [`process_batched`]: HierarchyProcessor::process_batched
/// [`process_stream`]: HierarchyProcessor::process_stream
#[derive(Debug)]
pub struct HierarchyProcessor {
    entity: String,
    config: FlattenConfig,
    flattener: Flattener,
    extractor: Extractor,
    metadata: MetadataGenerator,
    recovery: RecoveryStrategy,
    source: Option<String>,
}

impl HierarchyProcessor {
    /// Validates the configuration and entity name up front; nothing past
    /// this point reports configuration faults.
    pub fn new(entity: impl Into<String>, mut config: FlattenConfig) -> Result<Self, KilnError> {
        config.validate()?;
        let raw_entity = entity.into();
        if raw_entity.trim().is_empty() {
            return Err(KilnError::Validation {
                message: String::from("entity name must not be empty"),
                violations: vec![FieldViolation {
                    field: String::from("entity"),
                    message: String::from("empty name"),
                }],
            });
        }
        let names = NameBuilder::from_config(&config);
        let entity = names.sanitize(&raw_entity);
        // Identifier lookups key on emitted table names, so raw caller
        // spellings (dots, hyphens, spaces) take the same cleanup as the
        // entity itself.
        config.id_source_fields = std::mem::take(&mut config.id_source_fields)
            .into_iter()
            .map(|(table, field)| (names.sanitize(&table), field))
            .collect();
        let flattener = Flattener::new(config.clone());
        let extractor = Extractor::new(entity.clone(), config.clone());
        let metadata = MetadataGenerator::from_config(&config);
        Ok(HierarchyProcessor {
            entity,
            config,
            flattener,
            extractor,
            metadata,
            recovery: RecoveryStrategy::default(),
            source: None,
        })
    }

    /// Replaces the default strict policy.
    pub fn with_recovery(mut self, recovery: RecoveryStrategy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Labels the input source (file name, stream name) for fault context.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Entity name after sanitization; leads every table name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn config(&self) -> &FlattenConfig {
        &self.config
    }

    pub fn process_one(&self, record: &Value) -> Result<ProcessingResult, KilnError> {
        self.process(std::slice::from_ref(record))
    }

    /// Single-pass strategy: flattens every record first (filling the shared
    /// cache), assigns metadata, then extracts child tables reusing the
    /// cache. One timestamp covers the whole call.
    pub fn process(&self, records: &[Value]) -> Result<ProcessingResult, KilnError> {
        let mut visited = VisitedSet::new();
        let mut cache = FlattenCache::new();
        let timestamp = MetadataGenerator::batch_timestamp();
        let indices: Vec<usize> = (0..records.len()).collect();
        self.process_batch(records, &indices, &timestamp, &mut visited, &mut cache)
    }

    /// Batched strategy: fixed-size sub-batches processed in order, caches
    /// cleared between them. Bounded memory for large inputs.
    pub fn process_batched(&self, records: &[Value]) -> Result<ProcessingResult, KilnError> {
        let mut combined = ProcessingResult {
            entity: self.entity.clone(),
            ..ProcessingResult::default()
        };
        let mut visited = VisitedSet::new();
        let mut cache = FlattenCache::new();
        let mut offset = 0;
        for chunk in records.chunks(self.config.batch_size) {
            let timestamp = MetadataGenerator::batch_timestamp();
            let indices: Vec<usize> = (offset..offset + chunk.len()).collect();
            let partial = self.process_batch(chunk, &indices, &timestamp, &mut visited, &mut cache)?;
            combined.merge(partial);
            offset += chunk.len();
            // The cache keys on node addresses, which the next chunk's
            // values may reuse.
            cache.clear();
            visited.clear();
        }
        Ok(combined)
    }

    /// Streaming strategy: pulls records from the iterator one at a time and
    /// drives batched processing over bounded chunks. Reader faults are
    /// routed through the recovery policy like any other per-record fault;
    /// tables keep their identity across chunks.
    pub fn process_stream<I>(&self, records: I) -> Result<ProcessingResult, KilnError>
    where
        I: IntoIterator<Item = Result<Value, KilnError>>,
    {
        let mut combined = ProcessingResult {
            entity: self.entity.clone(),
            ..ProcessingResult::default()
        };
        let mut visited = VisitedSet::new();
        let mut cache = FlattenCache::new();
        let mut chunk: Vec<Value> = Vec::with_capacity(self.config.batch_size);
        // Stream position per buffered record; reader faults leave gaps, so
        // positions are carried instead of recomputed from an offset.
        let mut chunk_indices: Vec<usize> = Vec::with_capacity(self.config.batch_size);
        let mut next_index = 0usize;

        for item in records {
            let current = next_index;
            next_index += 1;
            match item {
                Ok(value) => {
                    chunk.push(value);
                    chunk_indices.push(current);
                }
                Err(error) => {
                    let context = FaultContext {
                        error: &error,
                        entity: &self.entity,
                        source: self.source.as_deref(),
                        record_index: Some(current),
                    };
                    match self.recovery.decide(&context) {
                        RecoveryDecision::Abort => return Err(error),
                        // A record that never parsed has nothing to salvage.
                        RecoveryDecision::Skip | RecoveryDecision::Salvage => {
                            combined.stats.records_skipped += 1;
                        }
                    }
                }
            }
            if chunk.len() == self.config.batch_size {
                self.flush_chunk(
                    &mut chunk,
                    &mut chunk_indices,
                    &mut combined,
                    &mut visited,
                    &mut cache,
                )?;
            }
        }
        if !chunk.is_empty() {
            self.flush_chunk(
                &mut chunk,
                &mut chunk_indices,
                &mut combined,
                &mut visited,
                &mut cache,
            )?;
        }
        Ok(combined)
    }

    fn flush_chunk(
        &self,
        chunk: &mut Vec<Value>,
        indices: &mut Vec<usize>,
        combined: &mut ProcessingResult,
        visited: &mut VisitedSet,
        cache: &mut FlattenCache,
    ) -> Result<(), KilnError> {
        let timestamp = MetadataGenerator::batch_timestamp();
        let partial = self.process_batch(chunk, indices, &timestamp, visited, cache)?;
        combined.merge(partial);
        cache.clear();
        visited.clear();
        chunk.clear();
        indices.clear();
        Ok(())
    }

    /// One batch, three passes: flatten everything, assign metadata, extract
    /// child tables. The recovery policy is consulted per faulted record.
    /// `indices` carries each record's position in the overall run for fault
    /// context; reader faults leave gaps, so positions are not contiguous.
    fn process_batch(
        &self,
        records: &[Value],
        indices: &[usize],
        timestamp: &str,
        visited: &mut VisitedSet,
        cache: &mut FlattenCache,
    ) -> Result<ProcessingResult, KilnError> {
        let mut result = ProcessingResult {
            entity: self.entity.clone(),
            ..ProcessingResult::default()
        };

        // Pass 1: flatten every record, filling the shared cache.
        let mut flattened: Vec<Flattened> = Vec::with_capacity(records.len());
        for (record, &index) in records.iter().zip(indices) {
            match self.flattener.flatten_cached(record, visited, cache) {
                Ok(row) => flattened.push(Flattened::Ready(row)),
                Err(traversal) => {
                    visited.clear();
                    let error = traversal.into_kiln(Some(&self.entity));
                    match self.consult(&error, index) {
                        RecoveryDecision::Abort => return Err(error),
                        RecoveryDecision::Skip => flattened.push(Flattened::Skipped),
                        RecoveryDecision::Salvage => {
                            let row = self.flattener.salvage_top_level(record);
                            if row.is_empty() {
                                flattened.push(Flattened::Skipped);
                            } else {
                                flattened.push(Flattened::Salvaged(row));
                            }
                        }
                    }
                }
            }
        }

        // Pass 2: identifiers and timestamps for every surviving row.
        let root_source = self.config.id_source_fields.get(&self.entity);
        let mut slots: Vec<Slot> = Vec::with_capacity(flattened.len());
        for item in flattened {
            match item {
                Flattened::Ready(mut row) => {
                    let id = self
                        .metadata
                        .generate_id(&row, root_source.map(String::as_str));
                    MetadataGenerator::annotate(&mut row, &id, None, timestamp);
                    slots.push(Slot::Full { row, id });
                }
                Flattened::Salvaged(mut row) => {
                    let id = self
                        .metadata
                        .generate_id(&row, root_source.map(String::as_str));
                    MetadataGenerator::annotate(&mut row, &id, None, timestamp);
                    slots.push(Slot::Partial { row, id });
                }
                Flattened::Skipped => slots.push(Slot::Empty),
            }
        }

        // Pass 3: child tables, reusing the cache the flatten pass filled.
        for ((record, slot), &index) in records.iter().zip(slots.iter_mut()).zip(indices) {
            let id = match &*slot {
                Slot::Full { id, .. } => id.clone(),
                _ => continue,
            };
            match self
                .extractor
                .extract_tables(record, &id, "", timestamp, visited, cache)
            {
                Ok(tables) => {
                    for (name, rows) in tables {
                        result.child_tables.entry(name).or_default().extend(rows);
                    }
                }
                Err(traversal) => {
                    visited.clear();
                    let error = traversal.into_kiln(Some(&self.entity));
                    match self.consult(&error, index) {
                        RecoveryDecision::Abort => return Err(error),
                        RecoveryDecision::Skip => *slot = Slot::Empty,
                        RecoveryDecision::Salvage => {
                            if let Slot::Full { row, id } = std::mem::replace(slot, Slot::Empty) {
                                *slot = Slot::Partial { row, id };
                            }
                        }
                    }
                }
            }
        }

        for slot in slots {
            match slot {
                Slot::Full { row, .. } => {
                    result.stats.records_ok += 1;
                    result.main_table.push(row);
                }
                Slot::Partial { row, .. } => {
                    result.stats.records_salvaged += 1;
                    result.main_table.push(row);
                }
                Slot::Empty => result.stats.records_skipped += 1,
            }
        }
        Ok(result)
    }

    fn consult(&self, error: &KilnError, record_index: usize) -> RecoveryDecision {
        let context = FaultContext {
            error,
            entity: &self.entity,
            source: self.source.as_deref(),
            record_index: Some(record_index),
        };
        self.recovery.decide(&context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EXTRACT_DT, EXTRACT_ID, PARENT_EXTRACT_ID};
    use serde_json::json;
    use std::collections::HashMap;
    use tracing::Level;

    fn processor() -> HierarchyProcessor {
        HierarchyProcessor::new("root", FlattenConfig::default()).unwrap()
    }

    fn order_fixture(index: usize) -> Value {
        json!({
            "id": format!("order-{index}"),
            "total": 10.5,
            "items": [
                {"sku": format!("sku-{index}-0"), "qty": 1},
                {"sku": format!("sku-{index}-1"), "qty": 2}
            ]
        })
    }

    #[test]
    fn single_record_produces_linked_tables() {
        let record = json!({"id": "1", "items": [{"x": 1}, {"x": 2}]});
        let result = processor().process_one(&record).unwrap();

        assert_eq!(result.entity, "root");
        assert_eq!(result.main_table.len(), 1);
        let main = &result.main_table[0];
        assert_eq!(main["id"], json!("1"));
        assert!(!main.contains_key("items"));
        assert!(main.contains_key(EXTRACT_ID));
        assert!(main.contains_key(EXTRACT_DT));

        let items = &result.child_tables["root_items"];
        assert_eq!(items.len(), 2);
        for row in items {
            assert_eq!(row[PARENT_EXTRACT_ID], main[EXTRACT_ID]);
        }
        assert_eq!(result.stats.records_ok, 1);
    }

    #[test]
    fn every_record_gets_exactly_one_root_id() {
        let records: Vec<Value> = (0..5).map(order_fixture).collect();
        let result = processor().process(&records).unwrap();

        assert_eq!(result.main_table.len(), 5);
        let mut ids: Vec<&str> = result
            .main_table
            .iter()
            .map(|row| row[EXTRACT_ID].as_str().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        assert_eq!(result.child_tables["root_items"].len(), 10);
    }

    #[test]
    fn batched_strategy_matches_single_pass_shape() {
        let records: Vec<Value> = (0..20).map(order_fixture).collect();
        let config = FlattenConfig {
            batch_size: 7,
            id_source_fields: HashMap::from([
                (String::from("root"), String::from("id")),
                (String::from("root_items"), String::from("sku")),
            ]),
            ..FlattenConfig::default()
        };
        let processor = HierarchyProcessor::new("root", config).unwrap();

        let single = processor.process(&records).unwrap();
        let batched = processor.process_batched(&records).unwrap();

        assert_eq!(single.main_table.len(), batched.main_table.len());
        assert_eq!(
            single.child_tables["root_items"].len(),
            batched.child_tables["root_items"].len()
        );
        for (a, b) in single.main_table.iter().zip(batched.main_table.iter()) {
            assert_eq!(a[EXTRACT_ID], b[EXTRACT_ID]);
            assert_eq!(a["id"], b["id"]);
        }
    }

    #[test]
    fn stream_strategy_combines_chunks() {
        let records: Vec<Value> = (0..13).map(order_fixture).collect();
        let config = FlattenConfig {
            batch_size: 4,
            ..FlattenConfig::default()
        };
        let processor = HierarchyProcessor::new("root", config).unwrap();

        let result = processor
            .process_stream(records.clone().into_iter().map(Ok))
            .unwrap();

        assert_eq!(result.main_table.len(), 13);
        assert_eq!(result.child_tables.len(), 1);
        assert_eq!(result.child_tables["root_items"].len(), 26);
        assert_eq!(result.stats.records_ok, 13);
    }

    #[test]
    fn strict_policy_aborts_on_reader_fault() {
        let items: Vec<Result<Value, KilnError>> = vec![
            Ok(order_fixture(0)),
            Err(KilnError::Parsing {
                message: String::from("bad line"),
                origin: None,
                line: Some(2),
            }),
            Ok(order_fixture(2)),
        ];
        let err = processor().process_stream(items).unwrap_err();
        assert!(matches!(err, KilnError::Parsing { .. }));
    }

    #[test]
    fn lenient_policy_skips_reader_faults_and_counts_them() {
        let items: Vec<Result<Value, KilnError>> = vec![
            Ok(order_fixture(0)),
            Err(KilnError::Parsing {
                message: String::from("bad line"),
                origin: None,
                line: Some(2),
            }),
            Ok(order_fixture(2)),
        ];
        let result = processor()
            .with_recovery(RecoveryStrategy::SkipAndLog(Level::DEBUG))
            .process_stream(items)
            .unwrap();

        assert_eq!(result.main_table.len(), 2);
        assert_eq!(result.stats.records_ok, 2);
        assert_eq!(result.stats.records_skipped, 1);
        assert_eq!(result.stats.records_seen(), 3);
    }

    #[test]
    fn stream_fault_indices_count_reader_faults() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = seen.clone();
        let policy = RecoveryStrategy::Custom(std::sync::Arc::new(move |ctx| {
            captured.lock().unwrap().push(ctx.record_index);
            RecoveryDecision::Skip
        }));
        let items: Vec<Result<Value, KilnError>> = vec![
            Ok(order_fixture(0)),
            Err(KilnError::Parsing {
                message: String::from("bad line"),
                origin: None,
                line: Some(2),
            }),
            Ok(json!("not a record")),
            Ok(order_fixture(3)),
        ];

        let result = processor()
            .with_recovery(policy)
            .process_stream(items)
            .unwrap();

        assert_eq!(result.stats.records_ok, 2);
        assert_eq!(result.stats.records_skipped, 2);
        // The fault positions count the failed reader line too.
        assert_eq!(*seen.lock().unwrap(), vec![Some(1), Some(2)]);
    }

    #[test]
    fn non_object_records_are_skipped_under_lenient_policy() {
        let records = vec![order_fixture(0), json!("not a record"), order_fixture(1)];
        let result = processor()
            .with_recovery(RecoveryStrategy::SkipAndLog(Level::DEBUG))
            .process(&records)
            .unwrap();

        assert_eq!(result.main_table.len(), 2);
        assert_eq!(result.stats.records_skipped, 1);
    }

    #[test]
    fn non_object_records_abort_under_strict_policy() {
        let records = vec![order_fixture(0), json!(42)];
        let err = processor().process(&records).unwrap_err();
        match err {
            KilnError::Processing { entity, .. } => assert_eq!(entity.as_deref(), Some("root")),
            other => panic!("expected processing error, got {other:?}"),
        }
    }

    #[test]
    fn salvage_keeps_top_level_scalars_on_traversal_fault() {
        let processor = processor().with_recovery(RecoveryStrategy::PartialProcessing(Level::DEBUG));
        let record = json!({"id": "1", "note": "keep me", "nested": {"x": 1}});
        let records = [record];
        let mut visited = VisitedSet::new();
        let mut cache = FlattenCache::new();
        // Pre-seeding the guard makes the nested object look like a revisit.
        visited.enter(&records[0]["nested"]);

        let result = processor
            .process_batch(&records, &[0], "2024-01-01T00:00:00Z", &mut visited, &mut cache)
            .unwrap();

        assert_eq!(result.stats.records_salvaged, 1);
        let row = &result.main_table[0];
        assert_eq!(row["id"], json!("1"));
        assert_eq!(row["note"], json!("keep me"));
        assert!(!row.contains_key("nested_x"));
        assert!(row.contains_key(EXTRACT_ID));
    }

    #[test]
    fn custom_policy_decides_per_fault() {
        let policy = RecoveryStrategy::Custom(std::sync::Arc::new(|ctx| {
            if ctx.record_index == Some(1) {
                RecoveryDecision::Skip
            } else {
                RecoveryDecision::Abort
            }
        }));
        let records = vec![order_fixture(0), json!(null), order_fixture(2)];
        let result = processor()
            .with_recovery(policy)
            .process(&records)
            .unwrap();
        assert_eq!(result.main_table.len(), 2);
        assert_eq!(result.stats.records_skipped, 1);
    }

    #[test]
    fn deterministic_root_ids_survive_reprocessing() {
        let config = FlattenConfig {
            id_source_fields: HashMap::from([(String::from("root"), String::from("id"))]),
            ..FlattenConfig::default()
        };
        let record = json!({"id": "stable-1"});

        let first = HierarchyProcessor::new("root", config.clone())
            .unwrap()
            .process_one(&record)
            .unwrap();
        let second = HierarchyProcessor::new("root", config)
            .unwrap()
            .process_one(&record)
            .unwrap();

        assert_eq!(
            first.main_table[0][EXTRACT_ID],
            second.main_table[0][EXTRACT_ID]
        );
    }

    #[test]
    fn entity_names_are_sanitized() {
        let processor = HierarchyProcessor::new("order items", FlattenConfig::default()).unwrap();
        assert_eq!(processor.entity(), "order_items");

        let record = json!({"lines": [{"n": 1}]});
        let result = processor.process_one(&record).unwrap();
        assert!(result.child_tables.contains_key("order_items_lines"));
    }

    #[test]
    fn id_source_keys_take_the_same_cleanup_as_names() {
        let config = FlattenConfig {
            id_source_fields: HashMap::from([
                (String::from("web-event"), String::from("id")),
                (String::from("web-event.clicks"), String::from("cid")),
            ]),
            ..FlattenConfig::default()
        };
        let record = json!({"id": "evt-1", "clicks": [{"cid": "c-9"}]});

        let first = HierarchyProcessor::new("web-event", config.clone())
            .unwrap()
            .process_one(&record)
            .unwrap();
        let second = HierarchyProcessor::new("web-event", config)
            .unwrap()
            .process_one(&record)
            .unwrap();

        assert_eq!(first.entity, "web_event");
        assert_eq!(
            first.main_table[0][EXTRACT_ID],
            second.main_table[0][EXTRACT_ID]
        );
        assert_eq!(
            first.child_tables["web_event_clicks"][0][EXTRACT_ID],
            second.child_tables["web_event_clicks"][0][EXTRACT_ID]
        );
    }

    #[test]
    fn empty_entity_is_a_validation_error() {
        let err = HierarchyProcessor::new("  ", FlattenConfig::default()).unwrap_err();
        match err {
            KilnError::Validation { violations, .. } => {
                assert_eq!(violations[0].field, "entity");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_config_fails_at_construction() {
        let config = FlattenConfig {
            batch_size: 0,
            ..FlattenConfig::default()
        };
        assert!(HierarchyProcessor::new("root", config).is_err());
    }

    #[test]
    fn empty_input_yields_empty_result() {
        let result = processor().process(&[]).unwrap();
        assert!(result.main_table.is_empty());
        assert!(result.child_tables.is_empty());
        assert_eq!(result.stats.records_seen(), 0);
    }
}
