//! # Kiln - Nested Records into Flat Relational Tables
//!
//! Normalizes arbitrarily nested JSON records (objects containing nested
//! objects and arrays) into flat, relationally-linked tables: one main table
//! per entity plus one child table per reachable array of objects, rows
//! linked by generated identifiers.
//!
//! ## Modules
//!
//! - **config**: transform options and their validation
//! - **error**: typed error surface and fault classification
//! - **types**: records, tables, processing results, run audit
//! - **naming**: path sanitization, abbreviation, deep-nesting collapse
//! - **metadata**: identifier and timestamp assignment
//! - **flatten**: recursive object → flat-record transform
//! - **extract**: recursive array discovery → child tables
//! - **hierarchy**: orchestration across records, batches, and streams
//! - **recovery**: pluggable fault policy
//! - **reader**: NDJSON and whole-document record sources
//! - **writer**: JSON Lines table output
//!
//! ## Quick Start
//!
//! ```rust
//! use kiln::{FlattenConfig, HierarchyProcessor};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), kiln::KilnError> {
//! let record = json!({
//!     "id": "c-1001",
//!     "name": "Alice",
//!     "orders": [
//!         {"order_id": "o-1", "total": 30.0},
//!         {"order_id": "o-2", "total": 12.5}
//!     ]
//! });
//!
//! let processor = HierarchyProcessor::new("customer", FlattenConfig::default())?;
//! let result = processor.process_one(&record)?;
//!
//! // One main row without the array field, two linked child rows.
//! assert_eq!(result.main_table.len(), 1);
//! assert_eq!(result.child_tables["customer_orders"].len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ### Processing NDJSON text
//!
//! ```rust
//! use kiln::FlattenConfig;
//!
//! # fn main() -> Result<(), kiln::KilnError> {
//! let input = "{\"id\": \"1\", \"items\": [{\"sku\": \"a\"}]}\n{\"id\": \"2\"}\n";
//! let result = kiln::process_lines(input, "event", FlattenConfig::default())?;
//!
//! assert_eq!(result.main_table.len(), 2);
//! assert_eq!(result.child_tables["event_items"].len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod flatten;
pub mod hierarchy;
pub mod metadata;
pub mod naming;
pub mod reader;
pub mod recovery;
pub mod types;
pub mod writer;

// Re-export commonly used types for convenience
pub use config::{AbbreviationOptions, CustomIdFn, FlattenConfig};
pub use error::{ErrorKind, FieldViolation, KilnError};
pub use extract::Extractor;
pub use flatten::{FlattenCache, Flattener, VisitedSet};
pub use hierarchy::HierarchyProcessor;
pub use metadata::{MetadataGenerator, KILN_ID_NAMESPACE};
pub use naming::NameBuilder;
pub use reader::{read_document, NdjsonReader};
pub use recovery::{CustomRecoveryFn, FaultContext, RecoveryDecision, RecoveryStrategy};
pub use types::{
    ProcessingResult, Record, RunStats, Table, TableMap, EXTRACT_DT, EXTRACT_ID,
    PARENT_EXTRACT_ID, RESERVED_FIELDS,
};
pub use writer::TableWriter;

/// Convenience entry point: processes NDJSON text for one entity with the
/// streaming strategy.
pub fn process_lines(
    input: &str,
    entity: &str,
    config: FlattenConfig,
) -> Result<ProcessingResult, KilnError> {
    let processor = HierarchyProcessor::new(entity, config)?;
    processor.process_stream(NdjsonReader::new(input.as_bytes()))
}
