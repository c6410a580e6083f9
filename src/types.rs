use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A flat row. Keys are separator-joined paths; insertion order is the
/// discovery order of the fields, which the `preserve_order` map keeps.
pub type Record = Map<String, Value>;

/// An ordered collection of rows destined for one output table.
pub type Table = Vec<Record>;

/// Child tables keyed by table name, in first-seen order.
pub type TableMap = IndexMap<String, Table>;

/// Field injected into every row: the row's own identifier.
pub const EXTRACT_ID: &str = "extract_id";

/// Field injected into child rows: the owning row's identifier.
pub const PARENT_EXTRACT_ID: &str = "parent_extract_id";

/// Field injected into every row: the run timestamp.
pub const EXTRACT_DT: &str = "extract_dt";

/// The three injected field names, in the order they are written.
pub const RESERVED_FIELDS: [&str; 3] = [EXTRACT_ID, PARENT_EXTRACT_ID, EXTRACT_DT];

/// Everything a processing run produces: the entity name, the main table,
/// the child tables keyed by name, and the run audit.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// Entity the main table belongs to; names its output table.
    pub entity: String,
    pub main_table: Table,
    pub child_tables: TableMap,
    pub stats: RunStats,
}

impl ProcessingResult {
    /// Folds another result into this one, appending rows and preserving the
    /// first-seen order of child table names.
    pub fn merge(&mut self, other: ProcessingResult) {
        if self.entity.is_empty() {
            self.entity = other.entity;
        }
        self.main_table.extend(other.main_table);
        for (name, rows) in other.child_tables {
            self.child_tables.entry(name).or_default().extend(rows);
        }
        self.stats.merge(&other.stats);
    }

    /// Total rows across the main table and all child tables.
    pub fn total_rows(&self) -> usize {
        self.main_table.len() + self.child_tables.values().map(Vec::len).sum::<usize>()
    }
}

/// Per-run accounting of what happened to the input records.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Records that flattened and extracted without a fault.
    pub records_ok: usize,
    /// Records dropped by a skip decision.
    pub records_skipped: usize,
    /// Records reduced to their top-level scalars by a salvage decision.
    pub records_salvaged: usize,
}

impl RunStats {
    pub fn merge(&mut self, other: &RunStats) {
        self.records_ok += other.records_ok;
        self.records_skipped += other.records_skipped;
        self.records_salvaged += other.records_salvaged;
    }

    /// Records seen, whatever their outcome.
    pub fn records_seen(&self) -> usize {
        self.records_ok + self.records_skipped + self.records_salvaged
    }
}
