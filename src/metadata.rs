use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{CustomIdFn, FlattenConfig};
use crate::types::{Record, EXTRACT_DT, EXTRACT_ID, PARENT_EXTRACT_ID, RESERVED_FIELDS};

/// Namespace for deterministic row identifiers. Fixed so that the same source
/// value yields the same UUID v5 across runs and deployments.
pub const KILN_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b696c6e_8f24_41d2_9a57_c3e1b0a4d886);

/// Assigns row identifiers and run timestamps.
///
/// Identifier resolution cascades: a caller-supplied generator first (its
/// `Err` falls back to random), then a deterministic UUID v5 when the
/// designated source field is present and non-empty, then a random UUID v4.
#[derive(Clone, Default)]
pub struct MetadataGenerator {
    custom_id_fn: Option<CustomIdFn>,
}

impl fmt::Debug for MetadataGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataGenerator")
            .field("custom_id_fn", &self.custom_id_fn.is_some())
            .finish()
    }
}

impl MetadataGenerator {
    pub fn from_config(config: &FlattenConfig) -> Self {
        MetadataGenerator {
            custom_id_fn: config.custom_id_fn.clone(),
        }
    }

    /// Produces the identifier for one flattened record. `source_field` is
    /// the per-table deterministic seed field, when configured.
    pub fn generate_id(&self, record: &Record, source_field: Option<&str>) -> String {
        if let Some(custom) = &self.custom_id_fn {
            match custom(record) {
                Ok(id) => return id,
                Err(err) => {
                    warn!(error = %err, "custom id generator failed, using random id");
                    return Uuid::new_v4().to_string();
                }
            }
        }

        if let Some(field) = source_field {
            if let Some(seed) = record.get(field).and_then(seed_text) {
                return Uuid::new_v5(&KILN_ID_NAMESPACE, seed.as_bytes()).to_string();
            }
        }

        Uuid::new_v4().to_string()
    }

    /// One timestamp per batch call, shared by every record the call touches.
    pub fn batch_timestamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Writes the reserved metadata fields into `record`, after its business
    /// fields. `parent_extract_id` is only written for child rows. Reserved
    /// names always win; a business field already using one is replaced.
    pub fn annotate(record: &mut Record, id: &str, parent_id: Option<&str>, timestamp: &str) {
        for field in RESERVED_FIELDS {
            if record.contains_key(field) {
                debug!(field, "input field uses a reserved name");
            }
        }
        record.insert(EXTRACT_ID.to_string(), Value::String(id.to_string()));
        if let Some(parent) = parent_id {
            record.insert(
                PARENT_EXTRACT_ID.to_string(),
                Value::String(parent.to_string()),
            );
        }
        record.insert(EXTRACT_DT.to_string(), Value::String(timestamp.to_string()));
    }
}

/// Stringifies a scalar for use as a deterministic seed. Null and the empty
/// string do not qualify.
fn seed_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
