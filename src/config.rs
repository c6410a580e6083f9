use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::KilnError;
use crate::types::Record;

/// Caller-supplied identifier generator. Receives the flattened record; an
/// `Err` makes the metadata generator fall back to a random identifier.
pub type CustomIdFn = Arc<dyn Fn(&Record) -> anyhow::Result<String> + Send + Sync>;

/// Options for shortening long path components in table and field names.
#[derive(Debug, Clone)]
pub struct AbbreviationOptions {
    /// Whether abbreviation runs at all. Off by default.
    pub enabled: bool,

    /// Components longer than this are abbreviated (dictionary first,
    /// truncation as a last resort).
    pub max_component_length: usize,

    /// Keep the final path component unabbreviated for traceability.
    pub preserve_leaf: bool,

    /// Caller-supplied term→abbreviation entries. These win over the
    /// built-in dictionary.
    pub overrides: HashMap<String, String>,
}

impl Default for AbbreviationOptions {
    fn default() -> Self {
        AbbreviationOptions {
            enabled: false,
            max_component_length: 64,
            preserve_leaf: true,
            overrides: HashMap::new(),
        }
    }
}

/// Configuration for the whole transform: flattening, extraction, naming,
/// and identifier assignment. Immutable once handed to a processor.
#[derive(Clone)]
pub struct FlattenConfig {
    /// Separator joining path components into field and table names.
    pub separator: String,

    /// Drop null values from flat records. When false, nulls render as
    /// empty strings.
    pub skip_null: bool,

    /// Keep fields whose value is the empty string.
    pub include_empty: bool,

    /// Render numbers and booleans as canonical strings (`true`/`false`
    /// lowercase) instead of keeping their native scalar type.
    pub cast_to_string: bool,

    /// Expand arrays in place with index-qualified field names instead of
    /// serializing the whole array to one string field.
    pub expand_arrays: bool,

    /// Sub-batch size for batched and streaming processing.
    pub batch_size: usize,

    /// Maximum flattening depth. Branches below this are cut off with a
    /// partial result, not an error.
    pub max_depth: usize,

    /// Maximum child-table recursion depth for the extractor.
    pub max_nesting_depth: usize,

    /// Paths with more components than this get their middle collapsed to a
    /// single marker component.
    pub deeply_nested_threshold: usize,

    /// Name shortening options.
    pub abbreviation: AbbreviationOptions,

    /// Table name → field whose value seeds a deterministic identifier for
    /// that table's rows. The entity name keys the main table. Tables not
    /// listed here get random identifiers.
    pub id_source_fields: HashMap<String, String>,

    /// Caller-supplied identifier generator, consulted before any other
    /// strategy.
    pub custom_id_fn: Option<CustomIdFn>,
}

impl Default for FlattenConfig {
    fn default() -> Self {
        FlattenConfig {
            separator: String::from("_"),
            skip_null: true,
            include_empty: false,
            cast_to_string: false,
            expand_arrays: false,
            batch_size: 100,
            max_depth: 10,
            max_nesting_depth: 10,
            deeply_nested_threshold: 10,
            abbreviation: AbbreviationOptions::default(),
            id_source_fields: HashMap::new(),
            custom_id_fn: None,
        }
    }
}

impl fmt::Debug for FlattenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlattenConfig")
            .field("separator", &self.separator)
            .field("skip_null", &self.skip_null)
            .field("include_empty", &self.include_empty)
            .field("cast_to_string", &self.cast_to_string)
            .field("expand_arrays", &self.expand_arrays)
            .field("batch_size", &self.batch_size)
            .field("max_depth", &self.max_depth)
            .field("max_nesting_depth", &self.max_nesting_depth)
            .field("deeply_nested_threshold", &self.deeply_nested_threshold)
            .field("abbreviation", &self.abbreviation)
            .field("id_source_fields", &self.id_source_fields)
            .field("custom_id_fn", &self.custom_id_fn.is_some())
            .finish()
    }
}

impl FlattenConfig {
    /// Rejects option values the transform cannot work with. Called once at
    /// processor construction.
    pub fn validate(&self) -> Result<(), KilnError> {
        if self.separator.is_empty() {
            return Err(KilnError::configuration(
                "separator must not be empty",
                "separator",
                "",
            ));
        }
        if self.batch_size == 0 {
            return Err(KilnError::configuration(
                "batch_size must be at least 1",
                "batch_size",
                "0",
            ));
        }
        // Collapse keeps the first component, one marker, and the last
        // component, so anything below 3 cannot shorten a path.
        if self.deeply_nested_threshold < 3 {
            return Err(KilnError::configuration(
                "deeply_nested_threshold must be at least 3",
                "deeply_nested_threshold",
                self.deeply_nested_threshold.to_string(),
            ));
        }
        if self.abbreviation.enabled && self.abbreviation.max_component_length == 0 {
            return Err(KilnError::configuration(
                "max_component_length must be at least 1",
                "abbreviation.max_component_length",
                "0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(FlattenConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = FlattenConfig {
            batch_size: 0,
            ..FlattenConfig::default()
        };
        match config.validate() {
            Err(KilnError::Configuration { param, .. }) => {
                assert_eq!(param.as_deref(), Some("batch_size"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn tiny_collapse_threshold_is_rejected() {
        let config = FlattenConfig {
            deeply_nested_threshold: 2,
            ..FlattenConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_separator_is_rejected() {
        let config = FlattenConfig {
            separator: String::new(),
            ..FlattenConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_does_not_require_fn_debug() {
        let config = FlattenConfig {
            custom_id_fn: Some(Arc::new(|_| Ok(String::from("fixed")))),
            ..FlattenConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(rendered.contains("custom_id_fn: true"));
    }
}
