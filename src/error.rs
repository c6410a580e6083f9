use std::fmt;
use std::io;
use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

/// One field-level complaint inside a [`KilnError::Validation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Name of the offending argument or field.
    pub field: String,
    /// What was wrong with it.
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Error type surfaced by the transform engine and its boundary collaborators.
///
/// The message carries the human-readable context; the structured fields are
/// for programmatic handling (recovery policies, audit logs).
#[derive(Debug, Error)]
pub enum KilnError {
    /// A record could not be transformed (depth faults surfaced as errors,
    /// values that cannot be represented in a flat row, and similar).
    #[error("processing failed: {message}")]
    Processing {
        message: String,
        /// Entity whose record was being processed, when known.
        entity: Option<String>,
        /// Separator-joined path to the offending node, when known.
        path: Option<String>,
        /// The offending node itself, when one was identified.
        data: Option<Value>,
    },

    /// Malformed call arguments. Never routed through recovery.
    #[error("invalid arguments: {message}")]
    Validation {
        message: String,
        violations: Vec<FieldViolation>,
    },

    /// Malformed source text handed in by a reader.
    #[error("malformed source: {message}")]
    Parsing {
        message: String,
        /// Where the text came from (file name, stream label), when known.
        /// `source` would collide with the `Error::source` cause chain.
        origin: Option<String>,
        /// One-based line number within the source, when known.
        line: Option<usize>,
    },

    /// A node identity was re-entered on the active traversal path.
    #[error("circular reference at '{path}': {message}")]
    CircularReference { message: String, path: String },

    /// I/O failure while reading a source or writing a table.
    #[error("file operation failed: {message}")]
    File {
        message: String,
        path: Option<PathBuf>,
        operation: Option<String>,
    },

    /// An option value rejected at setup. Never routed through recovery.
    #[error("invalid configuration: {message}")]
    Configuration {
        message: String,
        param: Option<String>,
        value: Option<String>,
    },
}

impl KilnError {
    /// Shorthand for a [`KilnError::Configuration`] with parameter context.
    pub fn configuration(
        message: impl Into<String>,
        param: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        KilnError::Configuration {
            message: message.into(),
            param: Some(param.into()),
            value: Some(value.into()),
        }
    }

    /// Shorthand for a [`KilnError::File`] with path and operation context.
    pub fn file(
        message: impl Into<String>,
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
    ) -> Self {
        KilnError::File {
            message: message.into(),
            path: Some(path.into()),
            operation: Some(operation.into()),
        }
    }

    /// Coarse classification used by the recovery policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KilnError::Processing { .. } => ErrorKind::Processing,
            KilnError::Validation { .. } => ErrorKind::Validation,
            KilnError::Parsing { .. } => ErrorKind::Parsing,
            KilnError::CircularReference { .. } => ErrorKind::CircularReference,
            KilnError::File { .. } => ErrorKind::File,
            KilnError::Configuration { .. } => ErrorKind::Configuration,
        }
    }
}

impl From<io::Error> for KilnError {
    fn from(err: io::Error) -> Self {
        KilnError::File {
            message: err.to_string(),
            path: None,
            operation: None,
        }
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Parsing {
            message: err.to_string(),
            origin: None,
            line: Some(err.line()).filter(|l| *l > 0),
        }
    }
}

/// The error kinds a recovery policy can rule on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Processing,
    Validation,
    Parsing,
    CircularReference,
    File,
    Configuration,
}

impl ErrorKind {
    /// Validation and configuration faults fail fast regardless of policy;
    /// everything else is up to the configured [`RecoveryStrategy`].
    ///
    /// [`RecoveryStrategy`]: crate::recovery::RecoveryStrategy
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorKind::Validation | ErrorKind::Configuration)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Processing => "processing",
            ErrorKind::Validation => "validation",
            ErrorKind::Parsing => "parsing",
            ErrorKind::CircularReference => "circular-reference",
            ErrorKind::File => "file",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Expected traversal outcomes the flattener and extractor hand to the
/// orchestrator. These are control flow for the recovery policy, not faults;
/// they become a [`KilnError`] only when a policy decides to abort.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TraversalError {
    /// The same node identity appeared twice on the active recursion path.
    Cycle { path: String },
    /// A value at this path has no flat representation.
    Unrepresentable {
        path: String,
        reason: String,
        value: Value,
    },
    /// The node handed in as a record root was not an object.
    NotARecord { found: &'static str },
}

impl TraversalError {
    pub(crate) fn into_kiln(self, entity: Option<&str>) -> KilnError {
        match self {
            TraversalError::Cycle { path } => KilnError::CircularReference {
                message: "node is already on the active traversal path".to_string(),
                path,
            },
            TraversalError::Unrepresentable {
                path,
                reason,
                value,
            } => KilnError::Processing {
                message: format!("value at '{path}' cannot be represented: {reason}"),
                entity: entity.map(str::to_string),
                path: Some(path),
                data: Some(value),
            },
            TraversalError::NotARecord { found } => KilnError::Processing {
                message: format!("top-level node must be an object, found {found}"),
                entity: entity.map(str::to_string),
                path: None,
                data: None,
            },
        }
    }
}
