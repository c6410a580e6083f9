use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn, Level};

use crate::error::KilnError;

/// Everything a recovery policy gets to see about one fault.
pub struct FaultContext<'a> {
    pub error: &'a KilnError,
    /// Entity whose record faulted.
    pub entity: &'a str,
    /// Identifier of the source feeding the run (file name, stream label).
    pub source: Option<&'a str>,
    /// Zero-based index of the record within the run, when known.
    pub record_index: Option<usize>,
}

/// Outcome of one recovery consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Re-raise the fault and abort the whole run.
    Abort,
    /// Drop the faulted item and continue with the next one.
    Skip,
    /// Keep the item's surviving top-level scalar fields and continue.
    Salvage,
}

/// Caller-supplied policy, consulted once per recoverable fault.
pub type CustomRecoveryFn = Arc<dyn Fn(&FaultContext<'_>) -> RecoveryDecision + Send + Sync>;

/// Fault policy consulted by the orchestrator when a record cannot be
/// processed. Validation and configuration faults abort regardless of the
/// chosen policy; everything else is up to the variant.
#[derive(Clone, Default)]
pub enum RecoveryStrategy {
    /// Abort the run on the first fault.
    #[default]
    Strict,
    /// Log at the given level, drop the item, continue.
    SkipAndLog(Level),
    /// Log at the given level, keep the item's top-level scalars, continue.
    PartialProcessing(Level),
    /// Delegate the decision to a caller function.
    Custom(CustomRecoveryFn),
}

impl RecoveryStrategy {
    pub fn decide(&self, context: &FaultContext<'_>) -> RecoveryDecision {
        if !context.error.kind().is_recoverable() {
            return RecoveryDecision::Abort;
        }
        match self {
            RecoveryStrategy::Strict => RecoveryDecision::Abort,
            RecoveryStrategy::SkipAndLog(level) => {
                log_fault(*level, context, "skipping record");
                RecoveryDecision::Skip
            }
            RecoveryStrategy::PartialProcessing(level) => {
                log_fault(*level, context, "salvaging top-level fields");
                RecoveryDecision::Salvage
            }
            RecoveryStrategy::Custom(decide) => decide(context),
        }
    }
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStrategy::Strict => f.write_str("Strict"),
            RecoveryStrategy::SkipAndLog(level) => write!(f, "SkipAndLog({level})"),
            RecoveryStrategy::PartialProcessing(level) => write!(f, "PartialProcessing({level})"),
            RecoveryStrategy::Custom(_) => f.write_str("Custom"),
        }
    }
}

// The event macros need a const level, so the dynamic one is dispatched here.
fn log_fault(level: Level, context: &FaultContext<'_>, action: &str) {
    let entity = context.entity;
    let source = context.source.unwrap_or("<memory>");
    let index = context.record_index;
    let error = context.error;
    let kind = error.kind();
    match level {
        Level::ERROR => error!(entity, source, index, kind = %kind, error = %error, "{action}"),
        Level::WARN => warn!(entity, source, index, kind = %kind, error = %error, "{action}"),
        Level::INFO => info!(entity, source, index, kind = %kind, error = %error, "{action}"),
        Level::DEBUG => debug!(entity, source, index, kind = %kind, error = %error, "{action}"),
        Level::TRACE => trace!(entity, source, index, kind = %kind, error = %error, "{action}"),
    }
}
