//! kiln-flatten: normalize nested JSON records into flat relational tables
//!
//! Usage:
//!   # One document (object or array of objects) from a file
//!   kiln-flatten data.json --entity order --output-dir ./tables
//!
//!   # NDJSON from stdin, skipping malformed lines
//!   cat events.jsonl | kiln-flatten --ndjson --entity event --on-error skip -o ./tables
//!
//!   # Stream a large NDJSON file in bounded chunks
//!   kiln-flatten events.jsonl --ndjson --mode chunked --batch-size 500 -o ./tables
//!
//! Without --output-dir, every row goes to stdout as one JSON line with a
//! `_table` field naming its table.

// Use MiMalloc allocator for better performance (recommended by simd-json)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kiln::{
    read_document, FlattenConfig, HierarchyProcessor, KilnError, NdjsonReader, ProcessingResult,
    Record, RecoveryStrategy, TableWriter,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kiln-flatten")]
#[command(about = "Normalize nested JSON records into flat relational tables", long_about = None)]
struct Args {
    /// Input file (use stdin if omitted)
    #[arg(value_name = "FILE")]
    input: Option<String>,

    /// Entity name for the main table (default: "root")
    #[arg(long, short = 'e', default_value = "root")]
    entity: String,

    /// Process newline-delimited JSON (one JSON object per line)
    #[arg(long)]
    ndjson: bool,

    /// Output directory for separate .jsonl files per table
    /// If omitted, writes rows to stdout with a `_table` field
    #[arg(long, short = 'o')]
    output_dir: Option<String>,

    /// Processing strategy: single pass, fixed-size batches over a loaded
    /// input, or bounded streaming chunks
    #[arg(long, value_enum, default_value = "single")]
    mode: Mode,

    /// Records per batch for batched/chunked modes (default: 100)
    #[arg(long)]
    batch_size: Option<usize>,

    /// What to do when a record cannot be processed (default: strict)
    #[arg(long, value_enum, default_value = "strict")]
    on_error: OnError,

    /// Separator for nested field and table names (default: "_")
    #[arg(long)]
    separator: Option<String>,

    /// Maximum flattening depth (default: 10)
    #[arg(long)]
    max_depth: Option<usize>,

    /// Maximum child-table nesting depth (default: 10)
    #[arg(long)]
    max_nesting_depth: Option<usize>,

    /// Path length above which names are collapsed (default: 10)
    #[arg(long)]
    deeply_nested_threshold: Option<usize>,

    /// Render numbers and booleans as strings
    #[arg(long)]
    cast_to_string: bool,

    /// Keep fields whose value is the empty string
    #[arg(long)]
    include_empty: bool,

    /// Render null values as empty strings instead of dropping them
    #[arg(long)]
    keep_nulls: bool,

    /// Expand arrays with index-qualified names instead of serializing them
    #[arg(long)]
    expand_arrays: bool,

    /// Abbreviate long name components
    #[arg(long)]
    abbreviate: bool,

    /// Component length above which abbreviation applies (default: 64)
    #[arg(long, requires = "abbreviate")]
    max_component_length: Option<usize>,

    /// Deterministic id source, as `table=field` or just `field` for the
    /// main table; may be repeated
    #[arg(long = "id-field", value_name = "TABLE=FIELD")]
    id_fields: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Single,
    Batched,
    Chunked,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OnError {
    /// Abort the run on the first fault
    Strict,
    /// Log the fault and drop the record
    Skip,
    /// Log the fault and keep the record's top-level scalar fields
    Salvage,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let label = args.input.clone().unwrap_or_else(|| String::from("stdin"));

    let mut config = FlattenConfig {
        cast_to_string: args.cast_to_string,
        include_empty: args.include_empty,
        skip_null: !args.keep_nulls,
        expand_arrays: args.expand_arrays,
        id_source_fields: parse_id_fields(&args.entity, &args.id_fields),
        ..FlattenConfig::default()
    };
    if let Some(separator) = &args.separator {
        config.separator = separator.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(depth) = args.max_depth {
        config.max_depth = depth;
    }
    if let Some(depth) = args.max_nesting_depth {
        config.max_nesting_depth = depth;
    }
    if let Some(threshold) = args.deeply_nested_threshold {
        config.deeply_nested_threshold = threshold;
    }
    config.abbreviation.enabled = args.abbreviate;
    if let Some(length) = args.max_component_length {
        config.abbreviation.max_component_length = length;
    }

    let reader: Box<dyn Read> = if let Some(file_path) = &args.input {
        Box::new(BufReader::new(
            File::open(file_path).with_context(|| format!("failed to open {file_path}"))?,
        ))
    } else {
        Box::new(std::io::stdin())
    };

    // Chunked mode pulls NDJSON lazily; the other modes (and whole-document
    // input) materialize the records first. Single-pass runs as one batch
    // covering the whole input.
    let items: Box<dyn Iterator<Item = Result<Value, KilnError>>> =
        if args.ndjson && args.mode == Mode::Chunked {
            Box::new(NdjsonReader::new(BufReader::new(reader)).with_source(&label))
        } else if args.ndjson {
            let collected: Vec<_> = NdjsonReader::new(BufReader::new(reader))
                .with_source(&label)
                .collect();
            if args.mode == Mode::Single {
                config.batch_size = collected.len().max(1);
            }
            Box::new(collected.into_iter())
        } else {
            let collected = read_document(reader, Some(&label))?;
            if args.mode == Mode::Single {
                config.batch_size = collected.len().max(1);
            }
            Box::new(collected.into_iter())
        };

    let processor = HierarchyProcessor::new(&args.entity, config)?
        .with_recovery(recovery_for(args.on_error))
        .with_source(&label);
    let result = processor.process_stream(items)?;

    if let Some(output_dir) = &args.output_dir {
        let mut writer = TableWriter::new(output_dir)?;
        writer.write_result(&result)?;
        writer.flush()?;
    } else {
        write_to_stdout(&result)?;
    }

    info!(
        records = result.stats.records_seen(),
        rows = result.total_rows(),
        tables = 1 + result.child_tables.len(),
        skipped = result.stats.records_skipped,
        salvaged = result.stats.records_salvaged,
        "processing complete"
    );
    Ok(())
}

fn recovery_for(on_error: OnError) -> RecoveryStrategy {
    match on_error {
        OnError::Strict => RecoveryStrategy::Strict,
        OnError::Skip => RecoveryStrategy::SkipAndLog(Level::WARN),
        OnError::Salvage => RecoveryStrategy::PartialProcessing(Level::WARN),
    }
}

fn parse_id_fields(entity: &str, entries: &[String]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((table, field)) => (table.trim().to_string(), field.trim().to_string()),
            None => (entity.to_string(), entry.trim().to_string()),
        })
        .collect()
}

/// Writes every row to stdout as newline-delimited JSON, tagged with the
/// table it belongs to.
fn write_to_stdout(result: &ProcessingResult) -> Result<()> {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    for record in &result.main_table {
        write_row(&mut lock, &result.entity, record)?;
    }
    for (name, table) in &result.child_tables {
        for record in table {
            write_row(&mut lock, name, record)?;
        }
    }
    Ok(())
}

fn write_row(out: &mut impl Write, table: &str, record: &Record) -> Result<()> {
    let mut output = record.clone();
    output.insert(
        String::from("_table"),
        Value::String(table.to_string()),
    );
    writeln!(out, "{}", serde_json::to_string(&output)?)?;
    Ok(())
}
