/// Example: Streaming NDJSON through the processor in bounded chunks
/// This simulates a large feed with a couple of malformed lines that a
/// lenient recovery policy skips instead of aborting the run.
use kiln::{FlattenConfig, HierarchyProcessor, NdjsonReader, RecoveryStrategy, TableWriter};
use std::fmt::Write as _;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    println!("=== Streaming NDJSON, chunk by chunk ===\n");

    // Simulate a feed: 50 orders, lines 13 and 37 corrupted in transit.
    let mut feed = String::new();
    for n in 0..50 {
        if n == 13 || n == 37 {
            feed.push_str("{\"id\": truncated garb\n");
            continue;
        }
        writeln!(
            feed,
            r#"{{"id": "order-{n}", "customer": {{"name": "Customer {n}"}}, "items": [{{"sku": "sku-{n}-a", "qty": 1}}, {{"sku": "sku-{n}-b", "qty": 3}}]}}"#
        )?;
    }

    println!("Feed: 50 lines, 2 of them malformed\n");

    // Small batches keep memory bounded; the output is the same as a single
    // pass over the whole feed.
    let config = FlattenConfig {
        batch_size: 8,
        ..FlattenConfig::default()
    };
    let processor = HierarchyProcessor::new("order", config)?
        .with_recovery(RecoveryStrategy::SkipAndLog(tracing::Level::WARN))
        .with_source("orders.jsonl");

    let reader = NdjsonReader::new(feed.as_bytes()).with_source("orders.jsonl");
    let result = processor.process_stream(reader)?;

    println!("Records processed: {}", result.stats.records_ok);
    println!("Records skipped:   {}", result.stats.records_skipped);
    println!("Main table rows:   {}", result.main_table.len());
    for (name, rows) in &result.child_tables {
        println!("Child table {name}: {} rows", rows.len());
    }

    println!("\nFirst order row:");
    println!("{}", serde_json::to_string_pretty(&result.main_table[0])?);

    println!("\nWriting tables...");
    let mut writer = TableWriter::new("tables")?;
    writer.write_result(&result)?;
    writer.flush()?;

    println!("✓ Done: tables/order.jsonl and tables/order_items.jsonl");
    Ok(())
}
