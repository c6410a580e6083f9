/// Quickstart example - the simplest possible usage
use kiln::{FlattenConfig, HierarchyProcessor, TableWriter};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    println!("=== Kiln Quick Start ===\n");

    // Step 1: Your nested record
    let record = json!({
        "id": 1,
        "username": "alice",
        "contact": {
            "email": "alice@example.com",
            "city": "Springfield"
        },
        "posts": [
            {
                "id": 100,
                "title": "My First Post",
                "comments": [
                    {"author": "bob", "text": "Welcome!"},
                    {"author": "carol", "text": "Nice one"}
                ]
            },
            {
                "id": 101,
                "title": "Second Post",
                "comments": []
            }
        ]
    });

    println!("Original JSON:");
    println!("{}\n", serde_json::to_string_pretty(&record)?);

    // Step 2: Create a processor for the "user" entity
    let processor = HierarchyProcessor::new("user", FlattenConfig::default())?;

    // Step 3: Flatten the record into linked tables
    let result = processor.process_one(&record)?;

    // Step 4: Look at what we got
    println!("Main table ({} row):", result.main_table.len());
    for row in &result.main_table {
        println!("{}\n", serde_json::to_string_pretty(row)?);
    }
    for (name, rows) in &result.child_tables {
        println!("Child table {name} ({} rows):", rows.len());
        for row in rows {
            println!("{}", serde_json::to_string_pretty(row)?);
        }
        println!();
    }

    // Step 5: Write to files
    println!("Writing to .jsonl files...");
    let mut writer = TableWriter::new("tables")?;
    writer.write_result(&result)?;
    writer.flush()?;

    println!("\n✓ Done! Created files:");
    println!("  • tables/user.jsonl                - User data (extract_id, extract_dt added)");
    println!("  • tables/user_posts.jsonl          - Posts, linked via parent_extract_id");
    println!("  • tables/user_posts_comments.jsonl - Comments, linked to their post");

    println!("\nTry these commands:");
    println!("  cat tables/user.jsonl");
    println!("  cat tables/user_posts.jsonl");
    println!("  cat tables/user_posts_comments.jsonl");

    Ok(())
}
