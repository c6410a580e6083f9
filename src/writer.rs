use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::error::KilnError;
use crate::types::{ProcessingResult, Record, Table};

/// Writes tables as JSON Lines files under one directory, one file per
/// table, named `<table>.jsonl`. Files are opened lazily in append mode, so
/// several results can accumulate into the same tables.
pub struct TableWriter {
    directory: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
}

impl TableWriter {
    /// Creates the output directory if needed.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, KilnError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)
            .map_err(|err| KilnError::file(err.to_string(), &directory, "create_dir"))?;
        Ok(TableWriter {
            directory,
            writers: HashMap::new(),
        })
    }

    /// Writes a whole result: the main table under the entity name, child
    /// tables under their own names. Tables without rows produce no file.
    pub fn write_result(&mut self, result: &ProcessingResult) -> Result<(), KilnError> {
        self.write_table(&result.entity, &result.main_table)?;
        for (name, table) in &result.child_tables {
            self.write_table(name, table)?;
        }
        Ok(())
    }

    pub fn write_table(&mut self, name: &str, table: &Table) -> Result<(), KilnError> {
        if table.is_empty() {
            return Ok(());
        }
        for record in table {
            self.write_record(name, record)?;
        }
        Ok(())
    }

    pub fn write_record(&mut self, name: &str, record: &Record) -> Result<(), KilnError> {
        let path = self.directory.join(format!("{name}.jsonl"));
        let writer = match self.writers.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(vacant) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|err| KilnError::file(err.to_string(), &path, "open"))?;
                vacant.insert(BufWriter::new(file))
            }
        };
        let json = serde_json::to_string(record)
            .map_err(|err| KilnError::file(err.to_string(), &path, "serialize"))?;
        writeln!(writer, "{json}")
            .map_err(|err| KilnError::file(err.to_string(), &path, "write"))
    }

    pub fn flush(&mut self) -> Result<(), KilnError> {
        for writer in self.writers.values_mut() {
            writer
                .flush()
                .map_err(|err| KilnError::file(err.to_string(), &self.directory, "flush"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::path::Path;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kiln-writer-{tag}-{}", uuid::Uuid::new_v4()))
    }

    fn row(key: &str, value: &str) -> Record {
        let mut record = Record::new();
        record.insert(key.to_string(), json!(value));
        record
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn writes_one_file_per_table() {
        let dir = temp_dir("per-table");
        let mut result = ProcessingResult {
            entity: String::from("root"),
            ..ProcessingResult::default()
        };
        result.main_table.push(row("id", "1"));
        result
            .child_tables
            .entry(String::from("root_items"))
            .or_default()
            .extend([row("sku", "a"), row("sku", "b")]);

        let mut writer = TableWriter::new(&dir).unwrap();
        writer.write_result(&result).unwrap();
        writer.flush().unwrap();

        assert_eq!(read_lines(&dir.join("root.jsonl")).len(), 1);
        let items = read_lines(&dir.join("root_items.jsonl"));
        assert_eq!(items.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(&items[0]).unwrap();
        assert_eq!(parsed["sku"], json!("a"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn appends_across_calls() {
        let dir = temp_dir("append");
        let mut writer = TableWriter::new(&dir).unwrap();
        writer
            .write_table("events", &vec![row("n", "1")])
            .unwrap();
        writer
            .write_table("events", &vec![row("n", "2")])
            .unwrap();
        writer.flush().unwrap();

        assert_eq!(read_lines(&dir.join("events.jsonl")).len(), 2);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_tables_produce_no_file() {
        let dir = temp_dir("empty");
        let mut writer = TableWriter::new(&dir).unwrap();
        writer.write_table("nothing", &Vec::new()).unwrap();
        writer.flush().unwrap();

        assert!(!dir.join("nothing.jsonl").exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn creates_nested_output_directories() {
        let dir = temp_dir("nested").join("a").join("b");
        let mut writer = TableWriter::new(&dir).unwrap();
        writer.write_table("t", &vec![row("x", "1")]).unwrap();
        writer.flush().unwrap();

        assert!(dir.join("t.jsonl").exists());
        fs::remove_dir_all(dir.parent().unwrap().parent().unwrap()).ok();
    }
}
