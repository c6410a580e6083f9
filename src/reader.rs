use std::io::{BufRead, Lines, Read};

use serde_json::Value;
use tracing::debug;

use crate::error::KilnError;

/// Pull-based NDJSON record source: one JSON value per line, blank lines
/// skipped. Yields `Result` items so the orchestrator's recovery policy can
/// rule on individual malformed lines; an I/O failure ends the iterator
/// after its error is yielded.
pub struct NdjsonReader<R: BufRead> {
    lines: Lines<R>,
    source: Option<String>,
    line: usize,
    failed: bool,
}

impl<R: BufRead> NdjsonReader<R> {
    pub fn new(reader: R) -> Self {
        NdjsonReader {
            lines: reader.lines(),
            source: None,
            line: 0,
            failed: false,
        }
    }

    /// Labels the source (file name, stream name) in yielded errors.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl<R: BufRead> Iterator for NdjsonReader<R> {
    type Item = Result<Value, KilnError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = self.lines.next()?;
            self.line += 1;
            match line {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(trimmed).map_err(|err| {
                        KilnError::Parsing {
                            message: err.to_string(),
                            origin: self.source.clone(),
                            line: Some(self.line),
                        }
                    }));
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(KilnError::File {
                        message: err.to_string(),
                        path: self.source.clone().map(Into::into),
                        operation: Some(String::from("read")),
                    }));
                }
            }
        }
    }
}

/// Reads a whole JSON document: an array of records or one record.
///
/// The document is parsed with simd-json first; when that fails the content
/// is re-parsed line by line with serde_json, so an NDJSON file or a source
/// with a few malformed lines still yields every record that parses. The
/// outer error covers unreadable sources; per-record errors are inner items
/// for the recovery policy.
pub fn read_document(
    mut reader: impl Read,
    source: Option<&str>,
) -> Result<Vec<Result<Value, KilnError>>, KilnError> {
    let mut content = String::new();
    reader.read_to_string(&mut content).map_err(|err| KilnError::File {
        message: err.to_string(),
        path: source.map(Into::into),
        operation: Some(String::from("read")),
    })?;

    // simd-json parses in place, so it gets its own copy and the original
    // text stays intact for the line-by-line fallback.
    let mut bytes = content.clone().into_bytes();
    match simd_json::serde::from_slice::<Value>(&mut bytes) {
        Ok(Value::Array(items)) => Ok(items.into_iter().map(Ok).collect()),
        Ok(single) => Ok(vec![Ok(single)]),
        Err(err) => {
            debug!(error = %err, "whole-document parse failed, re-parsing line by line");
            Ok(parse_lines(&content, source))
        }
    }
}

fn parse_lines(content: &str, source: Option<&str>) -> Vec<Result<Value, KilnError>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line.trim()).map_err(|err| KilnError::Parsing {
                message: err.to_string(),
                origin: source.map(str::to_string),
                line: Some(index + 1),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ndjson_yields_one_record_per_line() {
        let input = "{\"a\": 1}\n\n{\"a\": 2}\n";
        let records: Vec<_> = NdjsonReader::new(input.as_bytes()).collect();

        assert_eq!(records.len(), 2);
        assert_eq!(*records[0].as_ref().unwrap(), json!({"a": 1}));
        assert_eq!(*records[1].as_ref().unwrap(), json!({"a": 2}));
    }

    #[test]
    fn ndjson_reports_the_failing_line() {
        let input = "{\"a\": 1}\n{bad}\n{\"a\": 3}\n";
        let records: Vec<_> = NdjsonReader::new(input.as_bytes())
            .with_source("fixture.jsonl")
            .collect();

        assert_eq!(records.len(), 3);
        assert!(records[0].is_ok());
        match records[1].as_ref().unwrap_err() {
            KilnError::Parsing { origin, line, .. } => {
                assert_eq!(origin.as_deref(), Some("fixture.jsonl"));
                assert_eq!(*line, Some(2));
            }
            other => panic!("expected parsing error, got {other:?}"),
        }
        assert!(records[2].is_ok());
    }

    #[test]
    fn document_array_becomes_many_records() {
        let input = r#"[{"a": 1}, {"a": 2}, {"a": 3}]"#;
        let records = read_document(input.as_bytes(), None).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(Result::is_ok));
    }

    #[test]
    fn document_single_object_becomes_one_record() {
        let input = r#"{"a": 1, "b": {"c": 2}}"#;
        let records = read_document(input.as_bytes(), None).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn ndjson_content_falls_back_to_line_parsing() {
        let input = "{\"a\": 1}\n{\"a\": 2}\n";
        let records = read_document(input.as_bytes(), None).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(Result::is_ok));
    }

    #[test]
    fn fallback_keeps_good_lines_around_a_bad_one() {
        let input = "{\"a\": 1}\nnot json\n{\"a\": 3}\n";
        let records = read_document(input.as_bytes(), Some("events.jsonl")).unwrap();

        assert_eq!(records.len(), 3);
        assert!(records[0].is_ok());
        match records[1].as_ref().unwrap_err() {
            KilnError::Parsing { line, origin, .. } => {
                assert_eq!(*line, Some(2));
                assert_eq!(origin.as_deref(), Some("events.jsonl"));
            }
            other => panic!("expected parsing error, got {other:?}"),
        }
        assert!(records[2].is_ok());
    }

    #[test]
    fn empty_input_yields_nothing() {
        let records: Vec<_> = NdjsonReader::new("".as_bytes()).collect();
        assert!(records.is_empty());
    }

    #[test]
    fn field_order_is_preserved() {
        let input = r#"{"z": 1, "a": 2, "m": 3}"#;
        let records = read_document(input.as_bytes(), None).unwrap();
        let record = records[0].as_ref().unwrap();
        let keys: Vec<&String> = record.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }
}
