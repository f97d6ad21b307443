//! Harness transcript JSONL summarizer.
//!
//! The pipeline consumes this through a single async function contract:
//! `(path, cancel) → TranscriptSummary`. Failures degrade into the
//! summary's `error` field; malformed individual lines are skipped, and a
//! cancelled parse reports `error:"Aborted"` rather than panicking.

use std::path::Path;

use serde_json::Value;
use tokio::sync::watch;

use athena_protocol::TranscriptSummary;

/// Parse a transcript file into a summary, honoring the cancel signal.
///
/// The signal flips to `true` (or its sender drops) when the owning
/// session context ends; either way the parse bails with `Aborted` and the
/// caller must discard the result.
pub async fn parse_transcript(path: &Path, mut cancel: watch::Receiver<bool>) -> TranscriptSummary {
    if *cancel.borrow() {
        return aborted();
    }

    let content = tokio::select! {
        read = tokio::fs::read_to_string(path) => match read {
            Ok(content) => content,
            Err(e) => {
                return TranscriptSummary {
                    error: Some(format!("Failed to read transcript: {e}")),
                    ..Default::default()
                }
            }
        },
        _ = cancel.changed() => return aborted(),
    };

    if *cancel.borrow() {
        return aborted();
    }

    summarize_lines(&content)
}

fn aborted() -> TranscriptSummary {
    TranscriptSummary {
        error: Some("Aborted".to_string()),
        ..Default::default()
    }
}

/// Summarize transcript content line by line. Junk lines are skipped.
fn summarize_lines(content: &str) -> TranscriptSummary {
    let mut summary = TranscriptSummary::default();

    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let json: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let line_type = json.get("type").and_then(Value::as_str);
        if !matches!(line_type, Some("user") | Some("assistant")) {
            continue;
        }
        summary.message_count += 1;

        let content_array = json
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array);

        if line_type == Some("assistant") {
            if let Some(items) = content_array {
                summary.tool_call_count += items
                    .iter()
                    .filter(|item| item.get("type").and_then(Value::as_str) == Some("tool_use"))
                    .count() as u64;

                let text = extract_text(items);
                if !text.is_empty() {
                    summary.last_assistant_text = Some(text);
                    summary.last_assistant_timestamp = json
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
            }
        }
    }

    summary
}

/// Join the text blocks of a message content array.
fn extract_text(items: &[Value]) -> String {
    let texts: Vec<&str> = items
        .iter()
        .filter_map(|block| {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                block.get("text").and_then(Value::as_str)
            } else {
                None
            }
        })
        .collect();
    texts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn transcript_fixture() -> String {
        [
            r#"{"type":"user","message":{"content":[{"type":"text","text":"fix the bug"}]},"timestamp":"2026-01-01T00:00:00Z"}"#,
            "this line is junk and must be skipped",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"looking"},{"type":"tool_use","id":"toolu_01","name":"Read","input":{}}]},"timestamp":"2026-01-01T00:00:05Z"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"fixed it"}]},"timestamp":"2026-01-01T00:01:00Z"}"#,
            r#"{"type":"summary","summary":"irrelevant"}"#,
        ]
        .join("\n")
    }

    #[test]
    fn summarizes_and_skips_junk() {
        let summary = summarize_lines(&transcript_fixture());
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.tool_call_count, 1);
        assert_eq!(summary.last_assistant_text.as_deref(), Some("fixed it"));
        assert_eq!(
            summary.last_assistant_timestamp.as_deref(),
            Some("2026-01-01T00:01:00Z")
        );
        assert!(summary.error.is_none());
    }

    #[tokio::test]
    async fn missing_file_degrades_to_error() {
        let (_tx, rx) = watch::channel(false);
        let summary = parse_transcript(Path::new("/nonexistent/transcript.jsonl"), rx).await;
        assert!(summary.error.unwrap().starts_with("Failed to read"));
        assert_eq!(summary.message_count, 0);
    }

    #[tokio::test]
    async fn cancelled_parse_reports_aborted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", transcript_fixture()).unwrap();

        let (tx, rx) = watch::channel(true);
        let summary = parse_transcript(file.path(), rx).await;
        assert_eq!(summary.error.as_deref(), Some("Aborted"));
        drop(tx);
    }

    #[tokio::test]
    async fn parses_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", transcript_fixture()).unwrap();

        let (_tx, rx) = watch::channel(false);
        let summary = parse_transcript(file.path(), rx).await;
        assert_eq!(summary.message_count, 3);
        assert!(summary.error.is_none());
    }
}
