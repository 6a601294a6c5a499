//! Lazily tails a JSONL transcript file, producing a restartable sequence
//! of `TranscriptMessage` values plus derived aggregates.
//!
//! Grounded on the teacher's `OrchestratorStore::load_run_events` (reopen +
//! seek-past-offset JSONL reading for `since_seq` queries) and
//! `file_watcher.rs` (directory-level `notify` watch, used here only for
//! session-id discovery in `workflow_executor.rs`, not for tailing
//! content).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use crate::error::{Error, Result};
use crate::model::{TranscriptMessage, TranscriptRole};

/// Tool names that count as "editing" for the files-modified aggregate.
/// Configurable at construction; defaults to the common editor toolset.
#[derive(Debug, Clone)]
pub struct EditorToolAllowlist(HashSet<String>);

impl Default for EditorToolAllowlist {
    fn default() -> Self {
        Self(
            ["write_file", "apply_patch", "edit_file", "str_replace"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }
}

impl EditorToolAllowlist {
    pub fn contains(&self, tool_name: &str) -> bool {
        self.0.contains(tool_name)
    }
}

/// One raw JSONL line as written by the agent. Intentionally looser than
/// `TranscriptMessage` since the agent's own schema is out of our control;
/// unrecognized fields are ignored, unparsable lines are skipped.
#[derive(Debug, Clone, serde::Deserialize)]
struct RawLine {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    files_modified: Vec<String>,
    #[serde(default)]
    todos: Vec<String>,
    #[serde(default)]
    is_session_end: bool,
}

fn parse_role(role: Option<&str>) -> TranscriptRole {
    match role {
        Some("user") => TranscriptRole::User,
        Some("tool") => TranscriptRole::Tool,
        Some("system") => TranscriptRole::System,
        _ => TranscriptRole::Assistant,
    }
}

/// Result of a single tail pass: the messages read since the given byte
/// offset, the new offset, and whether a session-end marker was seen.
#[derive(Debug, Clone, Default)]
pub struct TailResult {
    pub messages: Vec<TranscriptMessage>,
    pub next_offset: u64,
    pub saw_session_end: bool,
    pub malformed_lines: u32,
}

pub struct TranscriptReader {
    path: PathBuf,
    allowlist: EditorToolAllowlist,
}

impl TranscriptReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            allowlist: EditorToolAllowlist::default(),
        }
    }

    pub fn with_allowlist(mut self, allowlist: EditorToolAllowlist) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// Reads every line from `from_offset` to EOF. A missing file is not an
    /// error — the agent may not have created it yet — and yields an empty
    /// result at offset 0.
    pub async fn read_from(&self, from_offset: u64) -> Result<TailResult> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TailResult::default());
            }
            Err(err) if is_permission_denied(&err) => {
                return Err(Error::TransientAgent {
                    reason: format!("transcript unreadable: {err}"),
                });
            }
            Err(err) => return Err(Error::Io(err)),
        };

        let mut file = file;
        file.seek(std::io::SeekFrom::Start(from_offset)).await?;
        let mut reader = BufReader::new(file);

        let mut result = TailResult {
            next_offset: from_offset,
            ..Default::default()
        };

        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                break;
            }
            result.next_offset += bytes_read as u64;

            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<RawLine>(trimmed) {
                Ok(raw) => {
                    if raw.is_session_end {
                        result.saw_session_end = true;
                    }
                    let files_modified: Vec<String> = raw
                        .files_modified
                        .into_iter()
                        .filter(|_| {
                            raw.tool_name
                                .as_deref()
                                .map(|t| self.allowlist.contains(t))
                                .unwrap_or(false)
                        })
                        .collect();
                    result.messages.push(TranscriptMessage {
                        role: parse_role(raw.role.as_deref()),
                        timestamp: raw.timestamp.unwrap_or_else(chrono::Utc::now),
                        content: raw.content.unwrap_or_default(),
                        tool_name: raw.tool_name,
                        files_modified,
                        todos: raw.todos,
                        is_session_end: raw.is_session_end,
                    });
                }
                Err(err) => {
                    tracing::warn!(line = trimmed, %err, "skipping malformed transcript line");
                    result.malformed_lines += 1;
                }
            }
        }

        Ok(result)
    }

    /// Reads the whole file from the start. Used by callers that want the
    /// full, restartable sequence rather than an incremental tail.
    pub async fn read_all(&self) -> Result<TailResult> {
        self.read_from(0).await
    }

    /// De-duplicated set of files touched by allowlisted editor tools,
    /// derived from the full transcript.
    pub async fn files_modified(&self) -> Result<HashSet<String>> {
        let all = self.read_all().await?;
        Ok(all
            .messages
            .into_iter()
            .flat_map(|m| m.files_modified)
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_permission_denied(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::PermissionDenied
}

/// Polls a transcript file at `cadence`, yielding new messages as they
/// appear, until the file reports a session-end marker. This is the
/// "tail-and-follow" mode from spec section 4.2; cadence is a tuning
/// parameter (spec section 9), not a contract.
pub async fn follow<F>(
    reader: &TranscriptReader,
    cadence: std::time::Duration,
    mut on_messages: F,
) -> Result<()>
where
    F: FnMut(&[TranscriptMessage]),
{
    let mut offset = 0u64;
    loop {
        let tail = reader.read_from(offset).await?;
        offset = tail.next_offset;
        if !tail.messages.is_empty() {
            on_messages(&tail.messages);
        }
        if tail.saw_session_end {
            return Ok(());
        }
        tokio::time::sleep(cadence).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn write_lines(path: &Path, lines: &[&str]) {
        let mut file = tokio::fs::File::create(path).await.unwrap();
        for line in lines {
            file.write_all(line.as_bytes()).await.unwrap();
            file.write_all(b"\n").await.unwrap();
        }
    }

    #[tokio::test]
    async fn missing_file_yields_empty_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let reader = TranscriptReader::new(dir.path().join("absent.jsonl"));
        let result = reader.read_all().await.unwrap();
        assert!(result.messages.is_empty());
        assert_eq!(result.next_offset, 0);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        write_lines(
            &path,
            &[
                r#"{"role":"assistant","content":"hello"}"#,
                "not json at all",
                r#"{"role":"user","content":"world"}"#,
            ],
        )
        .await;

        let reader = TranscriptReader::new(&path);
        let result = reader.read_all().await.unwrap();
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.malformed_lines, 1);
    }

    #[tokio::test]
    async fn second_reader_from_offset_zero_sees_same_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        write_lines(
            &path,
            &[
                r#"{"role":"assistant","content":"a"}"#,
                r#"{"role":"assistant","content":"b"}"#,
            ],
        )
        .await;

        let reader = TranscriptReader::new(&path);
        let first = reader.read_all().await.unwrap();
        let second = reader.read_all().await.unwrap();
        assert_eq!(first.messages.len(), second.messages.len());
        assert_eq!(
            first.messages[0].content,
            second.messages[0].content
        );
    }

    #[tokio::test]
    async fn files_modified_only_counts_allowlisted_tools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        write_lines(
            &path,
            &[
                r#"{"role":"tool","tool_name":"write_file","files_modified":["a.rs"]}"#,
                r#"{"role":"tool","tool_name":"search","files_modified":["b.rs"]}"#,
            ],
        )
        .await;

        let reader = TranscriptReader::new(&path);
        let files = reader.files_modified().await.unwrap();
        assert!(files.contains("a.rs"));
        assert!(!files.contains("b.rs"));
    }

    #[tokio::test]
    async fn session_end_marker_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        write_lines(
            &path,
            &[r#"{"role":"system","content":"bye","is_session_end":true}"#],
        )
        .await;

        let reader = TranscriptReader::new(&path);
        let result = reader.read_all().await.unwrap();
        assert!(result.saw_session_end);
    }
}
