//! Shared plumbing for the file-backed collaborators: directory scanning,
//! parallel JSONL decoding of mail exports, and the byte-offset position
//! token used for deltas.

use std::{collections::BTreeMap, fs, path::Path};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use core_model::{Direction, NormalizedMessage, deterministic_id, normalize_address, parse_mailbox};
use rayon::prelude::*;
use serde_json::Value;
use tracing::warn;

pub fn collect_files_with_ext(root: &Path, ext: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some(ext)
                && let Some(s) = path.to_str()
            {
                out.push(s.to_string());
            }
        }
    }
    out.sort();
    out
}

/// Reads every export file in parallel and returns the decoded messages of
/// `account`, oldest first. Unreadable files and malformed lines are logged
/// and skipped.
pub fn load_jsonl(source_paths: &[String], account: &str) -> Vec<NormalizedMessage> {
    let account = normalize_address(account);
    let mut out: Vec<NormalizedMessage> = source_paths
        .par_iter()
        .flat_map(|path| {
            let content = match fs::read_to_string(path) {
                Ok(c) => c,
                Err(err) => {
                    warn!(path = %path, error = %err, "unreadable mail export");
                    return Vec::new();
                }
            };
            parse_export(path, &content, &account)
        })
        .collect();
    out.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

/// Decodes one export file. `path` only seeds ids for lines that carry none.
pub fn parse_export(path: &str, content: &str, account: &str) -> Vec<NormalizedMessage> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let val: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(err) => {
                    warn!(path = %path, error = %err, "skipping malformed export line");
                    return None;
                }
            };
            let id = str_field(&val, "id")
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| deterministic_id(&[path, line]));
            normalize_export(&val, id, account)
        })
        .collect()
}

/// One export object to a [`NormalizedMessage`]. Lines without a sender or
/// a usable timestamp are dropped.
pub fn normalize_export(val: &Value, id: String, account: &str) -> Option<NormalizedMessage> {
    let timestamp = extract_ts(val)?;
    let sender = parse_mailbox(str_field(val, "from")?)?;
    let recipient_header = ["to", "cc"]
        .iter()
        .filter_map(|k| str_field(val, k))
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    let direction = if sender.address == account {
        Direction::Outbound
    } else {
        Direction::Inbound
    };
    let body = str_field(val, "body")
        .or_else(|| str_field(val, "snippet"))
        .unwrap_or_default();
    Some(NormalizedMessage {
        thread_id: str_field(val, "threadId").unwrap_or(&id).to_string(),
        id,
        sender_address: sender.address,
        sender_display_name: sender.display_name,
        recipient_header,
        subject: str_field(val, "subject").unwrap_or_default().to_string(),
        body: body.to_string(),
        timestamp,
        direction,
        source_account: account.to_string(),
    })
}

fn str_field<'v>(val: &'v Value, key: &str) -> Option<&'v str> {
    val.get(key).and_then(Value::as_str)
}

/// RFC 3339 `timestamp`, or `internalDate` epoch milliseconds given either
/// as a number or as a numeric string.
pub fn extract_ts(val: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = val.get("timestamp").and_then(Value::as_str) {
        return DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }
    let ms = match val.get("internalDate")? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(ms).single()
}

/// Read position over a directory of append-only export files: when it was
/// taken and how many bytes of each file (keyed by path relative to the
/// directory) had been consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportPosition {
    pub taken_at: DateTime<Utc>,
    pub offsets: BTreeMap<String, u64>,
}

impl ExportPosition {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(token: &str) -> Option<Self> {
        serde_json::from_str(token).ok()
    }
}

/// Messages appended since an [`ExportPosition`], plus the offsets reached.
#[derive(Debug, Clone, Default)]
pub struct ExportScan {
    pub messages: Vec<NormalizedMessage>,
    pub offsets: BTreeMap<String, u64>,
    /// Files now shorter than their recorded offset, i.e. rewritten.
    pub truncated: Vec<String>,
}

/// Length of the prefix of `bytes` made of complete records: everything up
/// to the last newline, or all of it when the unterminated tail is already a
/// complete JSON value.
pub fn complete_len(bytes: &[u8]) -> usize {
    let cut = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let tail = &bytes[cut..];
    if tail.iter().all(u8::is_ascii_whitespace)
        || serde_json::from_slice::<Value>(tail).is_ok()
    {
        bytes.len()
    } else {
        cut
    }
}

/// Reads every export under `root` from its recorded offset (files not in
/// `offsets` from the start) and decodes the complete lines appended since.
/// Message order follows the files, not message time.
pub fn scan_from(
    root: &Path,
    source_paths: &[String],
    offsets: &BTreeMap<String, u64>,
    account: &str,
) -> ExportScan {
    let account = normalize_address(account);
    let per_file: Vec<(String, Option<(Vec<NormalizedMessage>, u64)>)> = source_paths
        .par_iter()
        .filter_map(|path| {
            let key = Path::new(path)
                .strip_prefix(root)
                .ok()?
                .to_string_lossy()
                .into_owned();
            let bytes = match fs::read(path) {
                Ok(b) => b,
                Err(err) => {
                    warn!(path = %path, error = %err, "unreadable mail export");
                    return None;
                }
            };
            let start = offsets.get(&key).copied().unwrap_or(0) as usize;
            if start > bytes.len() {
                return Some((key, None));
            }
            let fresh = &bytes[start..];
            let len = complete_len(fresh);
            let content = String::from_utf8_lossy(&fresh[..len]);
            let messages = parse_export(path, &content, &account);
            Some((key, Some((messages, (start + len) as u64))))
        })
        .collect();

    let mut scan = ExportScan::default();
    for (key, result) in per_file {
        match result {
            Some((messages, offset)) => {
                scan.messages.extend(messages);
                scan.offsets.insert(key, offset);
            }
            None => scan.truncated.push(key),
        }
    }
    scan
}
