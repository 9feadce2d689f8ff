//! Message source over per-account directories of JSONL mail exports.
//!
//! Layout: `<root>/<account address>/**/*.jsonl`. Exports are append-only:
//! new mail arrives as new lines or new files. Position tokens record how far
//! each file had been read, so a delta returns every line appended since,
//! whatever timestamp the message carries.

use std::collections::BTreeMap;
use std::path::PathBuf;

use adapter_common::{ExportPosition, collect_files_with_ext, load_jsonl, scan_from};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use core_model::{ChangeSet, MessagePage, MessageSource, MonitoredAccount, NormalizedMessage, SyncError};
use tracing::{debug, warn};

pub const DEFAULT_RETENTION_DAYS: i64 = 30;
pub const MAX_RETENTION_DAYS: i64 = 36_500;
pub const DEFAULT_PAGE_SIZE: usize = 100;

pub struct MailboxDir {
    root: PathBuf,
    retention: Duration,
    page_size: usize,
    clock: fn() -> DateTime<Utc>,
}

impl MailboxDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            page_size: DEFAULT_PAGE_SIZE,
            clock: Utc::now,
        }
    }

    /// History older than this is treated as gone: cursors pointing before
    /// it are rejected with `CursorInvalidated`. Clamped to
    /// `1..=MAX_RETENTION_DAYS`.
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention = Duration::days(days.clamp(1, MAX_RETENTION_DAYS));
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn account_dir(&self, account: &MonitoredAccount) -> PathBuf {
        self.root.join(&account.address)
    }

    fn horizon(&self) -> DateTime<Utc> {
        (self.clock)() - self.retention
    }

    async fn account_files(&self, account: &MonitoredAccount) -> Result<(PathBuf, Vec<String>), SyncError> {
        let dir = self.account_dir(account);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(SyncError::Transport(format!(
                "no mailbox directory at {}",
                dir.display()
            )));
        }
        let scan_dir = dir.clone();
        let paths = tokio::task::spawn_blocking(move || collect_files_with_ext(&scan_dir, "jsonl"))
            .await
            .map_err(SyncError::transport)?;
        Ok((dir, paths))
    }

    async fn load(&self, account: &MonitoredAccount) -> Result<Vec<NormalizedMessage>, SyncError> {
        let (_, paths) = self.account_files(account).await?;
        let address = account.address.clone();
        let messages = tokio::task::spawn_blocking(move || load_jsonl(&paths, &address))
            .await
            .map_err(SyncError::transport)?;
        debug!(account = %account, count = messages.len(), "mailbox loaded");
        Ok(messages)
    }

    /// Messages appended after `offsets`, and the position just past them.
    async fn scan(
        &self,
        account: &MonitoredAccount,
        offsets: BTreeMap<String, u64>,
    ) -> Result<(Vec<NormalizedMessage>, ExportPosition), SyncError> {
        let (dir, paths) = self.account_files(account).await?;
        let address = account.address.clone();
        let scan = tokio::task::spawn_blocking(move || scan_from(&dir, &paths, &offsets, &address))
            .await
            .map_err(SyncError::transport)?;
        if !scan.truncated.is_empty() {
            warn!(account = %account, files = ?scan.truncated, "mail exports were rewritten");
            return Err(SyncError::CursorInvalidated {
                account: account.address.clone(),
            });
        }
        let position = ExportPosition {
            taken_at: (self.clock)(),
            offsets: scan.offsets,
        };
        Ok((scan.messages, position))
    }
}

#[async_trait(?Send)]
impl MessageSource for MailboxDir {
    async fn current_position(&self, account: &MonitoredAccount) -> Result<String, SyncError> {
        let (_, position) = self.scan(account, BTreeMap::new()).await?;
        Ok(position.encode())
    }

    async fn list_since(
        &self,
        account: &MonitoredAccount,
        since: DateTime<Utc>,
    ) -> Result<Vec<NormalizedMessage>, SyncError> {
        let messages = self.load(account).await?;
        Ok(messages.into_iter().filter(|m| m.timestamp >= since).collect())
    }

    async fn list_changes(
        &self,
        account: &MonitoredAccount,
        cursor: &str,
    ) -> Result<ChangeSet, SyncError> {
        let invalidated = || SyncError::CursorInvalidated {
            account: account.address.clone(),
        };
        let previous = ExportPosition::decode(cursor).ok_or_else(invalidated)?;
        if previous.taken_at < self.horizon() {
            return Err(invalidated());
        }
        let (mut messages, position) = self.scan(account, previous.offsets).await?;
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(ChangeSet {
            messages,
            position: position.encode(),
        })
    }

    async fn fetch_page(
        &self,
        account: &MonitoredAccount,
        since: DateTime<Utc>,
        page: Option<&str>,
    ) -> Result<MessagePage, SyncError> {
        let offset = match page {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SyncError::Transport(format!("bad page token: {token}")))?,
            None => 0,
        };
        let matching: Vec<NormalizedMessage> = self
            .load(account)
            .await?
            .into_iter()
            .filter(|m| m.timestamp >= since)
            .collect();
        let end = (offset + self.page_size).min(matching.len());
        let next_page = (end < matching.len()).then(|| end.to_string());
        let messages = matching.into_iter().skip(offset).take(end.saturating_sub(offset)).collect();
        Ok(MessagePage {
            messages,
            next_page,
        })
    }

    async fn fetch_thread(
        &self,
        account: &MonitoredAccount,
        thread_id: &str,
    ) -> Result<Vec<NormalizedMessage>, SyncError> {
        let messages = self.load(account).await?;
        Ok(messages
            .into_iter()
            .filter(|m| m.thread_id == thread_id)
            .collect())
    }
}
