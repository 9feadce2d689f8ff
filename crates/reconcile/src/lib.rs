use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, FixedOffset, Offset, Utc};
use core_model::{CursorMap, MonitoredAccount, TeamMember};
use schema::FieldMap;
use serde::Serialize;

mod engine;
pub mod merge;
pub mod presentation;
pub mod resolver;
mod scheduler;

pub use engine::{CyclePhase, Reconciler};
pub use merge::{Decision, SkipReason};
pub use scheduler::{CancelHandle, CancelToken, cancellation};

/// Knobs shared by every cycle and maintenance run.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub accounts: Vec<MonitoredAccount>,
    pub team: Vec<TeamMember>,
    /// Window fetched when an account has no cursor yet.
    pub lookback: Duration,
    /// History scanned by fill-empty and redo when gathering messages.
    pub history_days: i64,
    /// Pause between counterparts during bulk processing.
    pub item_delay: std::time::Duration,
    pub require_target_category: bool,
    /// Offset used for "today" and for rendering meeting dates and times.
    pub timezone: FixedOffset,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            team: Vec::new(),
            lookback: Duration::hours(ingest::DEFAULT_LOOKBACK_HOURS),
            history_days: 30,
            item_delay: std::time::Duration::ZERO,
            require_target_category: false,
            timezone: Utc.fix(),
        }
    }
}

/// State carried from one cycle to the next.
///
/// Cursors are loaded from the store the first time a context is used and
/// written back at the end of every cycle. The schema is re-derived only
/// when the header row changes.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    pub cursors: CursorMap,
    cursors_loaded: bool,
    schema: Option<(Vec<String>, FieldMap)>,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from `cursors` instead of whatever the store holds.
    pub fn with_cursors(cursors: CursorMap) -> Self {
        Self {
            cursors,
            cursors_loaded: true,
            schema: None,
        }
    }

    pub fn field_map(&self) -> Option<&FieldMap> {
        self.schema.as_ref().map(|(_, map)| map)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub processed: usize,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub failed: usize,
    pub accounts_failed: usize,
}

impl CycleSummary {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn wrote_anything(&self) -> bool {
        self.added + self.updated > 0
    }

    fn skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason).or_default() += 1;
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} added={} updated={} unchanged={} skipped={} failed={} accounts_failed={}",
            self.processed,
            self.added,
            self.updated,
            self.unchanged,
            self.skipped_total(),
            self.failed,
            self.accounts_failed
        )
    }
}
