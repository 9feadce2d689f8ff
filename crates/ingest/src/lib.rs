use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use core_model::{CursorMap, MessageSource, MonitoredAccount, NormalizedMessage, SyncError};
use tracing::{debug, error, info, warn};

mod grouping;

pub use grouping::{CounterpartBatch, group_by_counterpart, resolve_counterpart};

pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

/// Longest history window any fetch may ask for.
pub const MAX_WINDOW_DAYS: i64 = 36_500;

/// `days` as a fetch window, rejected outside `1..=MAX_WINDOW_DAYS`.
pub fn window_days(days: i64) -> Result<Duration, SyncError> {
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(SyncError::Configuration(format!(
            "history window must be between 1 and {MAX_WINDOW_DAYS} days, got {days}"
        )));
    }
    Duration::try_days(days)
        .ok_or_else(|| SyncError::Configuration(format!("history window of {days} days overflows")))
}

fn window_start(now: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>, SyncError> {
    now.checked_sub_signed(window).ok_or_else(|| {
        SyncError::Configuration(format!("window of {window} reaches before the representable range"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// No cursor was stored; fetched the lookback window.
    Bootstrap,
    /// Fetched the delta since the stored cursor.
    Delta,
    /// The stored cursor was rejected upstream; fell back to bootstrap.
    Rebootstrap,
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub messages: Vec<NormalizedMessage>,
    pub mode: PollMode,
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub messages: Vec<NormalizedMessage>,
    pub accounts_polled: usize,
    pub accounts_failed: usize,
}

/// Incremental fetch for one account.
///
/// The cursor in `cursors` is only replaced after a fetch succeeds, so a
/// failure leaves it untouched and the next poll sees the same window again.
pub async fn poll(
    source: &dyn MessageSource,
    account: &MonitoredAccount,
    cursors: &mut CursorMap,
    lookback: Duration,
    now: DateTime<Utc>,
) -> Result<PollOutcome, SyncError> {
    let Some(cursor) = cursors.get(&account.address).cloned() else {
        let messages = bootstrap(source, account, cursors, lookback, now).await?;
        return Ok(PollOutcome {
            messages,
            mode: PollMode::Bootstrap,
        });
    };

    match source.list_changes(account, &cursor).await {
        Ok(changes) => {
            debug!(account = %account, count = changes.messages.len(), "delta fetched");
            cursors.insert(account.address.clone(), changes.position);
            Ok(PollOutcome {
                messages: oldest_first(changes.messages),
                mode: PollMode::Delta,
            })
        }
        Err(SyncError::CursorInvalidated { .. }) => {
            warn!(account = %account, "cursor invalidated upstream; re-bootstrapping");
            cursors.remove(&account.address);
            let messages = bootstrap(source, account, cursors, lookback, now).await?;
            Ok(PollOutcome {
                messages,
                mode: PollMode::Rebootstrap,
            })
        }
        Err(err) => Err(err),
    }
}

async fn bootstrap(
    source: &dyn MessageSource,
    account: &MonitoredAccount,
    cursors: &mut CursorMap,
    lookback: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<NormalizedMessage>, SyncError> {
    // Position is taken before listing: anything arriving in between shows
    // up again in the next delta instead of being skipped.
    let position = source.current_position(account).await?;
    let since = window_start(now, lookback)?;
    let messages = source.list_since(account, since).await?;
    info!(account = %account, count = messages.len(), "bootstrapped cursor");
    cursors.insert(account.address.clone(), position);
    Ok(oldest_first(messages))
}

/// Polls every account in order. A failing account is logged and counted;
/// the rest are still polled. Messages seen under more than one account are
/// kept once.
pub async fn poll_all(
    source: &dyn MessageSource,
    accounts: &[MonitoredAccount],
    cursors: &mut CursorMap,
    lookback: Duration,
    now: DateTime<Utc>,
) -> IngestReport {
    let mut report = IngestReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    for account in accounts {
        report.accounts_polled += 1;
        match poll(source, account, cursors, lookback, now).await {
            Ok(outcome) => {
                info!(
                    account = %account,
                    mode = ?outcome.mode,
                    count = outcome.messages.len(),
                    "polled account"
                );
                for msg in outcome.messages {
                    if seen.insert(msg.id.clone()) {
                        report.messages.push(msg);
                    }
                }
            }
            Err(err) => {
                report.accounts_failed += 1;
                error!(account = %account, error = %err, "poll failed; skipping account");
            }
        }
    }
    report
}

/// Full historical fetch for `since_days`, paging until the source reports
/// no further page. Ignores and never touches the incremental cursor.
/// A `since_days` outside the window limits is a configuration error.
pub async fn fetch_range(
    source: &dyn MessageSource,
    account: &MonitoredAccount,
    since_days: i64,
    now: DateTime<Utc>,
) -> Result<Vec<NormalizedMessage>, SyncError> {
    let since = window_start(now, window_days(since_days)?)?;
    let mut out = Vec::new();
    let mut page: Option<String> = None;
    let mut pages = 0usize;
    loop {
        let batch = source.fetch_page(account, since, page.as_deref()).await?;
        pages += 1;
        out.extend(batch.messages);
        match batch.next_page {
            Some(next) if page.as_deref() == Some(next.as_str()) => {
                warn!(account = %account, page = %next, "source repeated a page token; stopping");
                break;
            }
            Some(next) => page = Some(next),
            None => break,
        }
    }
    debug!(account = %account, pages, count = out.len(), "range fetched");
    Ok(oldest_first(out))
}

fn oldest_first(mut messages: Vec<NormalizedMessage>) -> Vec<NormalizedMessage> {
    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use core_model::{ChangeSet, Direction, MessagePage};
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeSource {
        position: String,
        recent: Vec<NormalizedMessage>,
        delta: RefCell<Option<Result<ChangeSet, SyncError>>>,
        pages: Vec<MessagePage>,
        list_since_calls: RefCell<Vec<DateTime<Utc>>>,
        fail_recent: bool,
    }

    #[async_trait(?Send)]
    impl MessageSource for FakeSource {
        async fn current_position(&self, _account: &MonitoredAccount) -> Result<String, SyncError> {
            Ok(self.position.clone())
        }
        async fn list_since(
            &self,
            _account: &MonitoredAccount,
            since: DateTime<Utc>,
        ) -> Result<Vec<NormalizedMessage>, SyncError> {
            self.list_since_calls.borrow_mut().push(since);
            if self.fail_recent {
                return Err(SyncError::Transport("boom".to_string()));
            }
            Ok(self.recent.clone())
        }
        async fn list_changes(
            &self,
            account: &MonitoredAccount,
            _cursor: &str,
        ) -> Result<ChangeSet, SyncError> {
            self.delta.borrow_mut().take().unwrap_or_else(|| {
                Err(SyncError::CursorInvalidated {
                    account: account.address.clone(),
                })
            })
        }
        async fn fetch_page(
            &self,
            _account: &MonitoredAccount,
            _since: DateTime<Utc>,
            page: Option<&str>,
        ) -> Result<MessagePage, SyncError> {
            let idx: usize = page.map(|p| p.parse().unwrap()).unwrap_or(0);
            Ok(self.pages.get(idx).cloned().unwrap_or_default())
        }
        async fn fetch_thread(
            &self,
            _account: &MonitoredAccount,
            _thread_id: &str,
        ) -> Result<Vec<NormalizedMessage>, SyncError> {
            Ok(Vec::new())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    fn msg(id: &str, hour: u32) -> NormalizedMessage {
        NormalizedMessage {
            id: id.to_string(),
            thread_id: "t".to_string(),
            sender_address: "a@x.com".to_string(),
            sender_display_name: String::new(),
            recipient_header: "me@fund.com".to_string(),
            subject: String::new(),
            body: String::new(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 15, hour, 0, 0).unwrap(),
            direction: Direction::Inbound,
            source_account: "me@fund.com".to_string(),
        }
    }

    fn account() -> MonitoredAccount {
        MonitoredAccount::new("me@fund.com")
    }

    #[tokio::test]
    async fn bootstrap_stores_position_and_uses_lookback() {
        let source = FakeSource {
            position: "pos-1".to_string(),
            recent: vec![msg("b", 10), msg("a", 9)],
            ..FakeSource::default()
        };
        let mut cursors = CursorMap::new();
        let out = poll(&source, &account(), &mut cursors, Duration::hours(24), now())
            .await
            .unwrap();
        assert_eq!(out.mode, PollMode::Bootstrap);
        assert_eq!(out.messages[0].id, "a");
        assert_eq!(cursors.get("me@fund.com").map(String::as_str), Some("pos-1"));
        assert_eq!(
            source.list_since_calls.borrow()[0],
            now() - Duration::hours(24)
        );
    }

    #[tokio::test]
    async fn delta_advances_cursor() {
        let source = FakeSource {
            delta: RefCell::new(Some(Ok(ChangeSet {
                messages: vec![msg("c", 11)],
                position: "pos-2".to_string(),
            }))),
            ..FakeSource::default()
        };
        let mut cursors = CursorMap::from([("me@fund.com".to_string(), "pos-1".to_string())]);
        let out = poll(&source, &account(), &mut cursors, Duration::hours(24), now())
            .await
            .unwrap();
        assert_eq!(out.mode, PollMode::Delta);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(cursors["me@fund.com"], "pos-2");
        assert!(source.list_since_calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn invalidated_cursor_rebootstraps_once() {
        let source = FakeSource {
            position: "fresh".to_string(),
            recent: vec![msg("a", 9)],
            ..FakeSource::default()
        };
        let mut cursors = CursorMap::from([("me@fund.com".to_string(), "stale".to_string())]);
        let out = poll(&source, &account(), &mut cursors, Duration::hours(24), now())
            .await
            .unwrap();
        assert_eq!(out.mode, PollMode::Rebootstrap);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(cursors["me@fund.com"], "fresh");
        assert_eq!(source.list_since_calls.borrow().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_keeps_cursor() {
        let source = FakeSource {
            delta: RefCell::new(Some(Err(SyncError::Transport("down".to_string())))),
            ..FakeSource::default()
        };
        let mut cursors = CursorMap::from([("me@fund.com".to_string(), "pos-1".to_string())]);
        let err = poll(&source, &account(), &mut cursors, Duration::hours(24), now())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert_eq!(cursors["me@fund.com"], "pos-1");
    }

    #[tokio::test]
    async fn failed_bootstrap_stores_nothing() {
        let source = FakeSource {
            position: "pos-1".to_string(),
            fail_recent: true,
            ..FakeSource::default()
        };
        let mut cursors = CursorMap::new();
        assert!(
            poll(&source, &account(), &mut cursors, Duration::hours(24), now())
                .await
                .is_err()
        );
        assert!(cursors.is_empty());
    }

    #[tokio::test]
    async fn poll_all_isolates_failures_and_dedups() {
        let source = FakeSource {
            position: "pos".to_string(),
            recent: vec![msg("a", 9)],
            delta: RefCell::new(Some(Err(SyncError::Transport("down".to_string())))),
            ..FakeSource::default()
        };
        let accounts = vec![
            MonitoredAccount::new("broken@fund.com"),
            MonitoredAccount::new("me@fund.com"),
            MonitoredAccount::new("partner@fund.com"),
        ];
        let mut cursors =
            CursorMap::from([("broken@fund.com".to_string(), "pos-0".to_string())]);
        let report = poll_all(&source, &accounts, &mut cursors, Duration::hours(24), now()).await;
        assert_eq!(report.accounts_polled, 3);
        assert_eq!(report.accounts_failed, 1);
        assert_eq!(report.messages.len(), 1, "same message id kept once");
        assert_eq!(cursors["broken@fund.com"], "pos-0");
        assert_eq!(cursors["partner@fund.com"], "pos");
    }

    #[tokio::test]
    async fn fetch_range_pages_until_exhausted() {
        let source = FakeSource {
            pages: vec![
                MessagePage {
                    messages: vec![msg("b", 10)],
                    next_page: Some("1".to_string()),
                },
                MessagePage {
                    messages: vec![msg("a", 9)],
                    next_page: Some("2".to_string()),
                },
                MessagePage {
                    messages: vec![msg("c", 11)],
                    next_page: None,
                },
            ],
            ..FakeSource::default()
        };
        let out = fetch_range(&source, &account(), 30, now()).await.unwrap();
        let ids: Vec<&str> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn fetch_range_rejects_windows_out_of_range() {
        let source = FakeSource::default();
        for days in [0, -1, MAX_WINDOW_DAYS + 1, i64::MAX] {
            let err = fetch_range(&source, &account(), days, now()).await.unwrap_err();
            assert!(matches!(err, SyncError::Configuration(_)), "{days}");
        }
        assert!(fetch_range(&source, &account(), MAX_WINDOW_DAYS, now()).await.is_ok());
    }
}
