//! Calendar source over a single JSON export (`calendar.json`).

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_model::{CalendarEvent, CalendarSource, SyncError, normalize_address};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    pub email: String,
    #[serde(default)]
    pub response_status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedEvent {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub join_link: String,
    #[serde(default)]
    pub detail_link: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub attendees: Vec<Attendee>,
}

impl ExportedEvent {
    fn is_cancelled(&self) -> bool {
        self.status.eq_ignore_ascii_case("cancelled")
    }

    fn has_attendee(&self, address: &str) -> bool {
        self.attendees
            .iter()
            .any(|a| normalize_address(&a.email) == address)
    }

    /// Someone on our side has not answered the invite yet.
    fn awaits_response(&self, own: &[String]) -> bool {
        self.attendees.iter().any(|a| {
            a.response_status.eq_ignore_ascii_case("needsAction")
                && own.contains(&normalize_address(&a.email))
        })
    }

    fn to_event(&self, own: &[String]) -> CalendarEvent {
        CalendarEvent {
            start: self.start,
            title: self.title.clone(),
            join_link: self.join_link.clone(),
            detail_link: self.detail_link.clone(),
            needs_response: self.awaits_response(own),
            cancelled: self.is_cancelled(),
        }
    }
}

pub struct CalendarFile {
    path: PathBuf,
    own_addresses: Vec<String>,
    clock: fn() -> DateTime<Utc>,
}

impl CalendarFile {
    /// `own_addresses` are the monitored accounts; their pending responses
    /// mark an event as needing a reply.
    pub fn new(path: impl Into<PathBuf>, own_addresses: &[String]) -> Self {
        Self {
            path: path.into(),
            own_addresses: own_addresses.iter().map(|a| normalize_address(a)).collect(),
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// All events in the export. A missing file reads as an empty calendar.
    pub async fn events(&self) -> Result<Vec<ExportedEvent>, SyncError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no calendar export");
                return Ok(Vec::new());
            }
            Err(err) => return Err(SyncError::transport(err)),
        };
        serde_json::from_str(&raw).map_err(|err| {
            SyncError::Transport(format!("invalid calendar export {}: {err}", self.path.display()))
        })
    }

    async fn candidates(&self, address: &str) -> Result<Vec<ExportedEvent>, SyncError> {
        let address = normalize_address(address);
        Ok(self
            .events()
            .await?
            .into_iter()
            .filter(|e| !e.is_cancelled() && e.has_attendee(&address))
            .collect())
    }
}

#[async_trait(?Send)]
impl CalendarSource for CalendarFile {
    async fn find_next_meeting(&self, address: &str) -> Result<Option<CalendarEvent>, SyncError> {
        let now = (self.clock)();
        Ok(self
            .candidates(address)
            .await?
            .iter()
            .filter(|e| e.start > now)
            .min_by_key(|e| e.start)
            .map(|e| e.to_event(&self.own_addresses)))
    }

    async fn find_last_meeting(&self, address: &str) -> Result<Option<CalendarEvent>, SyncError> {
        let now = (self.clock)();
        Ok(self
            .candidates(address)
            .await?
            .iter()
            .filter(|e| e.start <= now)
            .max_by_key(|e| e.start)
            .map(|e| e.to_event(&self.own_addresses)))
    }
}
