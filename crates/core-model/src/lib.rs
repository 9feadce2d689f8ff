use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

mod address;
mod error;

pub use address::{Mailbox, domain, local_part, normalize_address, parse_mailbox, parse_mailbox_list};
pub use error::SyncError;

/// Per-account position tokens, keyed by lowercase account address.
pub type CursorMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitoredAccount {
    pub address: String,
}

impl MonitoredAccount {
    pub fn new(address: &str) -> Self {
        Self {
            address: normalize_address(address),
        }
    }
}

impl fmt::Display for MonitoredAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub id: String,
    pub thread_id: String,
    pub sender_address: String,
    pub sender_display_name: String,
    pub recipient_header: String,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub source_account: String,
}

impl NormalizedMessage {
    /// Every address that took part in the message, sender first.
    pub fn participants(&self) -> Vec<String> {
        let mut out = vec![self.sender_address.clone()];
        for mailbox in parse_mailbox_list(&self.recipient_header) {
            if !out.contains(&mailbox.address) {
                out.push(mailbox.address);
            }
        }
        out
    }
}

/// Structured classifier verdict for one counterpart. Advisory for meeting facts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassificationSignal {
    pub relevant: bool,
    pub is_target_category: bool,
    pub display_name: String,
    pub organization: String,
    pub meeting_status: String,
    pub meeting_date: String,
    pub note_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub start: DateTime<Utc>,
    pub title: String,
    #[serde(default)]
    pub join_link: String,
    #[serde(default)]
    pub detail_link: String,
    #[serde(default)]
    pub needs_response: bool,
    #[serde(default)]
    pub cancelled: bool,
}

/// Calendar truth for one counterpart. Authoritative for meeting facts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarSignal {
    pub next_meeting: Option<CalendarEvent>,
    pub last_meeting: Option<CalendarEvent>,
}

/// Canonical record fields, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Name,
    Email,
    Organization,
    MeetingStatus,
    MeetingDate,
    MeetingTime,
    LastContactDate,
    AttributedMember,
    CalendarLink,
    MeetLink,
    NeedsResponse,
    Notes,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::Name,
        Field::Email,
        Field::Organization,
        Field::MeetingStatus,
        Field::MeetingDate,
        Field::MeetingTime,
        Field::LastContactDate,
        Field::AttributedMember,
        Field::CalendarLink,
        Field::MeetLink,
        Field::NeedsResponse,
        Field::Notes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Email => "email",
            Field::Organization => "organization",
            Field::MeetingStatus => "meeting_status",
            Field::MeetingDate => "meeting_date",
            Field::MeetingTime => "meeting_time",
            Field::LastContactDate => "last_contact_date",
            Field::AttributedMember => "attributed_member",
            Field::CalendarLink => "calendar_link",
            Field::MeetLink => "meet_link",
            Field::NeedsResponse => "needs_response",
            Field::Notes => "notes",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Field {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace(['-', ' '], "_");
        let wanted = match wanted.as_str() {
            "company" | "org" => "organization",
            "status" => "meeting_status",
            "date" => "meeting_date",
            "time" => "meeting_time",
            other => other,
        }
        .to_string();
        Field::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| anyhow::anyhow!("unknown field: {s}"))
    }
}

/// One contact row, decoded through the discovered schema.
///
/// `raw` holds the row exactly as read, so columns the schema did not bind
/// survive every write untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrmRecord {
    pub row_index: usize,
    pub name: String,
    pub email: String,
    pub organization: String,
    pub meeting_status: String,
    pub meeting_date: String,
    pub meeting_time: String,
    pub last_contact_date: String,
    pub attributed_member: String,
    pub calendar_link: String,
    pub meet_link: String,
    pub needs_response: bool,
    pub notes: String,
    pub raw: Vec<String>,
}

impl CrmRecord {
    pub fn get(&self, field: Field) -> String {
        match field {
            Field::Name => self.name.clone(),
            Field::Email => self.email.clone(),
            Field::Organization => self.organization.clone(),
            Field::MeetingStatus => self.meeting_status.clone(),
            Field::MeetingDate => self.meeting_date.clone(),
            Field::MeetingTime => self.meeting_time.clone(),
            Field::LastContactDate => self.last_contact_date.clone(),
            Field::AttributedMember => self.attributed_member.clone(),
            Field::CalendarLink => self.calendar_link.clone(),
            Field::MeetLink => self.meet_link.clone(),
            Field::NeedsResponse => format_flag(self.needs_response).to_string(),
            Field::Notes => self.notes.clone(),
        }
    }

    pub fn set(&mut self, field: Field, value: &str) {
        let value = value.to_string();
        match field {
            Field::Name => self.name = value,
            Field::Email => self.email = normalize_address(&value),
            Field::Organization => self.organization = value,
            Field::MeetingStatus => self.meeting_status = value,
            Field::MeetingDate => self.meeting_date = value,
            Field::MeetingTime => self.meeting_time = value,
            Field::LastContactDate => self.last_contact_date = value,
            Field::AttributedMember => self.attributed_member = value,
            Field::CalendarLink => self.calendar_link = value,
            Field::MeetLink => self.meet_link = value,
            Field::NeedsResponse => self.needs_response = parse_flag(&value),
            Field::Notes => self.notes = value,
        }
    }

    pub fn apply(&mut self, fields: &FieldSet) {
        for (field, value) in fields.iter() {
            self.set(*field, value);
        }
    }
}

/// Ordered write-set of field values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    entries: Vec<(Field, String)>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `field`, replacing an earlier value for the same field in place.
    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(f, _)| *f == field) {
            slot.1 = value;
        } else {
            self.entries.push((field, value));
        }
    }

    /// Sets `field` only when `value` is non-empty after trimming.
    pub fn set_non_empty(&mut self, field: Field, value: &str) {
        if !value.trim().is_empty() {
            self.set(field, value.trim());
        }
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.entries
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, field: Field) -> Option<String> {
        let pos = self.entries.iter().position(|(f, _)| *f == field)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Field, String)> {
        self.entries.iter()
    }

    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.entries.iter().map(|(f, _)| *f)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries whose value already matches `record`.
    pub fn retain_changes(&mut self, record: &CrmRecord) {
        self.entries
            .retain(|(field, value)| record.get(*field) != *value);
    }
}

impl FromIterator<(Field, String)> for FieldSet {
    fn from_iter<T: IntoIterator<Item = (Field, String)>>(iter: T) -> Self {
        let mut set = FieldSet::new();
        for (field, value) in iter {
            set.set(field, value);
        }
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Highlight {
    NeedsResponse,
    Upcoming,
    Default,
}

impl Highlight {
    pub fn as_str(&self) -> &'static str {
        match self {
            Highlight::NeedsResponse => "needs-response",
            Highlight::Upcoming => "upcoming",
            Highlight::Default => "default",
        }
    }
}

impl std::str::FromStr for Highlight {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "needs-response" => Ok(Highlight::NeedsResponse),
            "upcoming" => Ok(Highlight::Upcoming),
            "default" => Ok(Highlight::Default),
            _ => anyhow::bail!("unknown highlight: {s}"),
        }
    }
}

/// A stored row: its position plus every cell as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    pub index: usize,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    pub column: usize,
    pub value: String,
}

/// How the cells of a sort column compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKind {
    Text,
    /// Any of [`DATE_FORMATS`]; unparseable cells follow parsed ones.
    Date,
    /// 24-hour or am/pm clock times; unparseable cells follow parsed ones.
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortColumn {
    pub index: usize,
    pub kind: SortKind,
}

impl SortColumn {
    pub fn new(index: usize, kind: SortKind) -> Self {
        Self { index, kind }
    }
}

/// Columns to sort by, in priority order, all ascending.
/// Empty cells sort after non-empty ones; ties keep store order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    pub columns: Vec<SortColumn>,
}

impl SortSpec {
    /// Plain text ordering on each of `columns`.
    pub fn text(columns: &[usize]) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|&index| SortColumn::new(index, SortKind::Text))
                .collect(),
        }
    }
}

/// Date layouts accepted in meeting-date cells.
pub const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];
const TIME_FORMATS: [&str; 4] = ["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M%p"];

pub fn parse_sheet_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

pub fn parse_sheet_time(value: &str) -> Option<NaiveTime> {
    let value = value.trim().to_uppercase();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&value, fmt).ok())
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub messages: Vec<NormalizedMessage>,
    pub position: String,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<NormalizedMessage>,
    pub next_page: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub name: String,
    pub address: String,
}

pub struct RefineRequest<'a> {
    pub record: &'a CrmRecord,
    pub messages: &'a [NormalizedMessage],
    pub fields: &'a [Field],
    pub guidance: Option<&'a str>,
}

#[async_trait(?Send)]
pub trait MessageSource {
    /// Server position token for "now"; used to seed a fresh cursor.
    async fn current_position(&self, account: &MonitoredAccount) -> Result<String, SyncError>;
    async fn list_since(
        &self,
        account: &MonitoredAccount,
        since: DateTime<Utc>,
    ) -> Result<Vec<NormalizedMessage>, SyncError>;
    /// Delta since `cursor`. Fails with `CursorInvalidated` when the
    /// upstream no longer holds history that old.
    async fn list_changes(
        &self,
        account: &MonitoredAccount,
        cursor: &str,
    ) -> Result<ChangeSet, SyncError>;
    async fn fetch_page(
        &self,
        account: &MonitoredAccount,
        since: DateTime<Utc>,
        page: Option<&str>,
    ) -> Result<MessagePage, SyncError>;
    async fn fetch_thread(
        &self,
        account: &MonitoredAccount,
        thread_id: &str,
    ) -> Result<Vec<NormalizedMessage>, SyncError>;
}

#[async_trait(?Send)]
pub trait CalendarSource {
    async fn find_next_meeting(&self, address: &str) -> Result<Option<CalendarEvent>, SyncError>;
    async fn find_last_meeting(&self, address: &str) -> Result<Option<CalendarEvent>, SyncError>;
}

#[async_trait(?Send)]
pub trait Classifier {
    async fn classify(
        &self,
        message: &NormalizedMessage,
        existing: Option<&CrmRecord>,
    ) -> Result<ClassificationSignal, SyncError>;
    async fn summarize_thread(&self, messages: &[NormalizedMessage]) -> Result<String, SyncError>;
    /// Proposes values for `request.fields` only; other entries are ignored.
    async fn refine(&self, request: &RefineRequest<'_>) -> Result<FieldSet, SyncError>;
    async fn answer(&self, question: &str, records: &[CrmRecord]) -> Result<String, SyncError>;
}

#[async_trait(?Send)]
pub trait RecordStore {
    async fn read_header(&self) -> Result<Vec<String>, SyncError>;
    async fn read_all_rows(&self) -> Result<Vec<SheetRow>, SyncError>;
    /// Appends a row and returns the index the store assigned to it.
    async fn append_row(&mut self, cells: Vec<String>) -> Result<usize, SyncError>;
    async fn update_row(&mut self, index: usize, updates: &[CellUpdate]) -> Result<(), SyncError>;
    async fn sort_rows(&mut self, spec: &SortSpec) -> Result<(), SyncError>;
    async fn recolor_row(&mut self, index: usize, highlight: Highlight) -> Result<(), SyncError>;
    async fn clear_all_rows(&mut self) -> Result<(), SyncError>;

    async fn load_cursors(&self) -> Result<CursorMap, SyncError> {
        Ok(CursorMap::new())
    }

    async fn save_cursors(&mut self, _cursors: &CursorMap) -> Result<(), SyncError> {
        Ok(())
    }
}

pub fn deterministic_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.finalize().to_hex().to_string()
}

pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "yes" | "y" | "true" | "1" | "x"
    )
}

pub fn format_flag(value: bool) -> &'static str {
    if value { "Yes" } else { "No" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_dates_and_times_parse() {
        let march = NaiveDate::from_ymd_opt(2025, 3, 20).unwrap();
        assert_eq!(parse_sheet_date("03/20/2025"), Some(march));
        assert_eq!(parse_sheet_date(" 2025-03-20 "), Some(march));
        assert_eq!(parse_sheet_date("next Tuesday"), None);

        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        assert_eq!(parse_sheet_time("9:00"), Some(nine));
        assert_eq!(parse_sheet_time("09:00"), Some(nine));
        assert_eq!(parse_sheet_time("9:00 am"), Some(nine));
        assert_eq!(
            parse_sheet_time("2:30 PM"),
            NaiveTime::from_hms_opt(14, 30, 0)
        );
        assert_eq!(parse_sheet_time("after lunch"), None);
    }

    #[test]
    fn deterministic_id_stable() {
        let id1 = deterministic_id(&["a", "b"]);
        let id2 = deterministic_id(&["a", "b"]);
        assert_eq!(id1, id2);
    }

    #[test]
    fn deterministic_id_order_matters() {
        let id1 = deterministic_id(&["a", "b"]);
        let id2 = deterministic_id(&["b", "a"]);
        assert_ne!(id1, id2);
    }

    #[test]
    fn field_from_str_accepts_aliases() {
        assert_eq!("company".parse::<Field>().unwrap(), Field::Organization);
        assert_eq!("Meeting Date".parse::<Field>().unwrap(), Field::MeetingDate);
        assert_eq!("status".parse::<Field>().unwrap(), Field::MeetingStatus);
        assert!("favourite colour".parse::<Field>().is_err());
    }

    #[test]
    fn field_set_replaces_in_place() {
        let mut set = FieldSet::new();
        set.set(Field::Name, "A");
        set.set(Field::Email, "a@x.com");
        set.set(Field::Name, "B");
        let fields: Vec<Field> = set.fields().collect();
        assert_eq!(fields, vec![Field::Name, Field::Email]);
        assert_eq!(set.get(Field::Name), Some("B"));
    }

    #[test]
    fn set_non_empty_ignores_blank() {
        let mut set = FieldSet::new();
        set.set_non_empty(Field::Organization, "   ");
        assert!(set.is_empty());
    }

    #[test]
    fn retain_changes_drops_equal_values() {
        let record = CrmRecord {
            name: "Jane Doe".to_string(),
            needs_response: true,
            ..CrmRecord::default()
        };
        let mut set = FieldSet::new();
        set.set(Field::Name, "Jane Doe");
        set.set(Field::NeedsResponse, "Yes");
        set.set(Field::Organization, "Acme");
        set.retain_changes(&record);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(Field::Organization), Some("Acme"));
    }

    #[test]
    fn flags_round_trip_through_text() {
        assert!(parse_flag(format_flag(true)));
        assert!(!parse_flag(format_flag(false)));
        assert!(parse_flag(" TRUE "));
        assert!(!parse_flag(""));
    }

    #[test]
    fn participants_are_deduplicated() {
        let msg = NormalizedMessage {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            sender_address: "a@x.com".to_string(),
            sender_display_name: String::new(),
            recipient_header: "B <b@y.com>, a@x.com".to_string(),
            subject: String::new(),
            body: String::new(),
            timestamp: Utc::now(),
            direction: Direction::Inbound,
            source_account: "b@y.com".to_string(),
        };
        assert_eq!(msg.participants(), vec!["a@x.com", "b@y.com"]);
    }

    #[test]
    fn classification_signal_tolerates_missing_keys() {
        let signal: ClassificationSignal =
            serde_json::from_str(r#"{"relevant": true, "displayName": "Jane"}"#).unwrap();
        assert!(signal.relevant);
        assert!(!signal.is_target_category);
        assert_eq!(signal.display_name, "Jane");
    }
}
