//! Turns one counterpart's signals into a write-set.
//!
//! Calendar facts beat classifier guesses: an upcoming meeting always wins,
//! a past meeting only fills in a status the classifier left blank (or at
//! "New Contact"). Existing non-empty cells are never replaced by inference
//! and notes only ever grow.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use core_model::{
    CalendarEvent, CalendarSignal, ClassificationSignal, CrmRecord, Field, FieldSet, TeamMember,
    format_flag, normalize_address,
};
use serde::Serialize;

pub const STATUS_SCHEDULED: &str = "Scheduled";
pub const STATUS_COMPLETED: &str = "Completed";
pub const STATUS_NEW_CONTACT: &str = "New Contact";
pub const STATUS_FALLBACK: &str = "Follow-up";
pub const ALL_MEMBERS: &str = "All";
pub const NOTE_PLACEHOLDER: &str = "Contact picked up from inbox.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotRelevant,
    NotTargetCategory,
    AnalysisFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotRelevant => "not_relevant",
            SkipReason::NotTargetCategory => "not_target_category",
            SkipReason::AnalysisFailed => "analysis_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Update { row_index: usize, fields: FieldSet },
    Create { fields: FieldSet },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeetingFacts {
    pub status: String,
    pub date: String,
    pub time: String,
    pub join_link: String,
    pub detail_link: String,
    pub needs_response: bool,
}

pub struct MergeInput<'a> {
    pub counterpart: &'a str,
    pub display_name: &'a str,
    pub signal: &'a ClassificationSignal,
    pub calendar: &'a CalendarSignal,
    pub existing: Option<&'a CrmRecord>,
    pub thread_summary: Option<&'a str>,
    pub participants: &'a [String],
}

pub struct MergePolicy<'a> {
    pub require_target_category: bool,
    pub team: &'a [TeamMember],
    pub now: DateTime<Utc>,
    pub timezone: FixedOffset,
}

impl MergePolicy<'_> {
    pub fn today(&self) -> NaiveDate {
        self.now.with_timezone(&self.timezone).date_naive()
    }
}

/// Relevance gates, checked before any calendar lookups are spent.
pub fn precheck(signal: &ClassificationSignal, require_target_category: bool) -> Option<SkipReason> {
    if !signal.relevant {
        return Some(SkipReason::NotRelevant);
    }
    if require_target_category && !signal.is_target_category {
        return Some(SkipReason::NotTargetCategory);
    }
    None
}

pub fn derive_meeting(
    signal: &ClassificationSignal,
    calendar: &CalendarSignal,
    now: DateTime<Utc>,
    timezone: FixedOffset,
) -> MeetingFacts {
    let mut facts = MeetingFacts {
        status: signal.meeting_status.trim().to_string(),
        date: signal.meeting_date.trim().to_string(),
        ..MeetingFacts::default()
    };

    if let Some(next) = calendar
        .next_meeting
        .as_ref()
        .filter(|e| !e.cancelled && e.start > now)
    {
        facts.status = STATUS_SCHEDULED.to_string();
        take_event(&mut facts, next, timezone);
        facts.needs_response = next.needs_response;
        return facts;
    }

    if let Some(last) = calendar.last_meeting.as_ref().filter(|e| !e.cancelled)
        && (facts.status.is_empty() || facts.status.eq_ignore_ascii_case(STATUS_NEW_CONTACT))
    {
        facts.status = STATUS_COMPLETED.to_string();
        take_event(&mut facts, last, timezone);
    }

    facts
}

fn take_event(facts: &mut MeetingFacts, event: &CalendarEvent, timezone: FixedOffset) {
    let local = event.start.with_timezone(&timezone);
    facts.date = local.format("%Y-%m-%d").to_string();
    facts.time = local.format("%H:%M").to_string();
    facts.join_link = event.join_link.clone();
    facts.detail_link = event.detail_link.clone();
}

/// The roster member behind this conversation, or [`ALL_MEMBERS`] when no
/// single member can be picked out.
pub fn attribute_member(team: &[TeamMember], participants: &[String]) -> String {
    let mut hits: Vec<&TeamMember> = Vec::new();
    for member in team {
        let address = normalize_address(&member.address);
        if participants.iter().any(|p| normalize_address(p) == address)
            && !hits.iter().any(|h| h.name == member.name)
        {
            hits.push(member);
        }
    }
    match hits.as_slice() {
        [only] => only.name.clone(),
        _ => ALL_MEMBERS.to_string(),
    }
}

/// Appends a dated entry to `existing` notes.
///
/// Returns `None` when the entry text is blank or already present, which
/// keeps replays of the same messages from stacking duplicate entries.
pub fn append_note(existing: &str, entry: &str, today: NaiveDate) -> Option<String> {
    let entry = flatten(entry);
    if entry.is_empty() {
        return None;
    }
    let already = existing
        .lines()
        .any(|line| strip_date_prefix(line.trim()) == entry);
    if already {
        return None;
    }
    let line = format!("[{}] {}", today.format("%Y-%m-%d"), entry);
    if existing.trim().is_empty() {
        Some(line)
    } else {
        Some(format!("{}\n{}", existing.trim_end(), line))
    }
}

fn flatten(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_date_prefix(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix('[')
        && let Some((_, tail)) = rest.split_once("] ")
    {
        return tail.trim();
    }
    line
}

pub fn decide(input: &MergeInput<'_>, policy: &MergePolicy<'_>) -> Decision {
    if let Some(reason) = precheck(input.signal, policy.require_target_category) {
        return Decision::Skip(reason);
    }

    let facts = derive_meeting(input.signal, input.calendar, policy.now, policy.timezone);
    let note = input
        .thread_summary
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(input.signal.note_text.as_str());
    let member = attribute_member(policy.team, input.participants);
    let today = policy.today();
    let today_str = today.format("%Y-%m-%d").to_string();

    match input.existing {
        Some(existing) => {
            let mut fields = FieldSet::new();
            fields.set(Field::LastContactDate, today_str);
            fields.set(Field::AttributedMember, member);
            fields.set(Field::NeedsResponse, format_flag(facts.needs_response));
            fields.set_non_empty(Field::MeetingStatus, &facts.status);
            fields.set_non_empty(Field::MeetingDate, &facts.date);
            fields.set_non_empty(Field::MeetingTime, &facts.time);
            fields.set_non_empty(Field::CalendarLink, &facts.detail_link);
            fields.set_non_empty(Field::MeetLink, &facts.join_link);
            if existing.organization.trim().is_empty() {
                fields.set_non_empty(Field::Organization, &input.signal.organization);
            }
            if existing.name.trim().is_empty() {
                fields.set_non_empty(Field::Name, input.display_name);
            }
            if existing.email.trim().is_empty() {
                fields.set_non_empty(Field::Email, &normalize_address(input.counterpart));
            }
            if let Some(notes) = append_note(&existing.notes, note, today) {
                fields.set(Field::Notes, notes);
            }
            Decision::Update {
                row_index: existing.row_index,
                fields,
            }
        }
        None => {
            let status = if facts.status.is_empty() {
                STATUS_FALLBACK.to_string()
            } else {
                facts.status.clone()
            };
            let seed = if note.trim().is_empty() {
                NOTE_PLACEHOLDER
            } else {
                note
            };
            let mut fields = FieldSet::new();
            fields.set_non_empty(Field::Name, input.display_name);
            fields.set(Field::Email, normalize_address(input.counterpart));
            fields.set_non_empty(Field::Organization, &input.signal.organization);
            fields.set(Field::MeetingStatus, status);
            fields.set_non_empty(Field::MeetingDate, &facts.date);
            fields.set_non_empty(Field::MeetingTime, &facts.time);
            fields.set_non_empty(Field::CalendarLink, &facts.detail_link);
            fields.set_non_empty(Field::MeetLink, &facts.join_link);
            fields.set(Field::NeedsResponse, format_flag(facts.needs_response));
            fields.set(Field::LastContactDate, today_str);
            fields.set(Field::AttributedMember, member);
            if let Some(notes) = append_note("", seed, today) {
                fields.set(Field::Notes, notes);
            }
            Decision::Create { fields }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn event(offset_hours: i64, title: &str) -> CalendarEvent {
        CalendarEvent {
            start: now() + Duration::hours(offset_hours),
            title: title.to_string(),
            join_link: format!("https://meet.example/{title}"),
            detail_link: format!("https://cal.example/{title}"),
            needs_response: false,
            cancelled: false,
        }
    }

    fn signal(status: &str) -> ClassificationSignal {
        ClassificationSignal {
            relevant: true,
            is_target_category: true,
            display_name: "Jane Doe".to_string(),
            organization: "Other Fund".to_string(),
            meeting_status: status.to_string(),
            meeting_date: String::new(),
            note_text: "Asked about the seed round.".to_string(),
        }
    }

    fn policy(team: &[TeamMember]) -> MergePolicy<'_> {
        MergePolicy {
            require_target_category: false,
            team,
            now: now(),
            timezone: utc(),
        }
    }

    fn input<'a>(
        signal: &'a ClassificationSignal,
        calendar: &'a CalendarSignal,
        existing: Option<&'a CrmRecord>,
    ) -> MergeInput<'a> {
        MergeInput {
            counterpart: "Jane@X.com",
            display_name: "Jane Doe",
            signal,
            calendar,
            existing,
            thread_summary: None,
            participants: &[],
        }
    }

    #[test]
    fn status_truth_table() {
        // (classifier status, next meeting in future, last meeting in past) -> status
        let cases = [
            ("", false, false, ""),
            ("", false, true, STATUS_COMPLETED),
            ("", true, false, STATUS_SCHEDULED),
            ("", true, true, STATUS_SCHEDULED),
            ("Pending", false, false, "Pending"),
            ("Pending", false, true, "Pending"),
            ("Pending", true, false, STATUS_SCHEDULED),
            ("Pending", true, true, STATUS_SCHEDULED),
        ];
        for (status, has_next, has_last, expected) in cases {
            let calendar = CalendarSignal {
                next_meeting: has_next.then(|| event(48, "next")),
                last_meeting: has_last.then(|| event(-48, "last")),
            };
            let facts = derive_meeting(&signal(status), &calendar, now(), utc());
            assert_eq!(
                facts.status, expected,
                "status={status:?} next={has_next} last={has_last}"
            );
        }
    }

    #[test]
    fn new_contact_is_upgraded_by_past_meeting() {
        let calendar = CalendarSignal {
            next_meeting: None,
            last_meeting: Some(event(-24, "last")),
        };
        let facts = derive_meeting(&signal("New Contact"), &calendar, now(), utc());
        assert_eq!(facts.status, STATUS_COMPLETED);
        assert_eq!(facts.date, "2025-03-09");
        assert_eq!(facts.time, "12:00");
        assert_eq!(facts.join_link, "https://meet.example/last");
    }

    #[test]
    fn next_meeting_overrides_everything() {
        let mut next = event(26, "next");
        next.needs_response = true;
        let calendar = CalendarSignal {
            next_meeting: Some(next),
            last_meeting: None,
        };
        let mut sig = signal("Completed");
        sig.meeting_date = "2024-12-01".to_string();
        let facts = derive_meeting(&sig, &calendar, now(), utc());
        assert_eq!(facts.status, STATUS_SCHEDULED);
        assert_eq!(facts.date, "2025-03-11");
        assert_eq!(facts.time, "14:00");
        assert!(facts.needs_response);
        assert_eq!(facts.detail_link, "https://cal.example/next");
    }

    #[test]
    fn cancelled_or_past_next_meeting_is_ignored() {
        let mut cancelled = event(24, "next");
        cancelled.cancelled = true;
        let calendar = CalendarSignal {
            next_meeting: Some(cancelled),
            last_meeting: Some(event(-24, "last")),
        };
        assert_eq!(
            derive_meeting(&signal(""), &calendar, now(), utc()).status,
            STATUS_COMPLETED
        );
        let stale = CalendarSignal {
            next_meeting: Some(event(-1, "stale")),
            last_meeting: None,
        };
        assert_eq!(derive_meeting(&signal(""), &stale, now(), utc()).status, "");
    }

    #[test]
    fn cancelled_last_meeting_is_ignored() {
        let mut last = event(-24, "last");
        last.cancelled = true;
        let calendar = CalendarSignal {
            next_meeting: None,
            last_meeting: Some(last),
        };
        assert_eq!(derive_meeting(&signal(""), &calendar, now(), utc()).status, "");
    }

    #[test]
    fn meeting_time_uses_timezone() {
        let calendar = CalendarSignal {
            next_meeting: Some(event(2, "next")),
            last_meeting: None,
        };
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        let facts = derive_meeting(&signal(""), &calendar, now(), tz);
        assert_eq!(facts.time, "09:00");
    }

    #[test]
    fn irrelevant_and_off_category_skip() {
        let calendar = CalendarSignal::default();
        let mut sig = signal("");
        sig.relevant = false;
        assert_eq!(
            decide(&input(&sig, &calendar, None), &policy(&[])),
            Decision::Skip(SkipReason::NotRelevant)
        );

        let mut sig = signal("");
        sig.is_target_category = false;
        let mut strict = policy(&[]);
        strict.require_target_category = true;
        assert_eq!(
            decide(&input(&sig, &calendar, None), &strict),
            Decision::Skip(SkipReason::NotTargetCategory)
        );
        assert!(matches!(
            decide(&input(&sig, &calendar, None), &policy(&[])),
            Decision::Create { .. }
        ));
    }

    #[test]
    fn create_defaults_status_and_seeds_notes() {
        let calendar = CalendarSignal::default();
        let sig = signal("");
        let Decision::Create { fields } = decide(&input(&sig, &calendar, None), &policy(&[])) else {
            panic!("expected create");
        };
        assert_eq!(fields.get(Field::MeetingStatus), Some(STATUS_FALLBACK));
        assert_eq!(fields.get(Field::Email), Some("jane@x.com"));
        assert_eq!(fields.get(Field::Name), Some("Jane Doe"));
        assert_eq!(fields.get(Field::LastContactDate), Some("2025-03-10"));
        assert_eq!(fields.get(Field::AttributedMember), Some(ALL_MEMBERS));
        assert_eq!(
            fields.get(Field::Notes),
            Some("[2025-03-10] Asked about the seed round.")
        );
    }

    #[test]
    fn create_uses_placeholder_without_note() {
        let calendar = CalendarSignal::default();
        let mut sig = signal("");
        sig.note_text.clear();
        let Decision::Create { fields } = decide(&input(&sig, &calendar, None), &policy(&[])) else {
            panic!("expected create");
        };
        assert_eq!(
            fields.get(Field::Notes),
            Some(format!("[2025-03-10] {NOTE_PLACEHOLDER}").as_str())
        );
    }

    #[test]
    fn thread_summary_replaces_single_note() {
        let calendar = CalendarSignal::default();
        let sig = signal("");
        let mut inp = input(&sig, &calendar, None);
        inp.thread_summary = Some("Two emails about the seed round and a deck.");
        let Decision::Create { fields } = decide(&inp, &policy(&[])) else {
            panic!("expected create");
        };
        let notes = fields.get(Field::Notes).unwrap();
        assert!(notes.contains("Two emails about the seed round"));
        assert!(!notes.contains("Asked about the seed round."));
    }

    #[test]
    fn update_never_overwrites_organization() {
        let calendar = CalendarSignal::default();
        let sig = signal("");
        let existing = CrmRecord {
            row_index: 4,
            name: "Jane Doe".to_string(),
            email: "jane@x.com".to_string(),
            organization: "Acme Ventures".to_string(),
            notes: "[2025-01-01] First hello.".to_string(),
            ..CrmRecord::default()
        };
        let Decision::Update { row_index, fields } =
            decide(&input(&sig, &calendar, Some(&existing)), &policy(&[]))
        else {
            panic!("expected update");
        };
        assert_eq!(row_index, 4);
        assert_eq!(fields.get(Field::Organization), None);
        assert_eq!(fields.get(Field::MeetingStatus), None);
        assert_eq!(fields.get(Field::NeedsResponse), Some("No"));
        assert_eq!(
            fields.get(Field::Notes),
            Some("[2025-01-01] First hello.\n[2025-03-10] Asked about the seed round.")
        );
    }

    #[test]
    fn update_fills_blank_organization() {
        let calendar = CalendarSignal::default();
        let sig = signal("");
        let existing = CrmRecord {
            name: "Jane Doe".to_string(),
            ..CrmRecord::default()
        };
        let Decision::Update { fields, .. } =
            decide(&input(&sig, &calendar, Some(&existing)), &policy(&[]))
        else {
            panic!("expected update");
        };
        assert_eq!(fields.get(Field::Organization), Some("Other Fund"));
        assert_eq!(fields.get(Field::Email), Some("jane@x.com"));
        assert_eq!(fields.get(Field::Name), None);
    }

    #[test]
    fn repeated_note_is_not_appended_again() {
        let calendar = CalendarSignal::default();
        let sig = signal("");
        let existing = CrmRecord {
            name: "Jane Doe".to_string(),
            email: "jane@x.com".to_string(),
            notes: "[2025-03-09] Asked about the seed round.".to_string(),
            ..CrmRecord::default()
        };
        let Decision::Update { fields, .. } =
            decide(&input(&sig, &calendar, Some(&existing)), &policy(&[]))
        else {
            panic!("expected update");
        };
        assert_eq!(fields.get(Field::Notes), None);
    }

    #[test]
    fn attribution_rules() {
        let team = vec![
            TeamMember {
                name: "Ana".to_string(),
                address: "ana@fund.com".to_string(),
            },
            TeamMember {
                name: "Raj".to_string(),
                address: "Raj@Fund.com".to_string(),
            },
        ];
        let one = vec!["jane@x.com".to_string(), "raj@fund.com".to_string()];
        assert_eq!(attribute_member(&team, &one), "Raj");
        let both = vec!["ana@fund.com".to_string(), "raj@fund.com".to_string()];
        assert_eq!(attribute_member(&team, &both), ALL_MEMBERS);
        assert_eq!(attribute_member(&team, &["x@y.com".to_string()]), ALL_MEMBERS);
        assert_eq!(attribute_member(&[], &one), ALL_MEMBERS);
    }

    #[test]
    fn append_note_flattens_and_dedups() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let first = append_note("", "line one\n line two", today).unwrap();
        assert_eq!(first, "[2025-03-10] line one line two");
        assert_eq!(append_note(&first, "line one line two", today), None);
        assert_eq!(append_note(&first, "   ", today), None);
        let second = append_note(&first, "next", today).unwrap();
        assert_eq!(second.lines().count(), 2);
    }
}
