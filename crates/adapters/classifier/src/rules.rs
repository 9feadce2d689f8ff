use async_trait::async_trait;
use core_model::{
    ClassificationSignal, Classifier, CrmRecord, Direction, Field, FieldSet, NormalizedMessage,
    RefineRequest, SyncError, domain, local_part, normalize_address, parse_mailbox_list,
};
use fuzzy_matcher::{FuzzyMatcher, skim::SkimMatcherV2};
use tracing::debug;

const AUTOMATED_SENDERS: [&str; 7] = [
    "noreply",
    "no-reply",
    "donotreply",
    "do-not-reply",
    "notifications",
    "mailer-daemon",
    "newsletter",
];
const BULK_MARKERS: [&str; 3] = ["unsubscribe", "view in browser", "manage preferences"];
const FREE_MAIL: [&str; 8] = [
    "gmail.com",
    "googlemail.com",
    "outlook.com",
    "hotmail.com",
    "live.com",
    "yahoo.com",
    "icloud.com",
    "proton.me",
];
/// Word prefixes and the status they suggest, first hit wins.
const STATUS_HINTS: [(&str, &str); 6] = [
    ("reschedul", "Rescheduling"),
    ("intro", "New Contact"),
    ("meeting", "Meeting Requested"),
    ("meet", "Meeting Requested"),
    ("call", "Meeting Requested"),
    ("catchup", "Meeting Requested"),
];
const NOTE_LIMIT: usize = 200;
const ANSWER_LIMIT: usize = 5;

/// Deterministic keyword classifier for running without a model.
#[derive(Debug, Clone, Default)]
pub struct RuleClassifier {
    target_keywords: Vec<String>,
    own_addresses: Vec<String>,
}

impl RuleClassifier {
    /// Empty `target_keywords` puts every relevant contact in the target
    /// category.
    pub fn new(target_keywords: &[String], own_addresses: &[String]) -> Self {
        Self {
            target_keywords: target_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            own_addresses: own_addresses.iter().map(|a| normalize_address(a)).collect(),
        }
    }

    /// The external party of `message` as (address, display name).
    fn counterpart(&self, message: &NormalizedMessage) -> (String, String) {
        if message.direction == Direction::Outbound
            && let Some(m) = parse_mailbox_list(&message.recipient_header)
                .into_iter()
                .find(|m| !self.own_addresses.contains(&m.address))
        {
            return (m.address, m.display_name);
        }
        (
            normalize_address(&message.sender_address),
            message.sender_display_name.trim().to_string(),
        )
    }

    fn target(&self, text: &str) -> bool {
        self.target_keywords.is_empty() || self.target_keywords.iter().any(|k| text.contains(k))
    }
}

fn message_text(message: &NormalizedMessage) -> String {
    format!("{} {}", message.subject, message.body).to_lowercase()
}

fn is_automated(address: &str, text: &str) -> bool {
    let local = local_part(address);
    AUTOMATED_SENDERS.iter().any(|s| local.contains(s)) || BULK_MARKERS.iter().any(|m| text.contains(m))
}

/// "acme-ventures.co.uk" -> "Acme Ventures". Free-mail domains give nothing.
pub fn organization_from_address(address: &str) -> String {
    let Some(domain) = domain(address) else {
        return String::new();
    };
    let domain = domain.to_lowercase();
    if FREE_MAIL.contains(&domain.as_str()) {
        return String::new();
    }
    let label = domain.split('.').next().unwrap_or_default();
    title_case(&label.replace(['-', '_'], " "))
}

/// "jane.doe@x.com" -> "Jane Doe".
pub fn name_from_address(address: &str) -> String {
    title_case(&local_part(address).replace(['.', '_', '-'], " "))
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn status_hint(text: &str) -> Option<&'static str> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let joined = words.join("");
    STATUS_HINTS.iter().find_map(|(prefix, status)| {
        let hit = words.iter().any(|w| w.starts_with(prefix))
            || (prefix.len() > 5 && joined.contains(prefix));
        hit.then_some(*status)
    })
}

fn note_for(message: &NormalizedMessage) -> String {
    let snippet = message
        .body
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let subject = message.subject.trim();
    let note = match (subject.is_empty(), snippet.is_empty()) {
        (false, false) => format!("{subject}: {snippet}"),
        (false, true) => subject.to_string(),
        (true, _) => snippet.to_string(),
    };
    truncate(&note, NOTE_LIMIT)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}...", cut.trim_end())
}

fn summarize(messages: &[NormalizedMessage]) -> String {
    let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
        return String::new();
    };
    let span = if first.timestamp.date_naive() == last.timestamp.date_naive() {
        format!("on {}", first.timestamp.format("%Y-%m-%d"))
    } else {
        format!(
            "between {} and {}",
            first.timestamp.format("%Y-%m-%d"),
            last.timestamp.format("%Y-%m-%d")
        )
    };
    format!("{} messages {span}. Latest: {}", messages.len(), note_for(last))
}

fn record_text(record: &CrmRecord) -> String {
    [
        record.name.as_str(),
        record.email.as_str(),
        record.organization.as_str(),
        record.meeting_status.as_str(),
        record.meeting_date.as_str(),
        record.notes.as_str(),
    ]
    .join(" ")
}

fn describe(record: &CrmRecord) -> String {
    let mut line = if record.name.is_empty() {
        record.email.clone()
    } else if record.email.is_empty() {
        record.name.clone()
    } else {
        format!("{} <{}>", record.name, record.email)
    };
    for extra in [&record.organization, &record.meeting_status, &record.meeting_date] {
        if !extra.is_empty() {
            line.push_str(", ");
            line.push_str(extra);
        }
    }
    line
}

#[async_trait(?Send)]
impl Classifier for RuleClassifier {
    async fn classify(
        &self,
        message: &NormalizedMessage,
        existing: Option<&CrmRecord>,
    ) -> Result<ClassificationSignal, SyncError> {
        let text = message_text(message);
        let (address, display_name) = self.counterpart(message);
        let display_name = match (display_name.is_empty(), existing) {
            (false, _) => display_name,
            (true, Some(record)) if !record.name.is_empty() => record.name.clone(),
            (true, _) => name_from_address(&address),
        };
        let organization = existing
            .map(|r| r.organization.clone())
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| organization_from_address(&address));
        Ok(ClassificationSignal {
            relevant: !is_automated(&address, &text),
            is_target_category: existing.is_some() || self.target(&text),
            display_name,
            organization,
            meeting_status: status_hint(&text).unwrap_or_default().to_string(),
            meeting_date: String::new(),
            note_text: note_for(message),
        })
    }

    async fn summarize_thread(&self, messages: &[NormalizedMessage]) -> Result<String, SyncError> {
        Ok(summarize(messages))
    }

    async fn refine(&self, request: &RefineRequest<'_>) -> Result<FieldSet, SyncError> {
        if let Some(guidance) = request.guidance {
            debug!(guidance, "rule classifier cannot follow guidance; using rules");
        }
        let email = normalize_address(&request.record.email);
        let latest_inbound = request
            .messages
            .iter()
            .rev()
            .find(|m| normalize_address(&m.sender_address) == email);
        let mut out = FieldSet::new();
        for field in request.fields {
            match field {
                Field::Name => {
                    let name = latest_inbound
                        .map(|m| m.sender_display_name.trim().to_string())
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| name_from_address(&email));
                    out.set_non_empty(Field::Name, &name);
                }
                Field::Organization => {
                    out.set_non_empty(Field::Organization, &organization_from_address(&email));
                }
                Field::MeetingStatus => {
                    if let Some(status) = request.messages.last().and_then(|m| status_hint(&message_text(m))) {
                        out.set(Field::MeetingStatus, status);
                    }
                }
                Field::Notes => {
                    out.set_non_empty(Field::Notes, &summarize(request.messages));
                }
                _ => {}
            }
        }
        Ok(out)
    }

    async fn answer(&self, question: &str, records: &[CrmRecord]) -> Result<String, SyncError> {
        let terms: Vec<String> = question
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|t| t.chars().count() >= 3)
            .collect();
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &CrmRecord)> = records
            .iter()
            .filter_map(|record| {
                let text = record_text(record);
                let total: i64 = terms
                    .iter()
                    .filter_map(|term| matcher.fuzzy_match(&text, term))
                    .sum();
                (total > 0).then_some((total, record))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        if scored.is_empty() {
            return Ok(format!("No contacts match \"{}\".", question.trim()));
        }
        let shown = scored.len().min(ANSWER_LIMIT);
        let mut out = format!("{} matching contact(s):", scored.len());
        for (_, record) in scored.iter().take(shown) {
            out.push_str("\n- ");
            out.push_str(&describe(record));
        }
        Ok(out)
    }
}
