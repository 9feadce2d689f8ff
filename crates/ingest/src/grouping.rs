use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use core_model::{Mailbox, NormalizedMessage, normalize_address, parse_mailbox_list};

/// All messages exchanged with one external party during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterpartBatch {
    pub address: String,
    pub display_name: String,
    pub messages: Vec<NormalizedMessage>,
}

impl CounterpartBatch {
    /// Orders messages by (timestamp, id), oldest first.
    pub fn sort_oldest_first(&mut self) {
        self.messages.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    /// Last message in current order; call `sort_oldest_first` first.
    pub fn latest(&self) -> Option<&NormalizedMessage> {
        self.messages.last()
    }

    pub fn participants(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for msg in &self.messages {
            for addr in msg.participants() {
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
        }
        out
    }
}

/// Works out who the external party of `msg` is.
///
/// Outbound mail (sender is monitored) resolves to the first non-monitored
/// recipient; everything else resolves to the sender. Internal-only traffic
/// yields `None`.
pub fn resolve_counterpart(
    msg: &NormalizedMessage,
    monitored: &BTreeSet<String>,
) -> Option<Mailbox> {
    let sender = normalize_address(&msg.sender_address);
    let candidate = if monitored.contains(&sender) {
        parse_mailbox_list(&msg.recipient_header)
            .into_iter()
            .find(|m| !monitored.contains(&m.address))?
    } else {
        Mailbox {
            display_name: msg.sender_display_name.trim().to_string(),
            address: sender,
        }
    };
    if candidate.address.is_empty() || monitored.contains(&candidate.address) {
        return None;
    }
    Some(candidate)
}

/// Buckets messages by counterpart, keeping first-seen order of both the
/// buckets and the messages inside each bucket. The display name comes from
/// the newest message, by (timestamp, id), that carried one.
pub fn group_by_counterpart(
    messages: Vec<NormalizedMessage>,
    monitored: &BTreeSet<String>,
) -> Vec<CounterpartBatch> {
    let mut out: Vec<CounterpartBatch> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut named_at: Vec<Option<(DateTime<Utc>, String)>> = Vec::new();
    for msg in messages {
        let Some(counterpart) = resolve_counterpart(&msg, monitored) else {
            continue;
        };
        let slot = *slots.entry(counterpart.address.clone()).or_insert_with(|| {
            out.push(CounterpartBatch {
                address: counterpart.address.clone(),
                display_name: String::new(),
                messages: Vec::new(),
            });
            named_at.push(None);
            out.len() - 1
        });
        let key = (msg.timestamp, msg.id.clone());
        let newer = named_at[slot].as_ref().is_none_or(|seen| key >= *seen);
        if !counterpart.display_name.is_empty() && newer {
            out[slot].display_name = counterpart.display_name;
            named_at[slot] = Some(key);
        }
        out[slot].messages.push(msg);
    }
    out
}
