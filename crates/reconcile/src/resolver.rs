//! Finds the existing record a counterpart belongs to.
//!
//! Three passes, strongest first, each scanning records top to bottom:
//! exact email, every display-name token inside the stored name, then the
//! email local part read as a name. The name passes let a known person who
//! writes from a new address land on their existing row; they can also merge
//! two different people who share a common name.

use core_model::{CrmRecord, local_part, normalize_address};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Email,
    NameTokens,
    LocalPart,
}

#[derive(Debug, Clone, Copy)]
pub struct Match<'a> {
    pub record: &'a CrmRecord,
    pub kind: MatchKind,
}

pub fn resolve<'a>(
    email: &str,
    display_name: &str,
    records: &'a [CrmRecord],
    email_bound: bool,
) -> Option<Match<'a>> {
    let email = normalize_address(email);

    if email_bound && !email.is_empty() {
        if let Some(record) = records.iter().find(|r| r.email == email) {
            return Some(Match {
                record,
                kind: MatchKind::Email,
            });
        }
    }

    let tokens = name_tokens(display_name);
    if tokens.len() >= 2 {
        let hit = records.iter().find(|r| {
            let name = normalize_name(&r.name);
            !name.is_empty() && tokens.iter().all(|t| name.contains(t.as_str()))
        });
        if let Some(record) = hit {
            return Some(Match {
                record,
                kind: MatchKind::NameTokens,
            });
        }
    }

    let pseudo = pseudo_name(&email);
    if !pseudo.is_empty() {
        let hit = records.iter().find(|r| {
            let name = normalize_name(&r.name);
            !name.is_empty() && (name.contains(&pseudo) || pseudo.contains(&name))
        });
        if let Some(record) = hit {
            return Some(Match {
                record,
                kind: MatchKind::LocalPart,
            });
        }
    }

    None
}

pub fn normalize_name(name: &str) -> String {
    name_tokens(name).join(" ")
}

fn name_tokens(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// `jane.doe_smith-x@host` → `jane doe smith x`.
pub fn pseudo_name(email: &str) -> String {
    normalize_name(&local_part(email).replace(['.', '_', '-'], " "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(row: usize, name: &str, email: &str) -> CrmRecord {
        CrmRecord {
            row_index: row,
            name: name.to_string(),
            email: email.to_string(),
            ..CrmRecord::default()
        }
    }

    #[test]
    fn exact_email_wins_over_earlier_name_match() {
        let records = vec![
            record(0, "John Smith", "john@acme.com"),
            record(1, "Someone Else", "j.smith@newdomain.com"),
        ];
        let hit = resolve("J.Smith@NewDomain.com", "John Smith", &records, true).unwrap();
        assert_eq!(hit.record.row_index, 1);
        assert_eq!(hit.kind, MatchKind::Email);
    }

    #[test]
    fn name_tokens_match_without_email_column() {
        let records = vec![record(0, "Alice Wong", ""), record(1, "John  Smith", "")];
        let hit = resolve("j.smith@newdomain.com", "John Smith", &records, false).unwrap();
        assert_eq!(hit.record.row_index, 1);
        assert_eq!(hit.kind, MatchKind::NameTokens);
    }

    #[test]
    fn email_pass_ignored_when_unbound() {
        let records = vec![record(0, "Zed", "z@x.com")];
        assert!(resolve("z@x.com", "", &records, false).is_none());
    }

    #[test]
    fn single_token_name_does_not_use_token_pass() {
        let records = vec![record(0, "John Smith", "")];
        assert!(resolve("someone@x.com", "John", &records, false).is_none());
    }

    #[test]
    fn name_tokens_are_substrings_of_stored_name() {
        let records = vec![record(0, "Johnathan Smithers (Acme)", "")];
        let hit = resolve("x@y.com", "john smith", &records, false).unwrap();
        assert_eq!(hit.kind, MatchKind::NameTokens);
    }

    #[test]
    fn local_part_heuristic() {
        let records = vec![record(0, "Bob", ""), record(1, "Jane Doe", "")];
        let hit = resolve("jane.doe@x.com", "", &records, true).unwrap();
        assert_eq!(hit.record.row_index, 1);
        assert_eq!(hit.kind, MatchKind::LocalPart);
    }

    #[test]
    fn local_part_contains_stored_name() {
        let records = vec![record(0, "Doe", "")];
        let hit = resolve("jane_doe@x.com", "", &records, true).unwrap();
        assert_eq!(hit.kind, MatchKind::LocalPart);
    }

    #[test]
    fn blank_names_never_match() {
        let records = vec![record(0, "", ""), record(1, "  ", "")];
        assert!(resolve("jane.doe@x.com", "Jane Doe", &records, true).is_none());
    }

    #[test]
    fn new_counterpart_resolves_to_none() {
        let records = vec![record(0, "Jane Doe", "jane@x.com")];
        assert!(resolve("bob@startup.io", "Bob Lee", &records, true).is_none());
    }

    #[test]
    fn pseudo_name_splits_separators() {
        assert_eq!(pseudo_name("jane.doe_smith-x@host.com"), "jane doe smith x");
        assert_eq!(pseudo_name("@host.com"), "");
    }
}
