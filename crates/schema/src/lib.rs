//! Header-row discovery: binds canonical contact fields to whatever columns a
//! sheet happens to have, and converts rows to and from [`CrmRecord`]s.

use std::collections::BTreeMap;

use core_model::Field;
use serde::Serialize;
use tracing::debug;

mod codec;

pub use codec::{decode_row, encode_new_row, encode_updates};

/// Alias fragments per field, in binding priority order.
///
/// `LastContactDate` is bound before `MeetingDate` so a generic "date" alias
/// cannot claim a "Last Contact Date" column.
pub const FIELD_ALIASES: &[(Field, &[&str])] = &[
    (Field::Email, &["email", "e-mail", "mail address"]),
    (Field::Name, &["name", "full name", "contact name", "person"]),
    (
        Field::Organization,
        &["organization", "organisation", "company", "fund", "firm", "org"],
    ),
    (Field::LastContactDate, &["last contact", "last contacted", "last touch"]),
    (Field::MeetingStatus, &["meeting status", "status", "stage"]),
    (Field::MeetingDate, &["meeting date", "date"]),
    (Field::MeetingTime, &["meeting time", "time"]),
    (
        Field::AttributedMember,
        &["team member", "attributed", "owner", "assigned", "member"],
    ),
    (Field::CalendarLink, &["calendar link", "calendar", "event link", "invite"]),
    (Field::MeetLink, &["meet link", "meeting link", "join", "zoom", "video"]),
    (Field::NeedsResponse, &["needs response", "response", "rsvp", "reply"]),
    (Field::Notes, &["notes", "note", "comments", "summary"]),
];

/// Result of schema discovery for one header row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldMap {
    columns: BTreeMap<Field, usize>,
    width: usize,
}

impl FieldMap {
    pub fn column(&self, field: Field) -> Option<usize> {
        self.columns.get(&field).copied()
    }

    pub fn is_bound(&self, field: Field) -> bool {
        self.columns.contains_key(&field)
    }

    /// Number of header cells, bound or not.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn bound_fields(&self) -> impl Iterator<Item = (Field, usize)> + '_ {
        self.columns.iter().map(|(f, c)| (*f, *c))
    }

    pub fn unmapped_columns(&self) -> Vec<usize> {
        (0..self.width)
            .filter(|c| !self.columns.values().any(|bound| bound == c))
            .collect()
    }
}

/// Deterministic field binding for `header`.
///
/// Fields are visited in [`FIELD_ALIASES`] order; each takes the leftmost
/// header cell not already claimed whose trimmed lowercase text contains one
/// of its aliases or is contained in one. Blank header cells never bind.
pub fn discover(header: &[String]) -> FieldMap {
    let normalized: Vec<String> = header.iter().map(|h| h.trim().to_lowercase()).collect();
    let mut claimed = vec![false; header.len()];
    let mut columns = BTreeMap::new();

    for (field, aliases) in FIELD_ALIASES {
        let hit = normalized.iter().enumerate().find(|(idx, cell)| {
            !claimed[*idx] && !cell.is_empty() && aliases.iter().any(|a| matches_alias(cell, a))
        });
        if let Some((idx, _)) = hit {
            claimed[idx] = true;
            columns.insert(*field, idx);
        }
    }

    let map = FieldMap {
        columns,
        width: header.len(),
    };
    debug!(
        bound = map.columns.len(),
        unmapped = map.unmapped_columns().len(),
        "schema discovered"
    );
    map
}

fn matches_alias(cell: &str, alias: &str) -> bool {
    cell.contains(alias) || alias.contains(cell)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn binds_simple_header() {
        let map = discover(&header(&["Name", "Email", "Fund"]));
        assert_eq!(map.column(Field::Name), Some(0));
        assert_eq!(map.column(Field::Email), Some(1));
        assert_eq!(map.column(Field::Organization), Some(2));
        assert!(map.unmapped_columns().is_empty());
    }

    #[test]
    fn binding_follows_content_not_position() {
        let map = discover(&header(&["email", "company", "contact name"]));
        assert_eq!(map.column(Field::Email), Some(0));
        assert_eq!(map.column(Field::Organization), Some(1));
        assert_eq!(map.column(Field::Name), Some(2));
    }

    #[test]
    fn discovery_is_deterministic() {
        let h = header(&["Status", "Name", "Meeting Date", "Random", "Email"]);
        assert_eq!(discover(&h), discover(&h));
    }

    #[test]
    fn claimed_cells_are_not_rebound() {
        let map = discover(&header(&["Last Contact Date", "Date", "Time"]));
        assert_eq!(map.column(Field::LastContactDate), Some(0));
        assert_eq!(map.column(Field::MeetingDate), Some(1));
        assert_eq!(map.column(Field::MeetingTime), Some(2));
    }

    #[test]
    fn first_unclaimed_match_wins() {
        let map = discover(&header(&["Notes", "Meeting Notes"]));
        assert_eq!(map.column(Field::Notes), Some(0));
        assert_eq!(map.unmapped_columns(), vec![1]);
    }

    #[test]
    fn blank_and_unknown_cells_stay_unmapped() {
        let map = discover(&header(&["", "Name", "Favourite Colour", "  "]));
        assert_eq!(map.column(Field::Name), Some(1));
        assert_eq!(map.unmapped_columns(), vec![0, 2, 3]);
        assert_eq!(map.width(), 4);
    }

    #[test]
    fn missing_email_is_reported_unbound() {
        let map = discover(&header(&["Name", "Company"]));
        assert!(!map.is_bound(Field::Email));
        assert!(map.is_bound(Field::Organization));
    }

    #[test]
    fn full_sheet_header() {
        let map = discover(&header(&[
            "Name",
            "Email",
            "Company",
            "Meeting Status",
            "Meeting Date",
            "Meeting Time",
            "Last Contact",
            "Team Member",
            "Calendar Link",
            "Meet Link",
            "Needs Response",
            "Notes",
            "Source",
        ]));
        for (idx, field) in Field::ALL.iter().enumerate() {
            assert_eq!(map.column(*field), Some(idx), "field {field}");
        }
        assert_eq!(map.unmapped_columns(), vec![12]);
    }

    #[test]
    fn field_map_serializes() {
        let map = discover(&header(&["Name"]));
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["width"], 1);
    }
}
