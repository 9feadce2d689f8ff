use chrono::NaiveDate;
use core_model::{
    CrmRecord, Field, Highlight, RecordStore, SortColumn, SortKind, SortSpec, SyncError,
    parse_sheet_date,
};
use schema::{FieldMap, decode_row};
use tracing::debug;

use crate::merge::STATUS_SCHEDULED;

pub fn highlight_for(record: &CrmRecord, today: NaiveDate) -> Highlight {
    if !record.meeting_status.trim().eq_ignore_ascii_case(STATUS_SCHEDULED) {
        return Highlight::Default;
    }
    if record.needs_response {
        return Highlight::NeedsResponse;
    }
    match parse_sheet_date(&record.meeting_date) {
        Some(date) if date >= today => Highlight::Upcoming,
        _ => Highlight::Default,
    }
}

/// Meeting date, then time, then organization. Unbound fields drop out.
pub fn sort_spec(map: &FieldMap) -> SortSpec {
    SortSpec {
        columns: [
            (Field::MeetingDate, SortKind::Date),
            (Field::MeetingTime, SortKind::Time),
            (Field::Organization, SortKind::Text),
        ]
        .into_iter()
        .filter_map(|(f, kind)| map.column(f).map(|index| SortColumn::new(index, kind)))
        .collect(),
    }
}

/// Sorts the store, then recolors every row against its new position.
pub async fn sort_and_highlight(
    store: &mut dyn RecordStore,
    map: &FieldMap,
    today: NaiveDate,
) -> Result<usize, SyncError> {
    let spec = sort_spec(map);
    if !spec.columns.is_empty() {
        store.sort_rows(&spec).await?;
    }
    let rows = store.read_all_rows().await?;
    for row in &rows {
        let record = decode_row(map, row);
        store.recolor_row(row.index, highlight_for(&record, today)).await?;
    }
    debug!(rows = rows.len(), "sorted and highlighted");
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn record(status: &str, date: &str, needs_response: bool) -> CrmRecord {
        CrmRecord {
            meeting_status: status.to_string(),
            meeting_date: date.to_string(),
            needs_response,
            ..CrmRecord::default()
        }
    }

    #[test]
    fn scheduled_needing_response_wins() {
        assert_eq!(
            highlight_for(&record("Scheduled", "2025-01-01", true), today()),
            Highlight::NeedsResponse
        );
    }

    #[test]
    fn scheduled_today_or_later_is_upcoming() {
        assert_eq!(
            highlight_for(&record("scheduled", "2025-03-10", false), today()),
            Highlight::Upcoming
        );
        assert_eq!(
            highlight_for(&record("Scheduled", "03/20/2025", false), today()),
            Highlight::Upcoming
        );
        assert_eq!(
            highlight_for(&record("Scheduled", "2025-03-09", false), today()),
            Highlight::Default
        );
    }

    #[test]
    fn other_statuses_are_default() {
        assert_eq!(
            highlight_for(&record("Completed", "2025-04-01", true), today()),
            Highlight::Default
        );
        assert_eq!(
            highlight_for(&record("Scheduled", "next week", false), today()),
            Highlight::Default
        );
    }

    #[test]
    fn sort_spec_skips_unbound_columns() {
        let header: Vec<String> = ["Company", "Name", "Meeting Date"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = schema::discover(&header);
        assert_eq!(
            sort_spec(&map).columns,
            vec![
                SortColumn::new(2, SortKind::Date),
                SortColumn::new(0, SortKind::Text)
            ]
        );
    }
}
