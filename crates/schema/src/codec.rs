use core_model::{CellUpdate, CrmRecord, FieldSet, SheetRow};

use crate::FieldMap;

/// Reads the bound cells of `row` into a record. Short rows read as blanks.
pub fn decode_row(map: &FieldMap, row: &SheetRow) -> CrmRecord {
    let mut record = CrmRecord {
        row_index: row.index,
        raw: row.cells.clone(),
        ..CrmRecord::default()
    };
    for (field, column) in map.bound_fields() {
        let value = row.cells.get(column).map(|c| c.trim()).unwrap_or_default();
        record.set(field, value);
    }
    record
}

/// Cell writes for every field of `fields` that has a bound column.
/// Unbound fields are dropped; unmapped columns are never addressed.
pub fn encode_updates(map: &FieldMap, fields: &FieldSet) -> Vec<CellUpdate> {
    fields
        .iter()
        .filter_map(|(field, value)| {
            map.column(*field).map(|column| CellUpdate {
                column,
                value: value.clone(),
            })
        })
        .collect()
}

/// A full-width row for a new record; unmapped columns start blank.
pub fn encode_new_row(map: &FieldMap, fields: &FieldSet) -> Vec<String> {
    let mut cells = vec![String::new(); map.width()];
    for update in encode_updates(map, fields) {
        cells[update.column] = update.value;
    }
    cells
}
