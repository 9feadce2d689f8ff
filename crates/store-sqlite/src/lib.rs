use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use core_model::{
    CellUpdate, CursorMap, Highlight, RecordStore, SheetRow, SortKind, SortSpec, SyncError,
    parse_sheet_date, parse_sheet_time,
};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

/// Contact sheet kept in SQLite: one ordered header, positional rows stored
/// as JSON cell arrays, a highlight per row, and the per-account cursors.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open_default() -> anyhow::Result<Self> {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::open(base.join("contact-sync").join("crm.db"))
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path != Path::new(":memory:")
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent dir for {}", path.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite db {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(Self { conn })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sheet_header (
              position INTEGER PRIMARY KEY,
              label TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sheet_rows (
              idx INTEGER PRIMARY KEY,
              cells TEXT NOT NULL,
              highlight TEXT NOT NULL DEFAULT 'default'
            );
            CREATE TABLE IF NOT EXISTS cursors (
              account TEXT PRIMARY KEY,
              cursor TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Writes `header` only when the sheet has none yet. Returns whether it did.
    pub fn ensure_header(&mut self, header: &[String]) -> anyhow::Result<bool> {
        if !self.header()?.is_empty() {
            return Ok(false);
        }
        self.set_header(header)?;
        Ok(true)
    }

    pub fn set_header(&mut self, header: &[String]) -> anyhow::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM sheet_header", [])?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO sheet_header (position, label) VALUES (?1, ?2)")?;
            for (pos, label) in header.iter().enumerate() {
                stmt.execute(params![pos as i64, label])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn header(&self) -> anyhow::Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM sheet_header ORDER BY position ASC")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(Into::into)
    }

    pub fn rows(&self) -> anyhow::Result<Vec<SheetRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT idx, cells FROM sheet_rows ORDER BY idx ASC")?;
        let rows = stmt.query_map([], |r| {
            let idx: i64 = r.get(0)?;
            let cells: String = r.get(1)?;
            Ok((idx, cells))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (idx, cells) = row?;
            out.push(SheetRow {
                index: idx as usize,
                cells: serde_json::from_str(&cells)
                    .with_context(|| format!("decoding cells of row {idx}"))?,
            });
        }
        Ok(out)
    }

    pub fn row_count(&self) -> anyhow::Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sheet_rows", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn append(&mut self, cells: &[String]) -> anyhow::Result<usize> {
        let idx = self.row_count()?;
        self.conn.execute(
            "INSERT INTO sheet_rows (idx, cells, highlight) VALUES (?1, ?2, 'default')",
            params![idx as i64, serde_json::to_string(cells)?],
        )?;
        Ok(idx)
    }

    /// Overwrites individual cells, growing the row if a column lies past
    /// its end. Cells not named in `updates` keep their text.
    pub fn update_cells(&mut self, idx: usize, updates: &[CellUpdate]) -> anyhow::Result<()> {
        let tx = self.conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT cells FROM sheet_rows WHERE idx = ?1",
                params![idx as i64],
                |r| r.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            anyhow::bail!("row {idx} does not exist");
        };
        let mut cells: Vec<String> = serde_json::from_str(&current)?;
        for update in updates {
            if cells.len() <= update.column {
                cells.resize(update.column + 1, String::new());
            }
            cells[update.column] = update.value.clone();
        }
        tx.execute(
            "UPDATE sheet_rows SET cells = ?2 WHERE idx = ?1",
            params![idx as i64, serde_json::to_string(&cells)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Stable sort of every row by `spec`, then renumbers positions 0..n.
    pub fn sort(&mut self, spec: &SortSpec) -> anyhow::Result<()> {
        let tx = self.conn.transaction()?;
        let mut rows: Vec<(Vec<String>, String)> = {
            let mut stmt = tx.prepare("SELECT cells, highlight FROM sheet_rows ORDER BY idx ASC")?;
            let mapped = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
            let mut out = Vec::new();
            for row in mapped {
                let (cells, highlight) = row?;
                out.push((serde_json::from_str(&cells)?, highlight));
            }
            out
        };
        rows.sort_by(|a, b| compare_cells(&a.0, &b.0, spec));
        tx.execute("DELETE FROM sheet_rows", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sheet_rows (idx, cells, highlight) VALUES (?1, ?2, ?3)",
            )?;
            for (idx, (cells, highlight)) in rows.iter().enumerate() {
                stmt.execute(params![idx as i64, serde_json::to_string(cells)?, highlight])?;
            }
        }
        tx.commit()?;
        debug!(rows = rows.len(), columns = ?spec.columns, "rows sorted");
        Ok(())
    }

    pub fn set_highlight(&self, idx: usize, highlight: Highlight) -> anyhow::Result<()> {
        let changed = self.conn.execute(
            "UPDATE sheet_rows SET highlight = ?2 WHERE idx = ?1",
            params![idx as i64, highlight.as_str()],
        )?;
        if changed == 0 {
            anyhow::bail!("row {idx} does not exist");
        }
        Ok(())
    }

    pub fn highlight(&self, idx: usize) -> anyhow::Result<Option<Highlight>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT highlight FROM sheet_rows WHERE idx = ?1",
                params![idx as i64],
                |r| r.get(0),
            )
            .optional()?;
        value.map(|v| v.parse()).transpose()
    }

    pub fn clear_rows(&self) -> anyhow::Result<usize> {
        Ok(self.conn.execute("DELETE FROM sheet_rows", [])?)
    }

    pub fn cursors(&self) -> anyhow::Result<CursorMap> {
        let mut stmt = self.conn.prepare("SELECT account, cursor FROM cursors")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        rows.collect::<rusqlite::Result<CursorMap>>()
            .map_err(Into::into)
    }

    /// Replaces the stored cursor set with `cursors`; accounts missing from
    /// the map lose their stored cursor.
    pub fn store_cursors(&mut self, cursors: &CursorMap) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM cursors", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO cursors (account, cursor, updated_at) VALUES (?1, ?2, ?3)",
            )?;
            for (account, cursor) in cursors {
                stmt.execute(params![account, cursor, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn integrity_check(&self) -> anyhow::Result<String> {
        self.conn
            .query_row("PRAGMA integrity_check;", [], |r| r.get(0))
            .map_err(Into::into)
    }
}

/// Row ordering used by [`SqliteStore::sort`]: column by column, blanks
/// last. Date and time columns compare parsed values, with unparseable cells
/// after parsed ones; text compares case-insensitively.
pub fn compare_cells(a: &[String], b: &[String], spec: &SortSpec) -> Ordering {
    for column in &spec.columns {
        let left = a.get(column.index).map(|c| c.trim()).unwrap_or_default();
        let right = b.get(column.index).map(|c| c.trim()).unwrap_or_default();
        let ord = match (left.is_empty(), right.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => match column.kind {
                SortKind::Text => compare_text(left, right),
                SortKind::Date => compare_parsed(left, right, parse_sheet_date),
                SortKind::Time => compare_parsed(left, right, parse_sheet_time),
            },
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_text(left: &str, right: &str) -> Ordering {
    left.to_lowercase().cmp(&right.to_lowercase())
}

fn compare_parsed<T: Ord>(left: &str, right: &str, parse: fn(&str) -> Option<T>) -> Ordering {
    match (parse(left), parse(right)) {
        (Some(l), Some(r)) => l.cmp(&r),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => compare_text(left, right),
    }
}

#[async_trait(?Send)]
impl RecordStore for SqliteStore {
    async fn read_header(&self) -> Result<Vec<String>, SyncError> {
        self.header().map_err(SyncError::from)
    }

    async fn read_all_rows(&self) -> Result<Vec<SheetRow>, SyncError> {
        self.rows().map_err(SyncError::from)
    }

    async fn append_row(&mut self, cells: Vec<String>) -> Result<usize, SyncError> {
        self.append(&cells).map_err(SyncError::from)
    }

    async fn update_row(&mut self, index: usize, updates: &[CellUpdate]) -> Result<(), SyncError> {
        self.update_cells(index, updates).map_err(SyncError::from)
    }

    async fn sort_rows(&mut self, spec: &SortSpec) -> Result<(), SyncError> {
        self.sort(spec).map_err(SyncError::from)
    }

    async fn recolor_row(&mut self, index: usize, highlight: Highlight) -> Result<(), SyncError> {
        self.set_highlight(index, highlight).map_err(SyncError::from)
    }

    async fn clear_all_rows(&mut self) -> Result<(), SyncError> {
        self.clear_rows().map(|_| ()).map_err(SyncError::from)
    }

    async fn load_cursors(&self) -> Result<CursorMap, SyncError> {
        self.cursors().map_err(SyncError::from)
    }

    async fn save_cursors(&mut self, cursors: &CursorMap) -> Result<(), SyncError> {
        self.store_cursors(cursors).map_err(SyncError::from)
    }
}
