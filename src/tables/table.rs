//! Configuration table storage and row editing.
//!
//! A table is a tab-separated text file. The first line names the columns,
//! two metadata lines give each column's value format and in-position
//! tolerance, and every further line is one row: a unique label, a free-text
//! description, then one cell per column.
//!
//! ```text
//! #label	#description	sample.temperature	table:attenuation	laser.delay
//! #format		%.1f	%s	time.3
//! #tolerance		0	0.1	0	1e-12
//! cold	Chiller at 20 C	20.0	full	0
//! warm		25.0	half	10ns
//! ```
//!
//! Files without the `#description` column are read with empty descriptions.
//! Labels cannot start with `#`, which marks header and comment lines.
//!
//! Every edit rewrites the file through a temporary file and a rename.

use crate::error::{AppResult, DaqError};
use crate::format::ValueFormat;
use crate::hardware::MotorValue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::debug;

const HEADER: &str = "#label";
const FORMAT_LINE: &str = "#format";
const TOLERANCE_LINE: &str = "#tolerance";
const DESCRIPTION: &str = "#description";

/// One column: what it drives and how its cells are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    /// Motor path (`component.attribute`) or linked table (`table:<name>`)
    pub path: String,
    /// How cells are rendered and parsed
    #[serde(default)]
    pub format: ValueFormat,
    /// Largest readback deviation still counted as in position
    #[serde(default)]
    pub tolerance: f64,
}

impl TableColumn {
    /// Column driving `path`.
    pub fn new(path: impl Into<String>, format: ValueFormat, tolerance: f64) -> Self {
        Self {
            path: path.into(),
            format,
            tolerance,
        }
    }
}

/// One row: a named machine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    /// Unique within the table
    pub label: String,
    /// Free text shown next to the label
    #[serde(default)]
    pub description: String,
    /// One per column; empty leaves the motor untouched
    pub cells: Vec<String>,
}

/// A named rectangular preset store.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTable {
    name: String,
    path: Option<PathBuf>,
    columns: Vec<TableColumn>,
    rows: Vec<TableRow>,
    clipboard: Vec<TableRow>,
}

impl ConfigTable {
    /// In-memory table; nothing is written until [`ConfigTable::set_path`].
    pub fn new(name: impl Into<String>, columns: Vec<TableColumn>) -> Self {
        Self {
            name: name.into(),
            path: None,
            columns,
            rows: Vec::new(),
            clipboard: Vec::new(),
        }
    }

    /// Read a table file. The table is named after the file stem.
    pub fn load(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = std::fs::read_to_string(&path)?;
        let mut table = Self::parse(&name, &text)?;
        table.path = Some(path);
        Ok(table)
    }

    /// Parse table text.
    pub fn parse(name: &str, text: &str) -> AppResult<Self> {
        let mut columns: Option<Vec<TableColumn>> = None;
        let mut described = false;
        let mut rows = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let mut cells = line.split('\t');
            let first = cells.next().unwrap_or_default();
            let mut rest: Vec<&str> = cells.collect();
            if first == HEADER {
                described = rest.first() == Some(&DESCRIPTION);
            }
            let description = if described && !rest.is_empty() {
                rest.remove(0)
            } else {
                ""
            };
            match first {
                HEADER => {
                    columns = Some(
                        rest.iter()
                            .map(|p| TableColumn::new(*p, ValueFormat::General, 0.0))
                            .collect(),
                    );
                }
                FORMAT_LINE | TOLERANCE_LINE => {
                    let columns = columns.as_mut().ok_or_else(|| {
                        DaqError::Table(format!("{name}: {first} line before header"))
                    })?;
                    for (column, text) in columns.iter_mut().zip(rest) {
                        if first == FORMAT_LINE {
                            column.format = text.parse()?;
                        } else {
                            column.tolerance = text.trim().parse().map_err(|_| {
                                DaqError::Table(format!("{name}: bad tolerance '{text}'"))
                            })?;
                        }
                    }
                }
                _ if first.starts_with('#') => {}
                label => {
                    let width = columns.as_ref().map_or(0, Vec::len);
                    let mut cells: Vec<String> = rest.iter().map(|c| c.to_string()).collect();
                    cells.resize(width, String::new());
                    rows.push(TableRow {
                        label: label.to_string(),
                        description: description.to_string(),
                        cells,
                    });
                }
            }
        }
        let columns = columns.ok_or_else(|| DaqError::Table(format!("{name}: missing header")))?;
        let mut table = Self::new(name, columns);
        for row in rows {
            if table.row_index(&row.label).is_some() {
                return Err(DaqError::Table(format!("{name}: duplicate row '{}'", row.label)));
            }
            table.rows.push(row);
        }
        Ok(table)
    }

    /// Text form of the table.
    pub fn to_text(&self) -> String {
        let join = |head: &str, cells: Vec<String>| {
            std::iter::once(head.to_string())
                .chain(cells)
                .collect::<Vec<_>>()
                .join("\t")
        };
        let line = |head: &str, second: &str, cells: Vec<String>| {
            join(head, std::iter::once(second.to_string()).chain(cells).collect())
        };
        let mut lines = vec![
            line(HEADER, DESCRIPTION, self.columns.iter().map(|c| c.path.clone()).collect()),
            line(FORMAT_LINE, "", self.columns.iter().map(|c| c.format.to_string()).collect()),
            line(
                TOLERANCE_LINE,
                "",
                self.columns.iter().map(|c| c.tolerance.to_string()).collect(),
            ),
        ];
        lines.extend(
            self.rows
                .iter()
                .map(|r| line(&r.label, &r.description, r.cells.clone())),
        );
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    /// Attach a file and write the table to it.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) -> AppResult<()> {
        self.path = Some(path.into());
        self.save()
    }

    /// Backing file, if the table has one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Rewrite the backing file, if any.
    pub fn save(&self) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.to_text().as_bytes())?;
        tmp.persist(path).map_err(|e| DaqError::Io(e.error))?;
        debug!(table = %self.name, path = %path.display(), "table saved");
        Ok(())
    }

    /// File stem, used in `table:<name>` links.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    /// Row labels in table order.
    pub fn labels(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.label.clone()).collect()
    }

    pub fn row(&self, label: &str) -> Option<&TableRow> {
        self.rows.iter().find(|r| r.label == label)
    }

    /// Position of the row labelled `label`.
    pub fn row_index(&self, label: &str) -> Option<usize> {
        self.rows.iter().position(|r| r.label == label)
    }

    fn check_row(&self, r: usize) -> AppResult<()> {
        if r < self.rows.len() {
            Ok(())
        } else {
            Err(DaqError::Table(format!("{}: no row {r}", self.name)))
        }
    }

    /// Cell text; empty cells leave their motor untouched when applied.
    pub fn cell(&self, r: usize, j: usize) -> Option<&str> {
        self.rows.get(r)?.cells.get(j).map(String::as_str)
    }

    /// Store a value, rendered in the column's format.
    pub fn set_cell(&mut self, r: usize, j: usize, value: &MotorValue) -> AppResult<()> {
        let format = self
            .columns
            .get(j)
            .map(|c| c.format)
            .ok_or_else(|| DaqError::Table(format!("{}: no column {j}", self.name)))?;
        self.set_cell_text(r, j, &format.format_value(value))
    }

    /// Store cell text as typed.
    pub fn set_cell_text(&mut self, r: usize, j: usize, text: &str) -> AppResult<()> {
        self.check_row(r)?;
        let width = self.columns.len();
        let cell = self.rows[r]
            .cells
            .get_mut(j)
            .filter(|_| j < width)
            .ok_or_else(|| DaqError::Table(format!("no column {j}")))?;
        *cell = sanitize(text);
        self.save()
    }

    /// Parsed value of a cell, `None` when the cell is empty.
    pub fn value(&self, r: usize, j: usize) -> AppResult<Option<MotorValue>> {
        let text = self.cell(r, j).unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(None);
        }
        let column = self
            .columns
            .get(j)
            .ok_or_else(|| DaqError::Table(format!("{}: no column {j}", self.name)))?;
        column.format.parse_value(text).map(Some)
    }

    fn unique_label(&self, base: &str) -> String {
        if self.row_index(base).is_none() {
            return base.to_string();
        }
        (2..)
            .map(|k| format!("{base}{k}"))
            .find(|candidate| self.row_index(candidate).is_none())
            .unwrap_or_else(|| base.to_string())
    }

    fn blank_row(&self) -> TableRow {
        TableRow {
            label: self.unique_label("new"),
            description: String::new(),
            cells: vec![String::new(); self.columns.len()],
        }
    }

    /// Sanitized `label`, if it can be stored and read back as a row label.
    fn valid_label(&self, label: &str) -> AppResult<String> {
        let label = sanitize(label);
        if label.trim().is_empty() {
            return Err(DaqError::Table("row label cannot be empty".into()));
        }
        if label.starts_with('#') {
            return Err(DaqError::Table(format!(
                "{}: row label '{label}' cannot start with '#'",
                self.name
            )));
        }
        Ok(label)
    }

    /// Append a row with the given label and cells.
    pub fn add_row(&mut self, label: &str, cells: Vec<String>) -> AppResult<()> {
        let label = self.valid_label(label)?;
        if self.row_index(&label).is_some() {
            return Err(DaqError::Table(format!("{}: row '{label}' exists", self.name)));
        }
        let mut cells: Vec<String> = cells.iter().map(|c| sanitize(c)).collect();
        cells.resize(self.columns.len(), String::new());
        self.rows.push(TableRow {
            label,
            description: String::new(),
            cells,
        });
        self.save()
    }

    /// Description of row `r`.
    pub fn description(&self, r: usize) -> Option<&str> {
        self.rows.get(r).map(|row| row.description.as_str())
    }

    /// Replace the free-text description of row `r`.
    pub fn set_description(&mut self, r: usize, text: &str) -> AppResult<()> {
        self.check_row(r)?;
        self.rows[r].description = sanitize(text);
        self.save()
    }

    /// Insert an empty row above `r`.
    pub fn insert_row_above(&mut self, r: usize) -> AppResult<()> {
        let at = r.min(self.rows.len());
        let row = self.blank_row();
        self.rows.insert(at, row);
        self.save()
    }

    /// Insert an empty row below `r`.
    pub fn insert_row_below(&mut self, r: usize) -> AppResult<()> {
        let at = (r + 1).min(self.rows.len());
        let row = self.blank_row();
        self.rows.insert(at, row);
        self.save()
    }

    /// Copy row `r` right below itself under a fresh label.
    pub fn duplicate_row(&mut self, r: usize) -> AppResult<()> {
        self.check_row(r)?;
        let mut row = self.rows[r].clone();
        row.label = self.unique_label(&row.label);
        self.rows.insert(r + 1, row);
        self.save()
    }

    pub fn delete_row(&mut self, r: usize) -> AppResult<()> {
        self.check_row(r)?;
        self.rows.remove(r);
        self.save()
    }

    fn check_range(&self, rows: &Range<usize>) -> AppResult<()> {
        if rows.start <= rows.end && rows.end <= self.rows.len() {
            Ok(())
        } else {
            Err(DaqError::Table(format!("{}: no rows {rows:?}", self.name)))
        }
    }

    /// Move rows into the clipboard.
    pub fn cut_rows(&mut self, rows: Range<usize>) -> AppResult<()> {
        self.check_range(&rows)?;
        self.clipboard = self.rows.drain(rows).collect();
        self.save()
    }

    /// Copy rows into the clipboard.
    pub fn copy_rows(&mut self, rows: Range<usize>) -> AppResult<()> {
        self.check_range(&rows)?;
        self.clipboard = self.rows[rows].to_vec();
        Ok(())
    }

    /// Insert the clipboard at `r`; labels already in use get a suffix.
    pub fn paste_rows(&mut self, r: usize) -> AppResult<()> {
        let mut at = r.min(self.rows.len());
        for mut row in self.clipboard.clone() {
            row.label = self.unique_label(&row.label);
            row.cells.resize(self.columns.len(), String::new());
            self.rows.insert(at, row);
            at += 1;
        }
        self.save()
    }

    /// Rows last cut or copied.
    pub fn clipboard(&self) -> &[TableRow] {
        &self.clipboard
    }

    /// Sort by a column, numerically when every non-empty cell parses.
    ///
    /// `None` sorts by label.
    pub fn sort_by(&mut self, column: Option<usize>) -> AppResult<()> {
        let key = |row: &TableRow| -> String {
            match column {
                Some(j) => row.cells.get(j).cloned().unwrap_or_default(),
                None => row.label.clone(),
            }
        };
        let format = column
            .and_then(|j| self.columns.get(j))
            .map(|c| c.format)
            .unwrap_or(ValueFormat::General);
        let numbers: Option<Vec<f64>> = self
            .rows
            .iter()
            .map(|row| {
                let text = key(row);
                if text.trim().is_empty() {
                    return Some(f64::INFINITY);
                }
                format.parse_value(&text).ok().and_then(|v| v.as_f64())
            })
            .collect();
        match numbers {
            Some(numbers) if !format.is_text() => {
                let mut keyed: Vec<(f64, TableRow)> = numbers.into_iter().zip(self.rows.drain(..)).collect();
                keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
                self.rows = keyed.into_iter().map(|(_, row)| row).collect();
            }
            _ => self.rows.sort_by_key(key),
        }
        self.save()
    }

    /// Rename row `r`; labels stay unique.
    pub fn rename_row(&mut self, r: usize, label: &str) -> AppResult<()> {
        self.check_row(r)?;
        let label = self.valid_label(label)?;
        match self.row_index(&label) {
            Some(existing) if existing != r => {
                Err(DaqError::Table(format!("{}: row '{label}' exists", self.name)))
            }
            _ => {
                self.rows[r].label = label;
                self.save()
            }
        }
    }

    /// One-line summary of a row: its description, or the settings it
    /// applies when it has none, e.g. `warm: sample.temperature=25.0, laser.delay=10ns`.
    pub fn describe_row(&self, r: usize) -> AppResult<String> {
        self.check_row(r)?;
        let row = &self.rows[r];
        if !row.description.trim().is_empty() {
            return Ok(format!("{}: {}", row.label, row.description));
        }
        let settings: Vec<String> = self
            .columns
            .iter()
            .zip(&row.cells)
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(column, cell)| format!("{}={cell}", column.path))
            .collect();
        Ok(format!("{}: {}", row.label, settings.join(", ")))
    }
}

fn sanitize(text: &str) -> String {
    text.replace(['\t', '\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ConfigTable {
        let mut table = ConfigTable::new(
            "methods",
            vec![
                TableColumn::new("sample.temperature", ValueFormat::Fixed(1), 0.1),
                TableColumn::new("laser.delay", ValueFormat::Time(3), 1e-12),
            ],
        );
        table.add_row("cold", vec!["20.0".into(), "0".into()]).unwrap();
        table.add_row("warm", vec!["25.0".into(), "10ns".into()]).unwrap();
        table
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut original = table();
        original.set_path(dir.path().join("methods.txt")).unwrap();
        let loaded = ConfigTable::load(dir.path().join("methods.txt")).unwrap();
        assert_eq!(loaded.rows(), original.rows());
        assert_eq!(loaded.columns(), original.columns());
        assert_eq!(loaded.name(), "methods");
    }

    #[test]
    fn test_values_follow_column_format() {
        let mut t = table();
        assert_eq!(t.value(1, 1).unwrap(), Some(MotorValue::Number(10e-9)));
        t.set_cell(0, 0, &MotorValue::Number(21.04)).unwrap();
        assert_eq!(t.cell(0, 0), Some("21.0"));
        t.set_cell_text(0, 1, "").unwrap();
        assert_eq!(t.value(0, 1).unwrap(), None);
    }

    #[test]
    fn test_row_operations() {
        let mut t = table();
        t.insert_row_above(0).unwrap();
        assert_eq!(t.labels(), vec!["new", "cold", "warm"]);
        t.insert_row_below(0).unwrap();
        assert_eq!(t.labels(), vec!["new", "new2", "cold", "warm"]);
        t.duplicate_row(3).unwrap();
        assert_eq!(t.labels(), vec!["new", "new2", "cold", "warm", "warm2"]);
        t.delete_row(0).unwrap();
        t.cut_rows(0..1).unwrap();
        assert_eq!(t.labels(), vec!["cold", "warm", "warm2"]);
        t.copy_rows(0..1).unwrap();
        t.paste_rows(3).unwrap();
        assert_eq!(t.labels(), vec!["cold", "warm", "warm2", "cold2"]);
        assert!(t.rename_row(3, "warm").is_err());
        t.rename_row(3, "hot").unwrap();
        assert!(t.delete_row(10).is_err());
    }

    #[test]
    fn test_sort_numeric_and_text() {
        let mut t = table();
        t.add_row("hot", vec!["100.0".into(), "1us".into()]).unwrap();
        t.add_row("chilly", vec!["9.5".into(), "".into()]).unwrap();
        t.sort_by(Some(0)).unwrap();
        assert_eq!(t.labels(), vec!["chilly", "cold", "warm", "hot"]);
        t.sort_by(Some(1)).unwrap();
        assert_eq!(t.labels(), vec!["cold", "warm", "hot", "chilly"]);
        t.sort_by(None).unwrap();
        assert_eq!(t.labels(), vec!["chilly", "cold", "hot", "warm"]);
    }

    #[test]
    fn test_describe_row() {
        let mut t = table();
        assert_eq!(
            t.describe_row(1).unwrap(),
            "warm: sample.temperature=25.0, laser.delay=10ns"
        );
        t.set_description(1, "room temperature").unwrap();
        assert_eq!(t.describe_row(1).unwrap(), "warm: room temperature");
    }

    #[test]
    fn test_descriptions_survive_save_and_row_edits() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = table();
        t.set_path(dir.path().join("methods.txt")).unwrap();
        t.set_description(0, "chiller\tat 20 C").unwrap();
        assert_eq!(t.description(0), Some("chiller at 20 C"));

        let loaded = ConfigTable::load(dir.path().join("methods.txt")).unwrap();
        assert_eq!(loaded.description(0), Some("chiller at 20 C"));
        assert_eq!(loaded.description(1), Some(""));
        assert_eq!(loaded.cell(0, 0), Some("20.0"));
        assert_eq!(loaded.rows(), t.rows());

        t.duplicate_row(0).unwrap();
        assert_eq!(t.description(1), Some("chiller at 20 C"));
        t.copy_rows(0..1).unwrap();
        t.paste_rows(3).unwrap();
        assert_eq!(t.labels(), vec!["cold", "cold2", "warm", "cold3"]);
        assert_eq!(t.description(3), Some("chiller at 20 C"));
    }

    #[test]
    fn test_files_without_descriptions_still_load() {
        let t = ConfigTable::parse("t", "#label\tm.x\n#format\t%.2f\na\t1\n").unwrap();
        assert_eq!(t.cell(0, 0), Some("1"));
        assert_eq!(t.description(0), Some(""));
    }

    #[test]
    fn test_labels_must_read_back() {
        let mut t = table();
        assert!(t.add_row("#in", vec![]).is_err());
        assert!(t.add_row("", vec![]).is_err());
        assert!(t.rename_row(0, "#cold").is_err());
        t.add_row("out", vec![]).unwrap();

        // Uniqueness is checked on the label as stored.
        t.add_row("a b", vec![]).unwrap();
        assert!(t.add_row("a\tb", vec![]).is_err());

        let reread = ConfigTable::parse("methods", &t.to_text()).unwrap();
        assert_eq!(reread.labels(), t.labels());
        assert_eq!(reread.labels(), vec!["cold", "warm", "out", "a b"]);
    }

    #[test]
    fn test_parse_rejects_missing_header_and_duplicates() {
        assert!(ConfigTable::parse("t", "a\t1\n").is_err());
        assert!(ConfigTable::parse("t", "#label\tm.x\na\t1\na\t2\n").is_err());
        let t = ConfigTable::parse("t", "#label\tm.x\n#format\t%.2f\na\t1\n").unwrap();
        assert_eq!(t.columns()[0].format, ValueFormat::Fixed(2));
    }
}
