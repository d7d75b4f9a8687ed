use std::error::Error;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::BufReader;

use calamine::{open_workbook, Data, Range, Reader, Xlsx};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;

/// One spreadsheet cell after import.  Empty cells stay empty until
/// persistence, where they are written as '' to match the destination
/// schema's text defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Numeric view of the cell.  Text that parses as a number counts,
    /// because workbooks are inconsistent about storing years as text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(x) => Some(*x),
            Cell::Text(s) => s.trim().parse::<f64>().ok(),
            Cell::Empty => None,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(x) => format_number(*x),
        }
    }
}

impl Eq for Cell {}

impl Hash for Cell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Cell::Empty => 0u8.hash(state),
            Cell::Text(s) => {
                1u8.hash(state);
                s.hash(state);
            }
            Cell::Number(x) => {
                2u8.hash(state);
                x.to_bits().hash(state);
            }
        }
    }
}

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Empty => ToSqlOutput::Owned(Value::Text(String::new())),
            Cell::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Cell::Number(x) => {
                if x.fract() == 0.0 && x.abs() < 9.0e15 {
                    ToSqlOutput::Owned(Value::Integer(*x as i64))
                } else {
                    ToSqlOutput::Owned(Value::Real(*x))
                }
            }
        })
    }
}

/// Integral values render without a decimal point so that year headers read
/// back as "2010", not "2010.0".
fn format_number(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 9.0e15 {
        format!("{}", x as i64)
    } else {
        format!("{}", x)
    }
}

/// A sheet in memory: one header row plus data rows, unnamed columns already
/// dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct WideTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl WideTable {
    /// Build from a calamine range.  `header_row` skips the unit/metadata
    /// banner rows above the real header (0 means the first row is the
    /// header).  `last_col` truncates the sheet after the named column, so
    /// scratch columns to the right of the table are never imported.
    pub fn from_range(range: &Range<Data>, header_row: usize, last_col: Option<&str>) -> WideTable {
        let mut rows_iter = range.rows().skip(header_row);
        let header: Vec<String> = match rows_iter.next() {
            Some(r) => r.iter().map(|c| cell_from(c).text().trim().to_string()).collect(),
            None => Vec::new(),
        };

        let width = match last_col {
            Some(name) => header
                .iter()
                .position(|c| c == name)
                .map(|i| i + 1)
                .unwrap_or(header.len()),
            None => header.len(),
        };

        // Keep only named columns within the width limit
        let kept: Vec<usize> = (0..width)
            .filter(|&i| !header[i].is_empty() && !header[i].starts_with("Unnamed"))
            .collect();

        let columns: Vec<String> = kept.iter().map(|&i| header[i].clone()).collect();
        let rows: Vec<Vec<Cell>> = rows_iter
            .map(|r| {
                kept.iter()
                    .map(|&i| r.get(i).map(cell_from).unwrap_or(Cell::Empty))
                    .collect::<Vec<Cell>>()
            })
            .filter(|r| r.iter().any(|c| !c.is_empty()))
            .collect();

        WideTable { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell by column name; missing optional columns read as Empty.
    pub fn cell(&self, row: usize, name: &str) -> Cell {
        self.column_index(name)
            .and_then(|i| self.rows[row].get(i).cloned())
            .unwrap_or(Cell::Empty)
    }
}

fn cell_from(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => {
            if s.trim().is_empty() {
                Cell::Empty
            } else {
                Cell::Text(s.clone())
            }
        }
        Data::Float(x) => Cell::Number(*x),
        Data::Int(x) => Cell::Number(*x as f64),
        Data::Bool(b) => Cell::Number(if *b { 1.0 } else { 0.0 }),
        Data::DateTime(dt) => Cell::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(_) => Cell::Empty,
    }
}

/// All sheet names of a workbook, in file order.
pub fn sheet_names(path: &str) -> Result<Vec<String>, Box<dyn Error>> {
    let workbook: Xlsx<BufReader<File>> = open_workbook(path)?;
    Ok(workbook.sheet_names().to_vec())
}

/// Read one sheet from an .xlsx workbook.  A missing sheet is not an error:
/// not every regional workbook defines every parameter, so the caller gets
/// `None` and moves on.
pub fn read_sheet(
    path: &str,
    sheet: &str,
    header_row: usize,
    last_col: Option<&str>,
) -> Result<Option<WideTable>, Box<dyn Error>> {
    let mut workbook: Xlsx<BufReader<File>> = open_workbook(path)?;
    if !workbook.sheet_names().iter().any(|s| s == sheet) {
        return Ok(None);
    }
    let range = workbook.worksheet_range(sheet)?;
    Ok(Some(WideTable::from_range(&range, header_row, last_col)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_text_formats_integral_years() {
        assert_eq!(Cell::Number(2010.0).text(), "2010");
        assert_eq!(Cell::Number(0.35).text(), "0.35");
        assert_eq!(Cell::Text("ON".into()).text(), "ON");
        assert_eq!(Cell::Empty.text(), "");
    }

    #[test]
    fn cell_as_f64_parses_text() {
        assert_eq!(Cell::Text(" 2018 ".into()).as_f64(), Some(2018.0));
        assert_eq!(Cell::Text("n/a".into()).as_f64(), None);
        assert_eq!(Cell::Empty.as_f64(), None);
    }

    #[test]
    fn from_range_skips_banner_and_truncates() {
        // Row 0 is a units banner, row 1 the real header, then two data rows.
        // The "Scratch" column sits past the last_col marker and is dropped.
        let cells = vec![
            (0, 0, Data::String("units banner".into())),
            (1, 0, Data::String("Region".into())),
            (1, 1, Data::Float(2010.0)),
            (1, 2, Data::String("Notes".into())),
            (1, 3, Data::String("Scratch".into())),
            (2, 0, Data::String("ON".into())),
            (2, 1, Data::Float(1.5)),
            (2, 3, Data::String("ignored".into())),
            (3, 0, Data::String("QC".into())),
            (3, 1, Data::Float(2.0)),
            (3, 2, Data::String("check".into())),
        ];
        let mut range = Range::new((0, 0), (3, 3));
        for (r, c, v) in cells {
            range.set_value((r, c), v);
        }
        let table = WideTable::from_range(&range, 1, Some("Notes"));
        assert_eq!(table.columns, vec!["Region", "2010", "Notes"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.cell(0, "Region"), Cell::Text("ON".into()));
        assert_eq!(table.cell(0, "2010"), Cell::Number(1.5));
        assert_eq!(table.cell(0, "Notes"), Cell::Empty);
        assert_eq!(table.cell(1, "Notes"), Cell::Text("check".into()));
        // asking for a column that was truncated away reads as Empty
        assert_eq!(table.cell(0, "Scratch"), Cell::Empty);
    }
}
