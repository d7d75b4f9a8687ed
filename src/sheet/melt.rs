use crate::sheet::table::{Cell, WideTable};

/// Long form of a wide sheet: one row per (entity, year) with a numeric
/// value.  Descriptive cells keep their original column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Melted {
    pub id_columns: Vec<String>,
    pub rows: Vec<MeltedRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeltedRow {
    pub id: Vec<Cell>,
    pub year: i32,
    pub value: f64,
}

impl Melted {
    /// Descriptive cell by column name; absent columns read as Empty so that
    /// optional workbook columns never fail a write.
    pub fn get(&self, row: &MeltedRow, column: &str) -> Cell {
        self.id_columns
            .iter()
            .position(|c| c == column)
            .map(|i| row.id[i].clone())
            .unwrap_or(Cell::Empty)
    }
}

/// Split the columns of a wide table into descriptive and year-valued sets.
/// A column is a year column when its name parses as an integer, unless the
/// caller forces it descriptive via `id_columns` (guards against technology
/// codes that happen to be all digits).
pub fn partition_columns(
    table: &WideTable,
    id_columns: &[&str],
) -> (Vec<usize>, Vec<(usize, i32)>) {
    let mut ids = Vec::new();
    let mut years = Vec::new();
    for (i, name) in table.columns.iter().enumerate() {
        match name.parse::<i32>() {
            Ok(y) if !id_columns.contains(&name.as_str()) => years.push((i, y)),
            _ => ids.push(i),
        }
    }
    (ids, years)
}

/// Melt a wide table into long form, dropping (row, year) pairs whose value
/// is empty or non-numeric.  Pure and order-irrelevant: downstream treats
/// the result as a set.
pub fn melt(table: &WideTable, id_columns: &[&str]) -> Melted {
    let (ids, years) = partition_columns(table, id_columns);
    let id_names: Vec<String> = ids.iter().map(|&i| table.columns[i].clone()).collect();

    let mut rows = Vec::new();
    for record in &table.rows {
        let id: Vec<Cell> = ids.iter().map(|&i| record[i].clone()).collect();
        for &(col, year) in &years {
            if let Some(value) = record[col].as_f64() {
                rows.push(MeltedRow {
                    id: id.clone(),
                    year,
                    value,
                });
            }
        }
    }
    Melted {
        id_columns: id_names,
        rows,
    }
}

/// Round half away from zero to a fixed number of decimals.  Applied to
/// every value before persistence: the optimizer downstream is sensitive to
/// more precision than the source data carries.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}
