use std::error::Error;

use log::{info, warn};
use rusqlite::params;
use rusqlite::Connection;

use crate::db::schema;
use crate::sheet::table::{self, WideTable};

/// Import scenario constraints from a workbook where each sheet is named
/// after the destination table and its header row lists the destination
/// columns.  Columns the table does not have yet are added as TEXT, so a
/// constraint workbook can carry annotations ahead of the schema.  Sheets
/// with no matching table are skipped with a warning, never an error.
pub struct ConstraintImport {
    pub database: String,
    pub workbook: String,
    /// Concrete build years substituted for a LoanRate vintage of 'All'.
    pub vintages: Vec<i32>,
}

impl ConstraintImport {
    pub fn new(database: &str, workbook: &str) -> Self {
        ConstraintImport {
            database: database.to_string(),
            workbook: workbook.to_string(),
            vintages: vec![2021, 2025, 2030, 2035, 2040, 2045, 2050],
        }
    }

    pub fn run(&self) -> Result<(), Box<dyn Error>> {
        let conn = schema::open_existing(&self.database)?;
        let tx = conn.unchecked_transaction()?;
        for sheet in table::sheet_names(&self.workbook)? {
            if !schema::table_exists(&tx, &sheet)? {
                warn!("table '{}' does not exist in the database, skipping", sheet);
                continue;
            }
            let Some(data) = table::read_sheet(&self.workbook, &sheet, 0, None)? else {
                continue;
            };
            if sheet == "LoanRate" {
                self.insert_loan_rates(&tx, &data)?;
            } else {
                insert_sheet(&tx, &sheet, &data)?;
            }
            info!("imported sheet '{}' ({} rows)", sheet, data.rows.len());
        }
        tx.commit()?;
        Ok(())
    }

    /// LoanRate rows with vintage 'All' apply to every build year, so they
    /// are expanded to one row per configured vintage.
    fn insert_loan_rates(&self, conn: &Connection, data: &WideTable) -> Result<(), Box<dyn Error>> {
        let mut stmt = conn.prepare(
            "INSERT INTO LoanRate (region, tech, vintage, rate, notes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for i in 0..data.rows.len() {
            let region = data.cell(i, "region");
            let tech = data.cell(i, "tech");
            let rate = data.cell(i, "rate");
            let notes = data.cell(i, "notes");
            let vintage = data.cell(i, "vintage");
            if vintage.text() == "All" {
                for v in &self.vintages {
                    stmt.execute(params![region, tech, v, rate, notes])?;
                }
            } else {
                stmt.execute(params![region, tech, vintage, rate, notes])?;
            }
        }
        Ok(())
    }
}

fn insert_sheet(conn: &Connection, table: &str, data: &WideTable) -> Result<(), Box<dyn Error>> {
    let existing = schema::table_columns(conn, table)?;
    for column in &data.columns {
        if !existing.contains(column) {
            conn.execute(
                &format!("ALTER TABLE \"{}\" ADD COLUMN {} TEXT", table, column),
                [],
            )?;
            info!("added missing column '{}' as TEXT to table '{}'", column, table);
        }
    }
    let mut stmt = conn.prepare(&schema::insert_sql(table, &data.columns))?;
    for row in &data.rows {
        stmt.execute(rusqlite::params_from_iter(row.iter()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::table::Cell;
    use tempfile::TempDir;

    fn scratch(dir: &TempDir) -> (String, Connection) {
        let path = dir.path().join("c.sqlite").to_str().unwrap().to_string();
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE LoanRate (region TEXT, tech TEXT, vintage INTEGER,
                 rate REAL, notes TEXT);
             CREATE TABLE GrowthRateMax (region TEXT, tech TEXT, rate REAL);",
        )
        .unwrap();
        (path, conn)
    }

    fn sheet(columns: &[&str], rows: Vec<Vec<Cell>>) -> WideTable {
        WideTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn all_vintage_expands() {
        let dir = TempDir::new().unwrap();
        let (path, conn) = scratch(&dir);
        let job = ConstraintImport {
            database: path,
            workbook: String::new(),
            vintages: vec![2021, 2025, 2030],
        };
        let data = sheet(
            &["region", "tech", "vintage", "rate", "notes"],
            vec![
                vec![
                    Cell::Text("ON".into()),
                    Cell::Text("T_LDV_C_N_ELC".into()),
                    Cell::Text("All".into()),
                    Cell::Number(0.05),
                    Cell::Text("subsidized".into()),
                ],
                vec![
                    Cell::Text("ON".into()),
                    Cell::Text("T_HDV_T_N_DSL".into()),
                    Cell::Number(2025.0),
                    Cell::Number(0.09),
                    Cell::Empty,
                ],
            ],
        );
        job.insert_loan_rates(&conn, &data).unwrap();

        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM LoanRate", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 4);
        let expanded: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM LoanRate WHERE tech = 'T_LDV_C_N_ELC'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(expanded, 3);
        let vintage: i64 = conn
            .query_row(
                "SELECT vintage FROM LoanRate WHERE tech = 'T_HDV_T_N_DSL'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(vintage, 2025);
    }

    #[test]
    fn missing_columns_are_added_as_text() {
        let dir = TempDir::new().unwrap();
        let (_path, conn) = scratch(&dir);
        let data = sheet(
            &["region", "tech", "rate", "reference"],
            vec![vec![
                Cell::Text("ON".into()),
                Cell::Text("T_LDV_C_N_ELC".into()),
                Cell::Number(0.1),
                Cell::Text("policy doc".into()),
            ]],
        );
        insert_sheet(&conn, "GrowthRateMax", &data).unwrap();

        let columns = schema::table_columns(&conn, "GrowthRateMax").unwrap();
        assert!(columns.contains(&"reference".to_string()));
        let reference: String = conn
            .query_row("SELECT reference FROM GrowthRateMax", [], |r| r.get(0))
            .unwrap();
        assert_eq!(reference, "policy doc");
    }
}
