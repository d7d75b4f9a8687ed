use std::error::Error;
use std::fs::File;
use std::io::Write;

use log::{error, info, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use crate::db::schema;

/// Tables keyed on `tech` in the model schema.
pub const TECH_TABLES: [&str; 15] = [
    "Technology",
    "LifetimeTech",
    "ExistingCapacity",
    "CapacityToActivity",
    "CapacityFactorProcess",
    "CapacityFactorTech",
    "MaxAnnualCapacityFactor",
    "MinAnnualCapacityFactor",
    "Efficiency",
    "CostInvest",
    "CostFixed",
    "CostVariable",
    "EmissionActivity",
    "EmissionEmbodied",
    "TechInputSplit",
];

/// Tables keyed on a commodity name, with the column holding it.
pub const COMMODITY_TABLES: [(&str, &str); 2] = [("Commodity", "name"), ("Demand", "commodity")];

/// Brings a target database in line with a newer source extraction:
/// delete the rows the subset marks stale, insert everything from the
/// source, deduplicate the whole database, and log every action.
///
/// With `subset` set to `None` the deletion phase is skipped entirely —
/// append/update mode for merging data that replaces nothing.
pub struct SubsetReplacement {
    pub target: String,
    pub source: String,
    pub subset: Option<String>,
    /// Plain-text audit log, one line per event.
    pub log_path: String,
    pub tech_tables: Vec<String>,
    pub commodity_tables: Vec<(String, String)>,
    pub replace_references: bool,
}

impl SubsetReplacement {
    /// Standard configuration over the model's table lists.
    pub fn new(target: &str, source: &str, subset: Option<&str>, log_path: &str) -> Self {
        SubsetReplacement {
            target: target.to_string(),
            source: source.to_string(),
            subset: subset.map(|s| s.to_string()),
            log_path: log_path.to_string(),
            tech_tables: TECH_TABLES.iter().map(|t| t.to_string()).collect(),
            commodity_tables: COMMODITY_TABLES
                .iter()
                .map(|(t, c)| (t.to_string(), c.to_string()))
                .collect(),
            replace_references: true,
        }
    }

    pub fn run(&self) -> Result<(), Box<dyn Error>> {
        let source = schema::open_existing(&self.source)?;
        let target = schema::open_existing(&self.target)?;
        let subset = match &self.subset {
            Some(path) => Some(schema::open_existing(path)?),
            None => None,
        };
        let mut log = File::create(&self.log_path)?;

        // Single write transaction; everything lands or nothing does.
        let tx = target.unchecked_transaction()?;

        let techs = match &subset {
            Some(conn) => distinct_values(conn, "Technology", "tech")?,
            None => Vec::new(),
        };
        for table in &self.tech_tables {
            replace_keyed_rows(table, "tech", &techs, &source, &tx, &mut log)?;
        }

        let names = match &subset {
            Some(conn) => distinct_values(conn, "Commodity", "name")?,
            None => Vec::new(),
        };
        for (table, column) in &self.commodity_tables {
            replace_keyed_rows(table, column, &names, &source, &tx, &mut log)?;
        }

        if self.replace_references {
            merge_references(&source, &tx, &mut log)?;
        } else {
            info!("references not replaced");
        }

        schema::remove_duplicates(&tx, &mut log)?;
        tx.commit()?;

        // Reclaims space freed by the dedup rebuilds
        target.execute_batch("VACUUM;")?;
        info!("replaced subset, saved to {}", self.target);
        Ok(())
    }
}

fn distinct_values(conn: &Connection, table: &str, column: &str) -> Result<Vec<String>, Box<dyn Error>> {
    let mut stmt = conn.prepare(&format!("SELECT DISTINCT {} FROM \"{}\"", column, table))?;
    let values = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(values)
}

/// Delete target rows whose key column matches any of `keys`, then insert
/// every source row.  Integrity violations are recovered per row: logged
/// with the offending payload and skipped, never fatal to the run.
fn replace_keyed_rows(
    table: &str,
    key_column: &str,
    keys: &[String],
    source: &Connection,
    target: &Connection,
    log: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    if !schema::table_exists(source, table)? || !schema::table_exists(target, table)? {
        warn!("table {} missing from source or target, skipping", table);
        writeln!(log, "Skipped missing table {}", table)?;
        return Ok(());
    }

    for key in keys {
        target.execute(
            &format!("DELETE FROM \"{}\" WHERE {} = ?1", table, key_column),
            params![key],
        )?;
    }

    let (columns, rows) = schema::read_rows(source, table)?;
    let key_index = columns.iter().position(|c| c == key_column);
    let mut stmt = target.prepare(&schema::insert_sql(table, &columns))?;
    for row in rows {
        match stmt.execute(params_from_iter(row.iter())) {
            Ok(_) => {
                let key = key_index
                    .map(|i| value_text(&row[i]))
                    .unwrap_or_default();
                writeln!(log, "Inserted new row in {} for {}: {}", table, key_column, key)?;
            }
            Err(e) => {
                let message = format!("Insert failed for {} with row {:?}; with error: {}", table, row, e);
                error!("{}", message);
                writeln!(log, "{}", message)?;
            }
        }
    }
    Ok(())
}

/// References are additive-only: bibliography accumulates and is never
/// considered stale.
fn merge_references(
    source: &Connection,
    target: &Connection,
    log: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    let existing = distinct_values(target, "references", "reference")?;
    let incoming = distinct_values(source, "references", "reference")?;
    let mut stmt = target.prepare("INSERT INTO \"references\" (reference) VALUES (?1)")?;
    for reference in incoming {
        if existing.contains(&reference) {
            continue;
        }
        match stmt.execute(params![reference]) {
            Ok(_) => writeln!(log, "Inserted new reference: {}", reference)?,
            Err(e) => {
                let message = format!("Insert failed for references: {}; with error: {}", reference, e);
                error!("{}", message);
                writeln!(log, "{}", message)?;
            }
        }
    }
    Ok(())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(_) => "<blob>".to_string(),
    }
}

/// Whole-table replacement: wipe each listed table in the target and copy
/// the source's rows over, columns discovered at call time.
pub fn replace_tables(
    source_db: &str,
    target_db: &str,
    tables: &[&str],
) -> Result<(), Box<dyn Error>> {
    let source = schema::open_existing(source_db)?;
    let target = schema::open_existing(target_db)?;
    let tx = target.unchecked_transaction()?;
    for table in tables {
        let (columns, rows) = schema::read_rows(&source, table)?;
        tx.execute(&format!("DELETE FROM \"{}\"", table), [])?;
        if rows.is_empty() {
            warn!("no data found in {} in source database", table);
            continue;
        }
        let mut stmt = tx.prepare(&schema::insert_sql(table, &columns))?;
        let mut n = 0;
        for row in rows {
            n += stmt.execute(params_from_iter(row.iter()))?;
        }
        info!("replaced {} rows in {}", n, table);
    }
    tx.commit()?;
    Ok(())
}

/// Update-only variant: replace rows only for techs that already exist in
/// the target's Technology table (excluding the sector's own `T_` prefixed
/// techs) and also appear in the source table.
pub fn update_matching_techs(
    source_db: &str,
    target_db: &str,
    tables: &[&str],
) -> Result<(), Box<dyn Error>> {
    let source = schema::open_existing(source_db)?;
    let target = schema::open_existing(target_db)?;

    let existing: Vec<String> = {
        let mut stmt =
            target.prepare("SELECT DISTINCT tech FROM Technology WHERE tech NOT LIKE 'T\\_%' ESCAPE '\\'")?;
        let existing = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        existing
    };
    info!("found {} matching techs in target db", existing.len());

    let tx = target.unchecked_transaction()?;
    for table in tables {
        if !schema::table_exists(&source, table)? {
            warn!("table {} missing from source, skipping", table);
            continue;
        }
        let source_techs = distinct_values(&source, table, "tech")?;
        let valid: Vec<&String> = source_techs.iter().filter(|t| existing.contains(t)).collect();
        if valid.is_empty() {
            info!("no matching techs found in source db for {}, skipping", table);
            continue;
        }

        let columns = schema::table_columns(&source, table)?;
        let placeholders = valid
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let rows: Vec<Vec<Value>> = {
            let mut stmt = source.prepare(&format!(
                "SELECT * FROM \"{}\" WHERE tech IN ({})",
                table, placeholders
            ))?;
            let rows = stmt
                .query_map(params_from_iter(valid.iter()), |row| {
                    (0..columns.len())
                        .map(|i| row.get::<_, Value>(i))
                        .collect::<rusqlite::Result<Vec<Value>>>()
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        tx.execute(
            &format!("DELETE FROM \"{}\" WHERE tech IN ({})", table, placeholders),
            params_from_iter(valid.iter()),
        )?;
        let mut stmt = tx.prepare(&schema::insert_sql(table, &columns))?;
        let mut n = 0;
        for row in &rows {
            n += stmt.execute(params_from_iter(row.iter()))?;
        }
        info!("updated {} rows in {}", n, table);
    }
    tx.commit()?;
    Ok(())
}
