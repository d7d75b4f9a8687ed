use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::Path;

use log::info;
use rusqlite::types::Value;
use rusqlite::Connection;

use crate::errors::EtlError;

/// Open a database that must already exist.  A missing file is fatal before
/// any mutation; these datasets are hand-curated and a wrong path means a
/// wrong run.
pub fn open_existing(path: &str) -> Result<Connection, Box<dyn Error>> {
    if !Path::new(path).exists() {
        return Err(Box::new(EtlError::MissingFile(path.into())));
    }
    Ok(Connection::open(path)?)
}

/// Create the destination database from the external schema definition if
/// it does not exist yet; otherwise optionally wipe every table so the
/// compilation starts clean.  This module writes into the schema, it never
/// defines it.
pub fn instantiate(database: &str, schema: &str, wipe: bool) -> Result<(), Box<dyn Error>> {
    let build = !Path::new(database).exists();
    let conn = Connection::open(database)?;
    if build {
        let ddl = fs::read_to_string(schema)
            .map_err(|_| EtlError::MissingFile(schema.into()))?;
        conn.execute_batch(&ddl)?;
        info!("created {} from {}", database, schema);
    } else if wipe {
        for table in table_names(&conn)? {
            conn.execute(&format!("DELETE FROM \"{}\"", table), [])?;
        }
        info!("database wiped prior to aggregation");
    }
    Ok(())
}

pub fn table_names(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let n: u32 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Column names in declaration order, discovered at call time so the caller
/// stays correct as the destination schema gains columns.
pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

pub fn primary_key_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let pk: i64 = row.get(5)?;
            Ok((name, pk))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns
        .into_iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(name, _)| name)
        .collect())
}

/// Every row of a table as dynamic values, with its column list.
pub fn read_rows(
    conn: &Connection,
    table: &str,
) -> Result<(Vec<String>, Vec<Vec<Value>>), Box<dyn Error>> {
    let columns = table_columns(conn, table)?;
    let mut stmt = conn.prepare(&format!("SELECT * FROM \"{}\"", table))?;
    let rows = stmt
        .query_map([], |row| {
            (0..columns.len())
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<Value>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((columns, rows))
}

/// Parameterized INSERT for a dynamic column list.  Values are always bound,
/// never spliced into the statement text.
pub fn insert_sql(table: &str, columns: &[String]) -> String {
    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        table,
        columns.join(", "),
        columns
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Rebuild every table as SELECT DISTINCT over all its columns so that no
/// two fully-identical rows remain anywhere in the database.  Restored after
/// every reconciliation run, no matter how the duplicates arrived.
pub fn remove_duplicates(conn: &Connection, log: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    for table in table_names(conn)? {
        let columns = table_columns(conn, &table)?;
        if columns.is_empty() {
            continue;
        }
        let column_list = columns.join(", ");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS temp_{table} AS SELECT DISTINCT {column_list} FROM \"{table}\";
             DROP TABLE \"{table}\";
             ALTER TABLE temp_{table} RENAME TO \"{table}\";"
        ))?;
        writeln!(log, "Removed duplicates from {}", table)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE Technology (tech TEXT PRIMARY KEY, flag TEXT);
             CREATE TABLE Demand (region TEXT, period INTEGER, commodity TEXT, demand REAL,
                 PRIMARY KEY (region, period, commodity));",
        )
        .unwrap();
        conn
    }

    #[test]
    fn introspection() {
        let conn = scratch();
        let mut names = table_names(&conn).unwrap();
        names.sort();
        assert_eq!(names, vec!["Demand", "Technology"]);
        assert!(table_exists(&conn, "Demand").unwrap());
        assert!(!table_exists(&conn, "CostInvest").unwrap());
        assert_eq!(
            table_columns(&conn, "Demand").unwrap(),
            vec!["region", "period", "commodity", "demand"]
        );
        assert_eq!(
            primary_key_columns(&conn, "Demand").unwrap(),
            vec!["region", "period", "commodity"]
        );
    }

    #[test]
    fn insert_sql_is_parameterized() {
        let sql = insert_sql(
            "Demand",
            &["region".to_string(), "period".to_string()],
        );
        assert_eq!(sql, "INSERT INTO \"Demand\" (region, period) VALUES (?1, ?2)");
    }

    #[test]
    fn dedup_leaves_distinct_rows_only() {
        let conn = scratch();
        // PRIMARY KEY tables cannot hold duplicates; use a bare table like
        // the ones produced by earlier dedup passes
        conn.execute_batch(
            "CREATE TABLE notes (tech TEXT, note TEXT);
             INSERT INTO notes VALUES ('A', 'x'), ('A', 'x'), ('B', 'y');",
        )
        .unwrap();
        let mut log = Vec::new();
        remove_duplicates(&conn, &mut log).unwrap();
        let n: u32 = conn
            .query_row("SELECT COUNT(*) FROM notes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 2);
        for table in table_names(&conn).unwrap() {
            let columns = table_columns(&conn, &table).unwrap().join(", ");
            let total: u32 = conn
                .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |r| {
                    r.get(0)
                })
                .unwrap();
            let distinct: u32 = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM (SELECT DISTINCT {} FROM \"{}\")",
                        columns, table
                    ),
                    [],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(total, distinct);
        }
        let text = String::from_utf8(log).unwrap();
        assert!(text.contains("Removed duplicates from notes"));
    }

    #[test]
    fn open_existing_rejects_missing_file() {
        let err = open_existing("/nonexistent/no.sqlite").unwrap_err();
        assert!(err.to_string().contains("missing required file"));
    }
}
