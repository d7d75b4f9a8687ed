use std::collections::HashSet;
use std::error::Error;

use itertools::Itertools;
use log::info;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};

use crate::db::schema;
use crate::errors::EtlError;

/// Divide every CapacityFactorTech factor of one technology by that
/// technology's maximum factor, so the profile peaks at 1.  The zero-max
/// guard fires before any row is touched: a silent division would fill the
/// table with infinities.  Returns the number of rows updated.
pub fn normalize_factor_by_max(database: &str, tech: &str) -> Result<usize, Box<dyn Error>> {
    let conn = schema::open_existing(database)?;

    let max_factor: Option<f64> = conn.query_row(
        "SELECT MAX(factor) FROM CapacityFactorTech WHERE tech = ?1",
        params![tech],
        |row| row.get(0),
    )?;
    let max_factor = max_factor.ok_or_else(|| EtlError::NoRows(tech.to_string()))?;
    if max_factor == 0.0 {
        return Err(Box::new(EtlError::ZeroDivisor(tech.to_string())));
    }
    info!("max factor for {}: {}", tech, max_factor);

    let updated = conn.execute(
        "UPDATE CapacityFactorTech SET factor = factor / ?1 WHERE tech = ?2",
        params![max_factor, tech],
    )?;
    info!("normalised {} rows", updated);
    Ok(updated)
}

/// Rescale and copy CapacityFactorTech rows between databases.
///
/// Rows are matched on the key columns (region, season, tod, tech):
///   scale = SUM(scale-db factors) / SUM(source factors)  over matched keys.
/// Matched rows in the target get factor × scale with all other non-key
/// columns copied verbatim; no new rows are inserted.  Any inconsistency —
/// a key missing from the scale database, differing row counts, a zero
/// source sum — aborts with zero writes: a statistically meaningless scale
/// factor must never be applied.
pub struct TransferScale {
    pub target: String,
    pub source: String,
    pub scale: String,
    pub table: String,
    pub key_columns: Vec<String>,
    pub factor_column: String,
}

impl TransferScale {
    pub fn capacity_factor_tech(target: &str, source: &str, scale: &str) -> Self {
        TransferScale {
            target: target.to_string(),
            source: source.to_string(),
            scale: scale.to_string(),
            table: "CapacityFactorTech".to_string(),
            key_columns: ["region", "season", "tod", "tech"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            factor_column: "factor".to_string(),
        }
    }

    /// Returns the number of rows updated in the target.
    pub fn run(&self) -> Result<usize, Box<dyn Error>> {
        let source = schema::open_existing(&self.source)?;
        let target = schema::open_existing(&self.target)?;
        let scale_db = schema::open_existing(&self.scale)?;

        let all_columns = schema::table_columns(&source, &self.table)?;
        let non_key: Vec<&String> = all_columns
            .iter()
            .filter(|c| !self.key_columns.contains(c))
            .collect();
        let factor_index = all_columns
            .iter()
            .position(|c| *c == self.factor_column)
            .ok_or_else(|| {
                format!("column {} not found in {}", self.factor_column, self.table)
            })?;
        for column in &self.key_columns {
            if !all_columns.contains(column) {
                return Err(format!("column {} not found in {}", column, self.table).into());
            }
        }

        // Keys present in the target
        let key_list = self.key_columns.join(", ");
        let target_keys: HashSet<String> = {
            let mut stmt = target.prepare(&format!(
                "SELECT {} FROM \"{}\"",
                key_list, self.table
            ))?;
            let keys = stmt
                .query_map([], |row| {
                    (0..self.key_columns.len())
                        .map(|i| row.get::<_, Value>(i))
                        .collect::<rusqlite::Result<Vec<Value>>>()
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .map(|k| join_key(&k))
                .collect();
            keys
        };

        // Source rows whose key exists in the target
        let mut matched: Vec<Vec<Value>> = Vec::new();
        let mut sum_source = 0.0;
        {
            let mut stmt = source.prepare(&format!(
                "SELECT {} FROM \"{}\"",
                all_columns.join(", "),
                self.table
            ))?;
            let rows = stmt.query_map([], |row| {
                (0..all_columns.len())
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })?;
            for row in rows {
                let row = row?;
                let key: Vec<Value> = self
                    .key_columns
                    .iter()
                    .map(|c| row[all_columns.iter().position(|a| a == c).unwrap()].clone())
                    .collect();
                if target_keys.contains(&join_key(&key)) {
                    sum_source += as_f64(&row[factor_index]);
                    matched.push(row);
                }
            }
        }
        if matched.is_empty() {
            info!("no matching rows between source and target, nothing to do");
            return Ok(0);
        }

        // SUM(factor) in the scale db for the exact same keys; the count
        // catches keys that appear more than once there
        let where_clause = self
            .key_columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 1))
            .join(" AND ");
        let mut sum_scale = 0.0;
        let mut scale_count = 0usize;
        {
            let mut stmt = scale_db.prepare(&format!(
                "SELECT SUM({0}), COUNT({0}) FROM \"{1}\" WHERE {2}",
                self.factor_column, self.table, where_clause
            ))?;
            for row in &matched {
                let key = self.key_values(&all_columns, row);
                let (factor, count): (Option<f64>, i64) = stmt
                    .query_row(params_from_iter(key.iter()), |r| Ok((r.get(0)?, r.get(1)?)))?;
                match factor {
                    Some(f) => {
                        sum_scale += f;
                        scale_count += count as usize;
                    }
                    None => {
                        return Err(Box::new(EtlError::MissingScaleKey(
                            key.iter().map(value_text).collect::<Vec<_>>().join(", "),
                        )))
                    }
                }
            }
        }

        if scale_count != matched.len() {
            return Err(Box::new(EtlError::RowCountMismatch {
                source_rows: matched.len(),
                scale_rows: scale_count,
            }));
        }
        if sum_source == 0.0 {
            return Err(Box::new(EtlError::ZeroSourceSum));
        }

        let scale = sum_scale / sum_source;
        info!("matched rows       : {}", matched.len());
        info!("sum(source.factor) : {:.6}", sum_source);
        info!("sum(scale.factor)  : {:.6}", sum_scale);
        info!("scale factor       : {:.6}", scale);

        let set_clause = non_key
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 1))
            .join(", ");
        let update_where = self
            .key_columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, non_key.len() + i + 1))
            .join(" AND ");
        let update_sql = format!(
            "UPDATE \"{}\" SET {} WHERE {}",
            self.table, set_clause, update_where
        );

        let tx = target.unchecked_transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(&update_sql)?;
            for row in &matched {
                let mut binds: Vec<Value> = Vec::with_capacity(all_columns.len());
                for c in &non_key {
                    let i = all_columns.iter().position(|a| a == *c).unwrap();
                    if i == factor_index {
                        binds.push(Value::Real(as_f64(&row[i]) * scale));
                    } else {
                        binds.push(row[i].clone());
                    }
                }
                binds.extend(self.key_values(&all_columns, row));
                updated += stmt.execute(params_from_iter(binds.iter()))?;
            }
        }
        tx.commit()?;
        info!("rows updated       : {}", updated);
        Ok(updated)
    }

    fn key_values(&self, all_columns: &[String], row: &[Value]) -> Vec<Value> {
        self.key_columns
            .iter()
            .map(|c| row[all_columns.iter().position(|a| a == c).unwrap()].clone())
            .collect()
    }
}

fn join_key(values: &[Value]) -> String {
    values.iter().map(|v| value_text(v)).join("\u{1f}")
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

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Real(r) => *r,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use tempfile::TempDir;

    const CFT: &str = "CREATE TABLE CapacityFactorTech (
        region TEXT, season TEXT, tod TEXT, tech TEXT, factor REAL, notes TEXT);";

    fn db(dir: &TempDir, name: &str, rows: &str) -> String {
        let path = dir.path().join(name).to_str().unwrap().to_string();
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(&format!("{}{}", CFT, rows)).unwrap();
        path
    }

    fn factors(path: &str) -> Vec<f64> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("SELECT factor FROM CapacityFactorTech ORDER BY season, tod")
            .unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<f64>>>()
            .unwrap()
    }

    #[test]
    fn normalize_divides_by_max() {
        let dir = TempDir::new().unwrap();
        let target = db(
            &dir,
            "t.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 0.2, ''),
                ('ON', 'D001', 'H02', 'T_CHRG', 0.5, ''),
                ('ON', 'D001', 'H03', 'T_OTHER', 0.9, '');",
        );
        let n = normalize_factor_by_max(&target, "T_CHRG").unwrap();
        assert_eq!(n, 2);
        assert_eq!(factors(&target), vec![0.4, 1.0, 0.9]);
    }

    #[test]
    fn zero_max_raises_before_write() {
        let dir = TempDir::new().unwrap();
        let target = db(
            &dir,
            "t.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 0.0, ''),
                ('ON', 'D001', 'H02', 'T_CHRG', 0.0, '');",
        );
        let err = normalize_factor_by_max(&target, "T_CHRG").unwrap_err();
        assert!(err.to_string().contains("zero"));
        assert_eq!(factors(&target), vec![0.0, 0.0]);
    }

    #[test]
    fn missing_tech_raises_no_rows() {
        let dir = TempDir::new().unwrap();
        let target = db(&dir, "t.sqlite", "");
        let err = normalize_factor_by_max(&target, "T_NONE").unwrap_err();
        assert!(err.to_string().contains("no rows"));
    }

    #[test]
    fn transfer_scale_applies_ratio() {
        let dir = TempDir::new().unwrap();
        let target = db(
            &dir,
            "t.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 9.9, 'stale'),
                ('ON', 'D001', 'H02', 'T_CHRG', 9.9, 'stale');",
        );
        let source = db(
            &dir,
            "s.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 1.0, 'fresh'),
                ('ON', 'D001', 'H02', 'T_CHRG', 3.0, 'fresh'),
                ('QC', 'D001', 'H01', 'T_CHRG', 7.0, 'unmatched');",
        );
        let scale = db(
            &dir,
            "c.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 0.5, ''),
                ('ON', 'D001', 'H02', 'T_CHRG', 1.5, '');",
        );

        let job = TransferScale::capacity_factor_tech(&target, &source, &scale);
        let n = job.run().unwrap();
        assert_eq!(n, 2);
        // scale = (0.5 + 1.5) / (1.0 + 3.0) = 0.5; non-key columns copied
        assert_eq!(factors(&target), vec![0.5, 1.5]);
        let conn = Connection::open(&target).unwrap();
        let notes: String = conn
            .query_row(
                "SELECT DISTINCT notes FROM CapacityFactorTech",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(notes, "fresh");
    }

    #[test]
    fn missing_scale_key_aborts_without_writes() {
        let dir = TempDir::new().unwrap();
        let target = db(
            &dir,
            "t.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 9.9, '');",
        );
        let source = db(
            &dir,
            "s.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 1.0, '');",
        );
        let scale = db(&dir, "c.sqlite", "");

        let job = TransferScale::capacity_factor_tech(&target, &source, &scale);
        let err = job.run().unwrap_err();
        assert!(err.to_string().contains("not in the scale database"));
        assert_eq!(factors(&target), vec![9.9]);
    }

    #[test]
    fn duplicate_scale_rows_abort_without_writes() {
        let dir = TempDir::new().unwrap();
        let target = db(
            &dir,
            "t.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 9.9, '');",
        );
        let source = db(
            &dir,
            "s.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 1.0, '');",
        );
        let scale = db(
            &dir,
            "c.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 0.5, ''),
                ('ON', 'D001', 'H01', 'T_CHRG', 0.7, '');",
        );

        let job = TransferScale::capacity_factor_tech(&target, &source, &scale);
        let err = job.run().unwrap_err();
        assert!(err.to_string().contains("mismatch"));
        assert_eq!(factors(&target), vec![9.9]);
    }

    #[test]
    fn zero_source_sum_aborts() {
        let dir = TempDir::new().unwrap();
        let target = db(
            &dir,
            "t.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 9.9, '');",
        );
        let source = db(
            &dir,
            "s.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 0.0, '');",
        );
        let scale = db(
            &dir,
            "c.sqlite",
            "INSERT INTO CapacityFactorTech VALUES
                ('ON', 'D001', 'H01', 'T_CHRG', 0.5, '');",
        );

        let job = TransferScale::capacity_factor_tech(&target, &source, &scale);
        let err = job.run().unwrap_err();
        assert!(err.to_string().contains("zero"));
        assert_eq!(factors(&target), vec![9.9]);
    }
}
