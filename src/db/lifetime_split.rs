use std::collections::{HashMap, HashSet};
use std::error::Error;

use log::info;
use rusqlite::params;
use rusqlite::types::Value;
use rusqlite::Connection;

use crate::db::schema;

/// Split coarse vehicle technologies into lifetime-percentile classes.
///
/// Every tech matching one of `patterns` is duplicated once per suffix in
/// every table that carries a `tech` column, the suffixed copies get their
/// own survival lifetimes, vintages that expire before the first model
/// period are dropped, existing capacity is re-shared between the classes,
/// and MinNewCapacityShare/TechGroup constraints are seeded so the optimizer
/// keeps the class mix fixed for new builds.  Operates in place; callers
/// copy the database first.
pub struct LifetimeSplit {
    pub database: String,
    /// Tech-name prefixes to split, e.g. "T_LDV_C_".
    pub patterns: Vec<String>,
    /// Percentile class suffixes, e.g. "_S12".
    pub suffixes: Vec<String>,
    /// suffix -> pattern -> lifetime.  Expected value of the scrappage
    /// distribution up to the class percentile.
    pub lifetime_map: HashMap<String, HashMap<String, f64>>,
    /// Capacity share of each percentile class.
    pub percentile_share: f64,
    /// Capacity share kept by the parent (median) tech.
    pub parent_share: f64,
    pub periods: Vec<i32>,
    pub last_existing_period: i32,
    pub region: String,
}

impl LifetimeSplit {
    pub fn run(&self) -> Result<(), Box<dyn Error>> {
        let conn = schema::open_existing(&self.database)?;
        let tx = conn.unchecked_transaction()?;

        for table in schema::table_names(&tx)? {
            let columns = schema::table_columns(&tx, &table)?;
            if columns.iter().any(|c| c == "tech") {
                self.duplicate_tech_rows(&tx, &table)?;
            }
        }

        self.override_lifetimes(&tx)?;
        let lifetimes = self.lifetime_lookup(&tx)?;

        let removed = self.remove_expired(&tx, &lifetimes)?;
        self.scale_capacity(&tx, &removed)?;

        self.adjust_capacity_factor(&tx, "MaxAnnualCapacityFactor", &lifetimes)?;
        self.adjust_capacity_factor(&tx, "MinAnnualCapacityFactor", &lifetimes)?;
        self.adjust_cost_variable(&tx, &lifetimes)?;

        let split_techs = self.split_techs(&lifetimes);
        self.seed_capacity_shares(&tx, &split_techs)?;
        self.seed_tech_groups(&tx, &split_techs)?;

        for table in [
            "LifetimeTech",
            "ExistingCapacity",
            "CostVariable",
            "MinNewCapacityShare",
            "TechGroupMember",
        ] {
            if schema::table_exists(&tx, table)? {
                tx.execute(
                    &format!(
                        "DELETE FROM \"{}\" WHERE tech IS NULL OR trim(tech) = ''",
                        table
                    ),
                    [],
                )?;
            }
        }

        tx.commit()?;
        info!("lifetime split finished for {}", self.database);
        Ok(())
    }

    fn matches_pattern<'a>(&'a self, tech: &str) -> Option<&'a str> {
        self.patterns
            .iter()
            .find(|p| tech.starts_with(p.as_str()))
            .map(|p| p.as_str())
    }

    fn suffix_of<'a>(&'a self, tech: &str) -> Option<&'a str> {
        self.suffixes
            .iter()
            .find(|s| tech.ends_with(s.as_str()))
            .map(|s| s.as_str())
    }

    fn percentile(suffix: &str) -> i32 {
        suffix
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .unwrap_or(50)
    }

    /// Copy every row of a pattern-matched tech, once per suffix, with the
    /// suffix appended to the tech name.
    fn duplicate_tech_rows(&self, conn: &Connection, table: &str) -> Result<(), Box<dyn Error>> {
        let (columns, rows) = schema::read_rows(conn, table)?;
        let tech_index = columns.iter().position(|c| c == "tech").unwrap();
        let sql = schema::insert_sql(table, &columns)
            .replacen("INSERT INTO", "INSERT OR REPLACE INTO", 1);
        let mut stmt = conn.prepare(&sql)?;
        let mut copied = 0;
        for row in rows {
            let tech = text(&row[tech_index]);
            if self.matches_pattern(&tech).is_none() || self.suffix_of(&tech).is_some() {
                continue;
            }
            for suffix in &self.suffixes {
                let mut copy = row.clone();
                copy[tech_index] = Value::Text(format!("{}{}", tech, suffix));
                stmt.execute(rusqlite::params_from_iter(copy.iter()))?;
                copied += 1;
            }
        }
        if copied > 0 {
            info!("{}: duplicated {} rows", table, copied);
        }
        Ok(())
    }

    fn override_lifetimes(&self, conn: &Connection) -> Result<(), Box<dyn Error>> {
        let mut stmt =
            conn.prepare("UPDATE LifetimeTech SET lifetime = ?1 WHERE tech = ?2")?;
        let techs: Vec<String> = {
            let mut q = conn.prepare("SELECT tech FROM LifetimeTech")?;
            let techs = q
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            techs
        };
        for tech in techs {
            let (Some(pattern), Some(suffix)) =
                (self.matches_pattern(&tech), self.suffix_of(&tech))
            else {
                continue;
            };
            if let Some(lifetime) = self
                .lifetime_map
                .get(suffix)
                .and_then(|by_pattern| by_pattern.get(pattern))
            {
                stmt.execute(params![lifetime, tech])?;
            }
        }
        Ok(())
    }

    fn lifetime_lookup(&self, conn: &Connection) -> Result<HashMap<String, f64>, Box<dyn Error>> {
        let mut stmt = conn.prepare("SELECT tech, lifetime FROM LifetimeTech")?;
        let map = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1).unwrap_or(0.0)))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(map)
    }

    /// Drop suffixed (tech, vintage) pairs that retire before the first
    /// model period, in both ExistingCapacity and Efficiency.  Returns the
    /// (parent, vintage) -> removed-suffix map used for residual scaling.
    fn remove_expired(
        &self,
        conn: &Connection,
        lifetimes: &HashMap<String, f64>,
    ) -> Result<HashMap<(String, i64), HashSet<String>>, Box<dyn Error>> {
        let first_period = self.periods[0] as f64;
        let mut expired: Vec<(String, i64)> = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT tech, vintage FROM ExistingCapacity")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (tech, vintage) = row?;
                if self.suffix_of(&tech).is_none() {
                    continue;
                }
                let lifetime = lifetimes.get(&tech).copied().unwrap_or(0.0);
                if vintage as f64 + lifetime <= first_period {
                    expired.push((tech, vintage));
                }
            }
        }

        let mut removed: HashMap<(String, i64), HashSet<String>> = HashMap::new();
        for table in ["ExistingCapacity", "Efficiency"] {
            let mut stmt = conn.prepare(&format!(
                "DELETE FROM \"{}\" WHERE tech = ?1 AND vintage = ?2",
                table
            ))?;
            for (tech, vintage) in &expired {
                stmt.execute(params![tech, vintage])?;
            }
        }
        for (tech, vintage) in expired {
            if let Some(suffix) = self.suffix_of(&tech) {
                let parent = tech[..tech.len() - suffix.len()].to_string();
                removed
                    .entry((parent, vintage))
                    .or_default()
                    .insert(suffix.to_string());
            }
        }
        Ok(removed)
    }

    /// Re-share existing capacity: each percentile class carries its share,
    /// parents keep their own plus the share of any class that expired.
    fn scale_capacity(
        &self,
        conn: &Connection,
        removed: &HashMap<(String, i64), HashSet<String>>,
    ) -> Result<(), Box<dyn Error>> {
        let rows: Vec<(String, i64)> = {
            let mut stmt = conn.prepare("SELECT tech, vintage FROM ExistingCapacity")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut update = conn.prepare(
            "UPDATE ExistingCapacity SET capacity = capacity * ?1
             WHERE tech = ?2 AND vintage = ?3",
        )?;
        for (tech, vintage) in rows {
            let factor = if self.suffix_of(&tech).is_some() {
                self.percentile_share
            } else if let Some(suffixes) = removed.get(&(tech.clone(), vintage)) {
                self.parent_share + suffixes.len() as f64 * self.percentile_share
            } else if self.matches_pattern(&tech).is_some() {
                self.parent_share
            } else {
                continue;
            };
            update.execute(params![factor, tech, vintage])?;
        }
        Ok(())
    }

    /// Keep capacity-factor periods consistent with the class lifetimes of
    /// existing stock.  Long-lived classes inherit the last known period's
    /// factor for every period the stock survives; short-lived classes lose
    /// periods past retirement.
    fn adjust_capacity_factor(
        &self,
        conn: &Connection,
        table: &str,
        lifetimes: &HashMap<String, f64>,
    ) -> Result<(), Box<dyn Error>> {
        if !schema::table_exists(conn, table)? {
            return Ok(());
        }
        let (columns, rows) = schema::read_rows(conn, table)?;
        let Some(tech_index) = columns.iter().position(|c| c == "tech") else {
            return Ok(());
        };
        let Some(period_index) = columns.iter().position(|c| c == "period") else {
            return Ok(());
        };

        let mut present: HashSet<(String, i64)> = HashSet::new();
        let mut last_row: HashMap<String, (i64, Vec<Value>)> = HashMap::new();
        for row in &rows {
            let tech = text(&row[tech_index]);
            let period = as_i64(&row[period_index]);
            present.insert((tech.clone(), period));
            match last_row.get(&tech) {
                Some((p, _)) if *p >= period => {}
                _ => {
                    last_row.insert(tech, (period, row.clone()));
                }
            }
        }

        let mut to_add: Vec<Vec<Value>> = Vec::new();
        let mut to_remove: Vec<(String, i64)> = Vec::new();
        for row in &rows {
            let tech = text(&row[tech_index]);
            let period = as_i64(&row[period_index]);
            let Some(suffix) = self.suffix_of(&tech) else {
                continue;
            };
            if !tech.ends_with(&format!("_EX{}", suffix)) {
                continue;
            }
            let lifetime = lifetimes.get(&tech).copied().unwrap_or(0.0);
            let valid: Vec<i64> = self
                .periods
                .iter()
                .filter(|p| (**p as f64) < self.last_existing_period as f64 + lifetime)
                .map(|p| *p as i64)
                .collect();
            if Self::percentile(suffix) > 50 {
                for p in &valid {
                    if present.contains(&(tech.clone(), *p)) {
                        continue;
                    }
                    let (_, template) = &last_row[&tech];
                    let mut copy = template.clone();
                    copy[period_index] = Value::Integer(*p);
                    to_add.push(copy);
                    present.insert((tech.clone(), *p));
                }
            } else if !valid.contains(&period) {
                to_remove.push((tech, period));
            }
        }

        let mut delete = conn.prepare(&format!(
            "DELETE FROM \"{}\" WHERE tech = ?1 AND period = ?2",
            table
        ))?;
        for (tech, period) in &to_remove {
            delete.execute(params![tech, period])?;
        }
        let mut insert = conn.prepare(&schema::insert_sql(table, &columns))?;
        for row in &to_add {
            insert.execute(rusqlite::params_from_iter(row.iter()))?;
        }
        if !to_add.is_empty() || !to_remove.is_empty() {
            info!(
                "{}: added {} periods, removed {}",
                table,
                to_add.len(),
                to_remove.len()
            );
        }
        Ok(())
    }

    /// Same period reconciliation for CostVariable, keyed on (tech, vintage)
    /// with validity `vintage <= period < vintage + lifetime`.
    fn adjust_cost_variable(
        &self,
        conn: &Connection,
        lifetimes: &HashMap<String, f64>,
    ) -> Result<(), Box<dyn Error>> {
        let table = "CostVariable";
        if !schema::table_exists(conn, table)? {
            return Ok(());
        }
        let (columns, rows) = schema::read_rows(conn, table)?;
        let Some(tech_index) = columns.iter().position(|c| c == "tech") else {
            return Ok(());
        };
        let Some(period_index) = columns.iter().position(|c| c == "period") else {
            return Ok(());
        };
        let Some(vintage_index) = columns.iter().position(|c| c == "vintage") else {
            return Ok(());
        };

        let mut present: HashSet<(String, i64, i64)> = HashSet::new();
        let mut last_row: HashMap<(String, i64), (i64, Vec<Value>)> = HashMap::new();
        for row in &rows {
            let tech = text(&row[tech_index]);
            let vintage = as_i64(&row[vintage_index]);
            let period = as_i64(&row[period_index]);
            present.insert((tech.clone(), vintage, period));
            match last_row.get(&(tech.clone(), vintage)) {
                Some((p, _)) if *p >= period => {}
                _ => {
                    last_row.insert((tech, vintage), (period, row.clone()));
                }
            }
        }

        let mut to_add: Vec<Vec<Value>> = Vec::new();
        let mut to_remove: Vec<(String, i64, i64)> = Vec::new();
        for row in &rows {
            let tech = text(&row[tech_index]);
            let vintage = as_i64(&row[vintage_index]);
            let period = as_i64(&row[period_index]);
            let Some(suffix) = self.suffix_of(&tech) else {
                continue;
            };
            let lifetime = lifetimes.get(&tech).copied().unwrap_or(0.0);
            let valid: Vec<i64> = self
                .periods
                .iter()
                .map(|p| *p as i64)
                .filter(|p| vintage <= *p && (*p as f64) < vintage as f64 + lifetime)
                .collect();
            if Self::percentile(suffix) > 50 {
                for p in &valid {
                    if present.contains(&(tech.clone(), vintage, *p)) {
                        continue;
                    }
                    let (_, template) = &last_row[&(tech.clone(), vintage)];
                    let mut copy = template.clone();
                    copy[period_index] = Value::Integer(*p);
                    to_add.push(copy);
                    present.insert((tech.clone(), vintage, *p));
                }
            } else {
                if !valid.contains(&period) {
                    to_remove.push((tech.clone(), vintage, period));
                }
                if vintage as f64 + lifetime < self.periods[0] as f64 {
                    to_remove.push((tech, vintage, period));
                }
            }
        }

        let mut delete = conn.prepare(
            "DELETE FROM CostVariable WHERE tech = ?1 AND vintage = ?2 AND period = ?3",
        )?;
        for (tech, vintage, period) in &to_remove {
            delete.execute(params![tech, vintage, period])?;
        }
        let mut insert = conn.prepare(&schema::insert_sql(table, &columns))?;
        for row in &to_add {
            insert.execute(rusqlite::params_from_iter(row.iter()))?;
        }
        Ok(())
    }

    /// Techs that take part in the split constraints: pattern-matched, not
    /// the existing-stock variants.
    fn split_techs(&self, lifetimes: &HashMap<String, f64>) -> Vec<String> {
        let mut techs: Vec<String> = lifetimes
            .keys()
            .filter(|t| self.matches_pattern(t).is_some())
            .filter(|t| !t.ends_with("_EX") && !t.contains("_EX_S"))
            .cloned()
            .collect();
        techs.sort();
        techs
    }

    fn seed_capacity_shares(
        &self,
        conn: &Connection,
        techs: &[String],
    ) -> Result<(), Box<dyn Error>> {
        let mut exists = conn.prepare(
            "SELECT COUNT(*) FROM MinNewCapacityShare
             WHERE region = ?1 AND period = ?2 AND tech = ?3 AND group_name = ?4",
        )?;
        let mut insert = conn.prepare(
            "INSERT INTO MinNewCapacityShare (region, period, tech, group_name, min_proportion)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for tech in techs {
            let group = group_name(tech);
            let share = if self.suffix_of(tech).is_some() {
                self.percentile_share
            } else {
                self.parent_share
            };
            for period in &self.periods {
                let n: i64 =
                    exists.query_row(params![self.region, period, tech, group], |r| r.get(0))?;
                if n == 0 {
                    insert.execute(params![self.region, period, tech, group, share])?;
                }
            }
        }
        Ok(())
    }

    fn seed_tech_groups(&self, conn: &Connection, techs: &[String]) -> Result<(), Box<dyn Error>> {
        let mut group_exists =
            conn.prepare("SELECT COUNT(*) FROM TechGroup WHERE group_name = ?1")?;
        let mut group_insert = conn.prepare("INSERT INTO TechGroup (group_name) VALUES (?1)")?;
        let mut member_exists = conn.prepare(
            "SELECT COUNT(*) FROM TechGroupMember WHERE group_name = ?1 AND tech = ?2",
        )?;
        let mut member_insert =
            conn.prepare("INSERT INTO TechGroupMember (group_name, tech) VALUES (?1, ?2)")?;
        for tech in techs {
            let group = group_name(tech);
            let n: i64 = group_exists.query_row(params![group], |r| r.get(0))?;
            if n == 0 {
                group_insert.execute(params![group])?;
            }
            let n: i64 = member_exists.query_row(params![group, tech], |r| r.get(0))?;
            if n == 0 {
                member_insert.execute(params![group, tech])?;
            }
        }
        Ok(())
    }
}

/// Group shares are declared per drivetrain family: everything before the
/// "_N" (new build) marker.
fn group_name(tech: &str) -> &str {
    match tech.find("_N") {
        Some(i) => &tech[..i],
        None => tech,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        _ => String::new(),
    }
}

fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Integer(i) => *i,
        Value::Real(r) => *r as i64,
        Value::Text(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}
