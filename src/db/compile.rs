use std::collections::HashMap;
use std::error::Error;

use log::info;
use rusqlite::{params, params_from_iter, Connection};

use crate::db::schema;
use crate::sheet::dqi::dq_time;
use crate::sheet::melt::{melt, round_to, Melted, MeltedRow};
use crate::sheet::table::{read_sheet, Cell, WideTable};
use crate::sheet::vintage::{aggregate_vintages, Reducer};

/// Vintages at or before this year are coarsened into quinquennial buckets.
pub const VINTAGE_CUTOFF: i32 = 2020;

/// Lifetime used when a technology has no row in the Lifetime sheet.  An
/// explicit policy, not an error: see the cost compilation methods.
pub const DEFAULT_LIFETIME: f64 = 40.0;

/// Model vintages quoted once (for 2021) in the embodied-emissions sheet and
/// replicated to every later build year.
const EMBODIED_VINTAGES: [&str; 6] = ["2025", "2030", "2035", "2040", "2045", "2050"];

/// Fixed model tables loaded verbatim from the template workbook.
const TEMPLATE_TABLES: [&str; 17] = [
    "commodity_labels",
    "currencies",
    "dq_estimate",
    "dq_reliability",
    "dq_completeness",
    "dq_time",
    "dq_geography",
    "dq_technology",
    "regions",
    "sector_labels",
    "technology_labels",
    "time_period_labels",
    "time_periods",
    "time_season",
    "time_of_day",
    "tech_annual",
    "StorageDuration",
];

/// Compiles one spreadsheet workbook into one model database.  One method
/// per parameter table; `compile_all` runs them in dependency order (techs
/// and commodities before the parameters that reference them).
#[derive(Clone)]
pub struct CompilationArchive {
    pub spreadsheet: String,
    /// Template workbook carrying the fixed model tables (time periods,
    /// labels, currencies, DQI scales).
    pub template: String,
    pub database: String,
    /// External schema definition, executed once when the database file does
    /// not exist yet.  This crate writes into that schema, never defines it.
    pub schema: String,
    /// Decimal places kept on every numeric value before persistence.
    pub precision: u32,
    /// Region stamped on every row, e.g. "ON".  The workbook carries one
    /// region per file.
    pub region: String,
    /// Sector tag prefixed to references and stamped on technologies,
    /// e.g. "Transport".
    pub sector: String,
    /// Existing capacities below this threshold are modelling noise;
    /// `cleanup` removes them together with their dependent rows.
    pub epsilon: f64,
    /// Convert CH4 and N2O factors from kilotonnes to tonnes so the units
    /// line up with the other sectors.
    pub convert_emission_units: bool,
    pub create_emission_embodied: bool,
    pub wipe_database: bool,
}

impl CompilationArchive {
    /// Create the database from the schema file, or wipe it if configured.
    pub fn instantiate_database(&self) -> Result<(), Box<dyn Error>> {
        schema::instantiate(&self.database, &self.schema, self.wipe_database)
    }

    fn read_sheet(
        &self,
        sheet: &str,
        header_row: usize,
        last_col: Option<&str>,
    ) -> Result<Option<WideTable>, Box<dyn Error>> {
        let table = read_sheet(&self.spreadsheet, sheet, header_row, last_col)?;
        if table.is_none() {
            info!("sheet '{}' not found in {}, skipping", sheet, self.spreadsheet);
        }
        Ok(table)
    }

    fn base_year() -> i32 {
        jiff::Zoned::now().date().year() as i32
    }

    /// Technology -> lifetime, from the Lifetime sheet.  Missing sheet means
    /// an empty map; callers fall back to [`DEFAULT_LIFETIME`].
    fn lifetimes(&self) -> Result<HashMap<String, f64>, Box<dyn Error>> {
        let mut map = HashMap::new();
        if let Some(table) = self.read_sheet("Lifetime", 1, Some("Technological"))? {
            for i in 0..table.rows.len() {
                let tech = table.cell(i, "Technology").text();
                if let Some(life) = table.cell(i, "Lifetime").as_f64() {
                    map.insert(tech, life);
                }
            }
        }
        Ok(map)
    }

    /// Last period flagged existing ('e') in the template's time_periods
    /// table.  Residual technologies stop producing once their lifetime runs
    /// out from here.
    fn last_existing_period(&self) -> Result<i32, Box<dyn Error>> {
        let Some(table) = read_sheet(&self.template, "time_periods", 0, None)? else {
            return Ok(VINTAGE_CUTOFF);
        };
        let mut period = VINTAGE_CUTOFF;
        for i in 0..table.rows.len() {
            if table.cell(i, "flag").text() == "e" {
                if let Some(p) = table.cell(i, "t_periods").as_f64() {
                    period = period.max(p as i32);
                }
            }
        }
        Ok(period)
    }

    /// Load the fixed model tables from the template workbook, replacing any
    /// rows from a previous run.  Tables the schema does not define yet are
    /// created with TEXT columns.
    pub fn insert_template(&self) -> Result<(), Box<dyn Error>> {
        let conn = Connection::open(&self.database)?;
        for table_name in TEMPLATE_TABLES {
            let Some(data) = read_sheet(&self.template, table_name, 0, None)? else {
                info!("sheet '{}' not found in {}, skipping", table_name, self.template);
                continue;
            };
            if schema::table_exists(&conn, table_name)? {
                conn.execute(&format!("DELETE FROM \"{}\"", table_name), [])?;
            } else {
                let columns = data
                    .columns
                    .iter()
                    .map(|c| format!("\"{}\" TEXT", c))
                    .collect::<Vec<_>>()
                    .join(", ");
                conn.execute(
                    &format!("CREATE TABLE \"{}\" ({})", table_name, columns),
                    [],
                )?;
            }
            let mut stmt = conn.prepare(&schema::insert_sql(table_name, &data.columns))?;
            for row in &data.rows {
                stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        info!("template tables inserted into {}", self.database);
        Ok(())
    }

    /// References accumulate; each is tagged with the sector it came from.
    pub fn compile_references(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("References", 0, None)? else {
            return Ok(());
        };
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare("REPLACE INTO \"references\" (reference) VALUES (?1)")?;
        for i in 0..table.rows.len() {
            let reference = table.cell(i, "References").text();
            if reference.is_empty() {
                continue;
            }
            stmt.execute(params![format!("[{}] {}", self.sector, reference)])?;
        }
        info!("references compiled into {}", self.database);
        Ok(())
    }

    pub fn compile_techs(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("Techs", 0, Some("Category"))? else {
            return Ok(());
        };
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO technologies (tech, flag, sector, tech_desc, tech_category, additional_notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for i in 0..table.rows.len() {
            stmt.execute(params![
                table.cell(i, "Technology"),
                table.cell(i, "Flag"),
                self.sector,
                table.cell(i, "Description"),
                table.cell(i, "Category"),
                table.cell(i, "Details"),
            ])?;
        }
        info!("technology data compiled into {}", self.database);
        Ok(())
    }

    pub fn compile_comms(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("Comms", 0, Some("Details"))? else {
            return Ok(());
        };
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO commodities (comm_name, flag, comm_desc, additional_notes)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for i in 0..table.rows.len() {
            stmt.execute(params![
                table.cell(i, "Commodity"),
                table.cell(i, "Flag"),
                table.cell(i, "Description"),
                table.cell(i, "Details"),
            ])?;
        }
        info!("commodity data compiled into {}", self.database);
        Ok(())
    }

    /// Demand is melted on period; no vintage aggregation.
    pub fn compile_demand(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("Demand", 1, Some("Technological"))? else {
            return Ok(());
        };
        let melted = melt(&table, &[]);
        let base_year = Self::base_year();
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO Demand (regions, periods, demand_comm, demand, demand_units, demand_notes,
                 reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for row in &melted.rows {
            let data_year = melted.get(row, "Data Year");
            stmt.execute(params![
                self.region,
                row.year as i64,
                melted.get(row, "Demand Commodity"),
                round_to(row.value, self.precision),
                melted.get(row, "Unit"),
                melted.get(row, "Notes"),
                melted.get(row, "Reference"),
                data_year,
                melted.get(row, "Reliability"),
                melted.get(row, "Representativeness"),
                dq_time(&data_year, base_year),
                melted.get(row, "Geographical"),
                melted.get(row, "Technological"),
            ])?;
        }
        info!("demand data compiled into {}", self.database);
        Ok(())
    }

    pub fn compile_lifetime(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("Lifetime", 1, Some("Technological"))? else {
            return Ok(());
        };
        let base_year = Self::base_year();
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO LifetimeTech (regions, tech, life, life_notes, reference, data_year,
                 dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for i in 0..table.rows.len() {
            let data_year = table.cell(i, "Data Year");
            stmt.execute(params![
                self.region,
                table.cell(i, "Technology"),
                table.cell(i, "Lifetime"),
                table.cell(i, "Notes"),
                table.cell(i, "Reference"),
                data_year,
                table.cell(i, "Reliability"),
                table.cell(i, "Representativeness"),
                dq_time(&data_year, base_year),
                table.cell(i, "Geographical"),
                table.cell(i, "Technological"),
            ])?;
        }
        info!("lifetime data compiled into {}", self.database);
        Ok(())
    }

    /// Existing capacity melts on vintage; pre-cutoff vintages sum into
    /// quinquennial buckets (capacities are additive stocks).
    pub fn compile_excap(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("ExCap", 1, Some("Technological"))? else {
            return Ok(());
        };
        let melted = aggregate_vintages(melt(&table, &[]), VINTAGE_CUTOFF, Reducer::Sum);
        let base_year = Self::base_year();
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO ExistingCapacity (regions, tech, vintage, exist_cap, exist_cap_units,
                 exist_cap_notes, reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for row in &melted.rows {
            let data_year = melted.get(row, "Data Year");
            stmt.execute(params![
                self.region,
                melted.get(row, "Technology"),
                row.year as i64,
                round_to(row.value, self.precision),
                melted.get(row, "Unit"),
                melted.get(row, "Notes"),
                melted.get(row, "Reference"),
                data_year,
                melted.get(row, "Reliability"),
                melted.get(row, "Representativeness"),
                dq_time(&data_year, base_year),
                melted.get(row, "Geographical"),
                melted.get(row, "Technological"),
            ])?;
        }
        info!("existing capacity data compiled into {}", self.database);
        Ok(())
    }

    pub fn compile_c2a(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("Cap2Act", 1, Some("Notes"))? else {
            return Ok(());
        };
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO CapacityToActivity (regions, tech, c2a, c2a_notes)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for i in 0..table.rows.len() {
            stmt.execute(params![
                self.region,
                table.cell(i, "Technology"),
                table.cell(i, "Capacity to Activity"),
                format!(
                    "[{}/{}] {}",
                    table.cell(i, "Activity Unit").text(),
                    table.cell(i, "Capacity Unit").text(),
                    table.cell(i, "Notes").text()
                ),
            ])?;
        }
        info!("c2a factors compiled into {}", self.database);
        Ok(())
    }

    /// Annual capacity factors melt on period and are written as quoted,
    /// one row per (period, tech, output commodity).  Residual `_EX`
    /// technologies get no rows beyond the last existing period plus their
    /// lifetime.  A MinAnnualCapacityFactor shadow at 99% of max gives the
    /// solver computational slack.
    pub fn compile_acf(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("CapFactor", 1, Some("Notes"))? else {
            return Ok(());
        };
        let melted = melt(&table, &[]);
        let lifetimes = self.lifetimes()?;
        let period_0 = self.last_existing_period()?;
        let conn = Connection::open(&self.database)?;
        self.write_acf(&conn, &melted, &lifetimes, period_0)?;
        info!("max/min annual capacity factors compiled into {}", self.database);
        Ok(())
    }

    fn write_acf(
        &self,
        conn: &Connection,
        melted: &Melted,
        lifetimes: &HashMap<String, f64>,
        period_0: i32,
    ) -> Result<(), Box<dyn Error>> {
        let base_year = Self::base_year();
        let mut max_stmt = conn.prepare(
            "REPLACE INTO MaxAnnualCapacityFactor (regions, periods, tech, output_comm, max_acf,
                 max_acf_notes, reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        let mut min_stmt = conn.prepare(
            "REPLACE INTO MinAnnualCapacityFactor (regions, periods, tech, output_comm, min_acf,
                 min_acf_notes, reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for row in &melted.rows {
            let tech = melted.get(row, "Technology").text();
            if tech.ends_with("_EX") {
                let lifetime = lifetimes.get(&tech).copied().unwrap_or(DEFAULT_LIFETIME);
                if period_0 as f64 + lifetime <= row.year as f64 {
                    continue;
                }
            }
            let data_year = melted.get(row, "Data Year");
            let max_acf = round_to(row.value, self.precision);
            max_stmt.execute(params![
                self.region,
                row.year as i64,
                tech,
                melted.get(row, "Output Commodity"),
                max_acf,
                melted.get(row, "Notes"),
                melted.get(row, "Reference"),
                data_year,
                1,
                1,
                dq_time(&data_year, base_year),
                1,
                1,
            ])?;
            min_stmt.execute(params![
                self.region,
                row.year as i64,
                tech,
                melted.get(row, "Output Commodity"),
                max_acf * 0.99,
                format!(
                    "99% of MaxAnnualCapacityFactor for computational slack. {}",
                    melted.get(row, "Notes").text()
                ),
                melted.get(row, "Reference"),
                data_year,
                1,
                1,
                dq_time(&data_year, base_year),
                1,
                1,
            ])?;
        }
        Ok(())
    }

    /// Efficiencies melt on vintage.  Existing vintages take the worst
    /// efficiency of their quinquennial bucket; post-cutoff vintages pass
    /// through untouched.
    pub fn compile_efficiency(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("Efficiency", 1, Some("Technological"))? else {
            return Ok(());
        };
        let melted = efficiency_rows(&table);
        let base_year = Self::base_year();
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO Efficiency (regions, input_comm, tech, vintage, output_comm, efficiency,
                 eff_notes, reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )?;
        for row in &melted.rows {
            let data_year = melted.get(row, "Data Year");
            stmt.execute(params![
                self.region,
                melted.get(row, "Input Commodity"),
                melted.get(row, "Technology"),
                row.year as i64,
                melted.get(row, "Output Commodity"),
                round_to(row.value, self.precision),
                format!(
                    "[{}] {}",
                    melted.get(row, "Unit").text(),
                    melted.get(row, "Notes").text()
                ),
                melted.get(row, "Reference"),
                data_year,
                melted.get(row, "Reliability"),
                melted.get(row, "Representativeness"),
                dq_time(&data_year, base_year),
                melted.get(row, "Geographical"),
                melted.get(row, "Technological"),
            ])?;
        }
        info!("efficiency data compiled into {}", self.database);
        Ok(())
    }

    /// Investment costs melt on vintage; the pre-conversion cost in the
    /// original currency is kept alongside for auditability.
    pub fn compile_costinvest(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("CostInvest", 1, Some("Technological"))? else {
            return Ok(());
        };
        let melted = melt(&table, &[]);
        let base_year = Self::base_year();
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO CostInvest (regions, tech, vintage, cost_invest, cost_invest_units,
                 cost_invest_notes, data_cost_invest, data_cost_year, data_curr, reference,
                 data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;
        for row in &melted.rows {
            let data_year = melted.get(row, "Data Year");
            let value = round_to(row.value, self.precision);
            let original_cost = melted
                .get(row, "Conversion Factor")
                .as_f64()
                .filter(|f| *f != 0.0)
                .map(|f| Cell::Number(round_to(row.value / f, self.precision)))
                .unwrap_or(Cell::Empty);
            stmt.execute(params![
                self.region,
                melted.get(row, "Technology"),
                row.year as i64,
                value,
                currency_units(&melted, row),
                melted.get(row, "Notes"),
                original_cost,
                melted.get(row, "Original Currency Year"),
                melted.get(row, "Original Currency"),
                melted.get(row, "Reference"),
                data_year,
                melted.get(row, "Reliability"),
                melted.get(row, "Representativeness"),
                dq_time(&data_year, base_year),
                melted.get(row, "Geographical"),
                melted.get(row, "Technological"),
            ])?;
        }
        info!("investment cost data compiled into {}", self.database);
        Ok(())
    }

    pub fn compile_costvariable(&self) -> Result<(), Box<dyn Error>> {
        self.compile_period_cost("CostVariable", "CostVariable", "cost_variable", "variable cost")
    }

    pub fn compile_costfixed(&self) -> Result<(), Box<dyn Error>> {
        self.compile_period_cost("CostFixed", "CostFixed", "cost_fixed", "fixed cost")
    }

    /// Variable and fixed cost sheets carry one row per (tech, period) with
    /// vintage-labelled year columns; rows outside the technology's lifetime
    /// window are skipped, with lifetime looked up from the Lifetime sheet
    /// and a documented default of 40 years when absent.
    fn compile_period_cost(
        &self,
        sheet: &str,
        table_name: &str,
        value_column: &str,
        label: &str,
    ) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet(sheet, 1, Some("Technological"))? else {
            return Ok(());
        };
        let melted = melt(&table, &[]);
        let lifetimes = self.lifetimes()?;
        let base_year = Self::base_year();
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(&format!(
            "REPLACE INTO {table_name} (regions, periods, tech, vintage, {value_column},
                 {value_column}_units, {value_column}_notes, data_{value_column}, data_cost_year,
                 data_curr, reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ))?;
        for row in &melted.rows {
            let vintage = row.year as f64;
            let Some(period) = melted.get(row, "Period").as_f64() else {
                continue;
            };
            let tech = melted.get(row, "Technology").text();
            let lifetime = lifetimes.get(&tech).copied().unwrap_or(DEFAULT_LIFETIME);
            if !within_lifetime(period, vintage, lifetime) {
                continue;
            }
            let data_year = melted.get(row, "Data Year");
            let original_cost = melted
                .get(row, "Conversion Factor")
                .as_f64()
                .filter(|f| *f != 0.0)
                .map(|f| Cell::Number(round_to(row.value / f, self.precision)))
                .unwrap_or(Cell::Empty);
            stmt.execute(params![
                self.region,
                period as i64,
                tech,
                row.year as i64,
                round_to(row.value, self.precision),
                currency_units(&melted, row),
                melted.get(row, "Notes"),
                original_cost,
                melted.get(row, "Original Currency Year"),
                melted.get(row, "Original Currency"),
                melted.get(row, "Reference"),
                data_year,
                melted.get(row, "Reliability"),
                melted.get(row, "Representativeness"),
                dq_time(&data_year, base_year),
                melted.get(row, "Geographical"),
                melted.get(row, "Technological"),
            ])?;
        }
        info!("{} data compiled into {}", label, self.database);
        Ok(())
    }

    /// Per-activity emission factors melt on vintage, no aggregation.
    pub fn compile_emissionact(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("EmissionAct", 1, Some("Technological"))? else {
            return Ok(());
        };
        let melted = melt(&table, &[]);
        let conn = Connection::open(&self.database)?;
        self.write_emission_activity(&conn, &melted)?;
        info!("emission activity data compiled into {}", self.database);
        Ok(())
    }

    fn write_emission_activity(
        &self,
        conn: &Connection,
        melted: &Melted,
    ) -> Result<(), Box<dyn Error>> {
        let base_year = Self::base_year();
        let mut stmt = conn.prepare(
            "REPLACE INTO EmissionActivity (regions, emis_comm, input_comm, tech, vintage,
                 output_comm, emis_act, emis_act_units, emis_act_notes, reference, data_year,
                 dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;
        for row in &melted.rows {
            let data_year = melted.get(row, "Data Year");
            let comm = melted.get(row, "Emission Commodity").text();
            let (value, units) = self.emission_value(
                &comm,
                round_to(row.value, self.precision),
                &melted.get(row, "Unit").text(),
            );
            stmt.execute(params![
                self.region,
                comm,
                melted.get(row, "Input Commodity"),
                melted.get(row, "Technology"),
                row.year as i64,
                melted.get(row, "Output Commodity"),
                value,
                units,
                melted.get(row, "Notes"),
                melted.get(row, "Reference"),
                data_year,
                melted.get(row, "Reliability"),
                melted.get(row, "Representativeness"),
                dq_time(&data_year, base_year),
                melted.get(row, "Geographical"),
                melted.get(row, "Technological"),
            ])?;
        }
        Ok(())
    }

    /// Embodied (per-capacity) emission factors; the 2021 quote is copied to
    /// every later vintage before melting.
    pub fn compile_emissionemb(&self) -> Result<(), Box<dyn Error>> {
        let Some(mut table) = self.read_sheet("EmissionEmb", 1, Some("Technological"))? else {
            return Ok(());
        };
        expand_embodied_vintages(&mut table);
        let melted = melt(&table, &[]);
        let base_year = Self::base_year();
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO EmissionEmbodied (regions, emis_comm, tech, vintage, value, units,
                 notes, reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )?;
        for row in &melted.rows {
            let data_year = melted.get(row, "Data Year");
            let comm = melted.get(row, "Emission Commodity").text();
            let (value, units) = self.emission_value(
                &comm,
                round_to(row.value, self.precision),
                &melted.get(row, "Unit").text(),
            );
            stmt.execute(params![
                self.region,
                comm,
                melted.get(row, "Technology"),
                row.year as i64,
                value,
                units,
                melted.get(row, "Notes"),
                melted.get(row, "Reference"),
                data_year,
                melted.get(row, "Reliability"),
                melted.get(row, "Representativeness"),
                dq_time(&data_year, base_year),
                melted.get(row, "Geographical"),
                melted.get(row, "Technological"),
            ])?;
        }
        info!("embodied emission data compiled into {}", self.database);
        Ok(())
    }

    /// CH4 and N2O factors arrive in kilotonnes; the other sectors quote
    /// tonnes.
    fn emission_value(&self, comm: &str, value: f64, units: &str) -> (f64, String) {
        if self.convert_emission_units && (comm == "ch4" || comm == "n2o") {
            (value * 1000.0, units.replace("kt", "t"))
        } else {
            (value, units.to_string())
        }
    }

    pub fn compile_techinputsplit(&self) -> Result<(), Box<dyn Error>> {
        let Some(table) = self.read_sheet("InputSplit", 1, Some("Technological"))? else {
            return Ok(());
        };
        let melted = melt(&table, &[]);
        let base_year = Self::base_year();
        let conn = Connection::open(&self.database)?;
        let mut stmt = conn.prepare(
            "REPLACE INTO TechInputSplit (regions, periods, input_comm, tech, ti_split,
                 ti_split_notes, reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for row in &melted.rows {
            let data_year = melted.get(row, "Data Year");
            stmt.execute(params![
                self.region,
                row.year as i64,
                melted.get(row, "Input Commodity"),
                melted.get(row, "Technology"),
                round_to(row.value, self.precision),
                melted.get(row, "Notes"),
                melted.get(row, "Reference"),
                data_year,
                melted.get(row, "Reliability"),
                melted.get(row, "Representativeness"),
                dq_time(&data_year, base_year),
                melted.get(row, "Geographical"),
                melted.get(row, "Technological"),
            ])?;
        }
        info!("tech input split data compiled into {}", self.database);
        Ok(())
    }

    /// Prune rows the compilation leaves orphaned: near-zero existing
    /// capacities and their dependents, pre-cutoff vintages without an
    /// ExistingCapacity row, and costs or capacity factors without a
    /// matching Efficiency row.
    pub fn cleanup(&self) -> Result<(), Box<dyn Error>> {
        let conn = Connection::open(&self.database)?;
        let vintage_tables = ["ExistingCapacity", "Efficiency", "CostVariable", "CostFixed"];

        let pairs = tech_year_pairs(
            &conn,
            "SELECT DISTINCT tech, vintage FROM ExistingCapacity WHERE exist_cap < ?1",
            params![self.epsilon],
        )?;
        for table in vintage_tables {
            for (tech, vintage) in &pairs {
                info!("deleted {} @ {} in {}: exist_cap < {}", tech, vintage, table, self.epsilon);
                conn.execute(
                    &format!("DELETE FROM {} WHERE tech = ?1 AND vintage = ?2", table),
                    params![tech, vintage],
                )?;
            }
        }

        // Existing vintages that survived in the dependent tables but have
        // no capacity row at all
        for table in &vintage_tables[1..] {
            let orphans = tech_year_pairs(
                &conn,
                &format!(
                    "SELECT DISTINCT tech, vintage FROM {} WHERE vintage <= ?1
                     AND (tech, vintage) NOT IN (SELECT tech, vintage FROM ExistingCapacity)",
                    table
                ),
                params![VINTAGE_CUTOFF],
            )?;
            for (tech, vintage) in &orphans {
                info!("deleted {} @ {} in {}: not in ExistingCapacity", tech, vintage, table);
                conn.execute(
                    &format!("DELETE FROM {} WHERE tech = ?1 AND vintage = ?2", table),
                    params![tech, vintage],
                )?;
            }
        }

        // Costed vintages a tech can never operate (residual techs exempt)
        for table in ["CostVariable", "CostInvest", "CostFixed"] {
            let orphans = tech_year_pairs(
                &conn,
                &format!(
                    "SELECT DISTINCT tech, vintage FROM {}
                     WHERE tech NOT LIKE '%\\_EX' ESCAPE '\\'
                       AND (tech, vintage) NOT IN (SELECT tech, vintage FROM Efficiency)",
                    table
                ),
                params![],
            )?;
            for (tech, vintage) in &orphans {
                info!("deleted {} @ {} in {}: not in Efficiency", tech, vintage, table);
                conn.execute(
                    &format!("DELETE FROM {} WHERE tech = ?1 AND vintage = ?2", table),
                    params![tech, vintage],
                )?;
            }
        }

        // Capacity-factor periods with no buildable vintage behind them
        for table in ["MaxAnnualCapacityFactor", "MinAnnualCapacityFactor"] {
            let orphans = tech_year_pairs(
                &conn,
                &format!(
                    "SELECT DISTINCT tech, periods FROM {}
                     WHERE tech NOT LIKE '%\\_EX' ESCAPE '\\'
                       AND (tech, periods) NOT IN (SELECT tech, vintage FROM Efficiency)",
                    table
                ),
                params![],
            )?;
            for (tech, period) in &orphans {
                info!("deleted {} @ {} in {}: not in Efficiency", tech, period, table);
                conn.execute(
                    &format!("DELETE FROM {} WHERE tech = ?1 AND periods = ?2", table),
                    params![tech, period],
                )?;
            }
        }

        info!("cleanup of {} complete", self.database);
        Ok(())
    }

    /// Full compilation in dependency order.
    pub fn compile_all(&self) -> Result<(), Box<dyn Error>> {
        self.instantiate_database()?;
        self.insert_template()?;

        self.compile_references()?;
        self.compile_techs()?;
        self.compile_comms()?;
        self.compile_demand()?;
        self.compile_lifetime()?;
        self.compile_excap()?;
        self.compile_c2a()?;
        self.compile_acf()?;
        self.compile_efficiency()?;
        self.compile_costinvest()?;
        self.compile_costvariable()?;
        self.compile_costfixed()?;
        self.compile_emissionact()?;
        if self.create_emission_embodied {
            self.compile_emissionemb()?;
        }
        self.compile_techinputsplit()?;

        self.cleanup()?;

        info!(
            "all parameter data from {} compiled into {}",
            self.spreadsheet, self.database
        );
        Ok(())
    }
}

/// True when `period` falls inside [vintage, vintage + lifetime).
pub fn within_lifetime(period: f64, vintage: f64, lifetime: f64) -> bool {
    period >= vintage && period < vintage + lifetime
}

/// Existing vintages take the worst efficiency of their quinquennial bucket;
/// post-cutoff vintages pass through untouched.
fn efficiency_rows(table: &WideTable) -> Melted {
    aggregate_vintages(melt(table, &[]), VINTAGE_CUTOFF, Reducer::Min)
}

fn expand_embodied_vintages(table: &mut WideTable) {
    let Some(base) = table.columns.iter().position(|c| c == "2021") else {
        return;
    };
    for year in EMBODIED_VINTAGES {
        match table.columns.iter().position(|c| c == year) {
            Some(i) => {
                for row in &mut table.rows {
                    row[i] = row[base].clone();
                }
            }
            None => {
                table.columns.push(year.to_string());
                for row in &mut table.rows {
                    let cell = row[base].clone();
                    row.push(cell);
                }
            }
        }
    }
}

fn currency_units(melted: &Melted, row: &MeltedRow) -> String {
    let year = melted
        .get(row, "Currency Year")
        .as_f64()
        .map(|y| (y as i64).to_string())
        .unwrap_or_default();
    format!(
        "{} {} ({})",
        year,
        melted.get(row, "Currency").text(),
        melted.get(row, "Unit").text()
    )
}

fn tech_year_pairs(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(sql)?;
    let pairs = stmt
        .query_map(params, |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(pairs)
}
