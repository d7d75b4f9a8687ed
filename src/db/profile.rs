use std::error::Error;
use std::fs::File;

use jiff::tz::TimeZone;
use jiff::{RoundMode, Timestamp, Unit, Zoned, ZonedRound};
use log::info;
use rusqlite::params;
use serde::Deserialize;

use crate::db::schema;
use crate::errors::EtlError;
use crate::sheet::melt::round_to;
use crate::sheet::table;

/// How an hourly profile is normalized before it lands in the database.
/// Demand distributions must sum to one over the year; capacity factors are
/// expressed relative to the annual peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    SumToOne,
    MaxToOne,
}

/// Provenance attached to every compiled profile row.  The heavy text
/// fields only appear on the first hour of each day to keep the database
/// small.
#[derive(Debug, Clone)]
pub struct ProfileMetadata {
    pub region: String,
    /// Demand commodity or tech the profile applies to.
    pub name: String,
    pub notes: String,
    pub reference: String,
    pub data_year: i32,
    pub dq_rel: i32,
    pub dq_comp: i32,
    pub dq_time: i32,
    pub dq_geog: i32,
    pub dq_tech: i32,
}

/// One CSV line of the simulation output: UTC timestamp, then the load.
#[derive(Debug, Deserialize)]
struct ProfileRecord(String, Option<f64>);

/// Simulated EV charging load published as a UTC CSV time series, compiled
/// into either DemandSpecificDistribution or CapacityFactorTech.
pub struct ChargingProfileArchive {
    /// RAMP-mobility result file: timestamp index plus one load column.
    pub csv_path: String,
    pub database: String,
    /// IANA zone the model operates in, e.g. "America/Toronto".
    pub time_zone: String,
    pub weather_year: i16,
    pub precision: u32,
}

impl ChargingProfileArchive {
    /// One labelled hour of the profile in the model's time zone.
    pub fn hourly_profile(&self) -> Result<Vec<(Zoned, f64)>, Box<dyn Error>> {
        let tz = TimeZone::get(&self.time_zone)?;
        let mut rdr = csv::Reader::from_reader(File::open(&self.csv_path)?);

        // Sub-hourly samples averaged into the hour they fall in
        let mut hours: std::collections::BTreeMap<Timestamp, (Zoned, Vec<f64>)> =
            std::collections::BTreeMap::new();
        for record in rdr.deserialize() {
            let ProfileRecord(stamp, value) = record?;
            let stamp: Timestamp = stamp
                .trim()
                .parse()
                .map_err(|e| format!("bad timestamp in {}: {}", self.csv_path, e))?;
            let Some(value) = value else {
                continue;
            };
            let zoned = stamp.to_zoned(tz.clone());
            if zoned.year() != self.weather_year {
                continue;
            }
            let hour = zoned.round(
                ZonedRound::new()
                    .smallest(Unit::Hour)
                    .mode(RoundMode::Trunc),
            )?;
            hours
                .entry(hour.timestamp())
                .or_insert_with(|| (hour, Vec::new()))
                .1
                .push(value);
        }

        Ok(hours
            .into_values()
            .map(|(hour, samples)| {
                let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                (hour, mean)
            })
            .collect())
    }

    /// Whole-table rebuild of DemandSpecificDistribution, one copy of the
    /// sum-to-one profile per affected demand.
    pub fn compile_dsd(&self, demands: &[ProfileMetadata]) -> Result<(), Box<dyn Error>> {
        let profile = self.hourly_profile()?;
        let values = normalize(
            &profile.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
            Normalization::SumToOne,
        )?;

        let conn = schema::open_existing(&self.database)?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM DemandSpecificDistribution", [])?;
        let mut stmt = tx.prepare(
            "INSERT INTO DemandSpecificDistribution
                (regions, season_name, time_of_day_name, demand_name, dsd, dsd_notes,
                 reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for meta in demands {
            for ((hour, _), value) in profile.iter().zip(&values) {
                let tod = hour_label(hour);
                let (notes, reference) = first_hour_only(&tod, meta);
                stmt.execute(params![
                    meta.region,
                    season_label(hour),
                    tod,
                    meta.name,
                    round_to(*value, self.precision),
                    notes,
                    reference,
                    meta.data_year,
                    meta.dq_rel,
                    meta.dq_comp,
                    meta.dq_time,
                    meta.dq_geog,
                    meta.dq_tech,
                ])?;
            }
        }
        drop(stmt);
        tx.commit()?;
        info!(
            "compiled {} demand distributions x {} hours into {}",
            demands.len(),
            values.len(),
            self.database
        );
        Ok(())
    }

    /// Whole-table rebuild of CapacityFactorTech with the profile scaled to
    /// its annual peak.
    pub fn compile_cft(&self, meta: &ProfileMetadata) -> Result<(), Box<dyn Error>> {
        let profile = self.hourly_profile()?;
        let values = normalize(
            &profile.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
            Normalization::MaxToOne,
        )?;

        let conn = schema::open_existing(&self.database)?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM CapacityFactorTech", [])?;
        let mut stmt = tx.prepare(
            "INSERT INTO CapacityFactorTech
                (regions, season_name, time_of_day_name, tech, cf_tech, cf_tech_notes,
                 reference, data_year, dq_rel, dq_comp, dq_time, dq_geog, dq_tech)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for ((hour, _), value) in profile.iter().zip(&values) {
            let tod = hour_label(hour);
            let (notes, reference) = first_hour_only(&tod, meta);
            stmt.execute(params![
                meta.region,
                season_label(hour),
                tod,
                meta.name,
                round_to(*value, self.precision),
                notes,
                reference,
                meta.data_year,
                meta.dq_rel,
                meta.dq_comp,
                meta.dq_time,
                meta.dq_geog,
                meta.dq_tech,
            ])?;
        }
        drop(stmt);
        tx.commit()?;
        info!(
            "compiled capacity factors for {} into {}",
            meta.name, self.database
        );
        Ok(())
    }
}

pub fn normalize(values: &[f64], mode: Normalization) -> Result<Vec<f64>, EtlError> {
    let divisor = match mode {
        Normalization::SumToOne => values.iter().sum::<f64>(),
        Normalization::MaxToOne => values.iter().cloned().fold(f64::MIN, f64::max),
    };
    if values.is_empty() || divisor == 0.0 {
        return Err(EtlError::ZeroDivisor("charging profile".to_string()));
    }
    Ok(values.iter().map(|v| v / divisor).collect())
}

/// Day-of-year season label, "D001" through "D365".
pub fn season_label(hour: &Zoned) -> String {
    format!("D{:03}", hour.date().day_of_year())
}

/// Time-of-day label, "H01" through "H24".
pub fn hour_label(hour: &Zoned) -> String {
    format!("H{:02}", hour.hour() + 1)
}

fn first_hour_only<'a>(tod: &str, meta: &'a ProfileMetadata) -> (&'a str, &'a str) {
    if tod == "H01" {
        (meta.notes.as_str(), meta.reference.as_str())
    } else {
        ("", "")
    }
}

/// Metadata rows from the DemandDist sheet of the spreadsheet database: one
/// per demand that shares the charging profile.  `None` when the workbook
/// carries no such sheet.
pub fn demand_metadata(
    spreadsheet: &str,
    count: usize,
) -> Result<Option<Vec<ProfileMetadata>>, Box<dyn Error>> {
    let Some(sheet) = table::read_sheet(spreadsheet, "DemandDist", 1, Some("Technological"))?
    else {
        return Ok(None);
    };
    let n = count.min(sheet.rows.len());
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(ProfileMetadata {
            region: sheet.cell(i, "Region").text(),
            name: sheet.cell(i, "Target Demand").text(),
            notes: sheet.cell(i, "Notes").text(),
            reference: sheet.cell(i, "Reference").text(),
            data_year: sheet.cell(i, "Data Year").as_f64().unwrap_or(0.0) as i32,
            dq_rel: sheet.cell(i, "Reliability").as_f64().unwrap_or(0.0) as i32,
            dq_comp: sheet.cell(i, "Representativeness").as_f64().unwrap_or(0.0) as i32,
            dq_time: sheet.cell(i, "Temporal").as_f64().unwrap_or(0.0) as i32,
            dq_geog: sheet.cell(i, "Geographical").as_f64().unwrap_or(0.0) as i32,
            dq_tech: sheet.cell(i, "Technological").as_f64().unwrap_or(0.0) as i32,
        });
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::io::Write;
    use tempfile::TempDir;

    fn meta(name: &str) -> ProfileMetadata {
        ProfileMetadata {
            region: "ON".to_string(),
            name: name.to_string(),
            notes: "hourly BEV charging variation".to_string(),
            reference: "TTS 2016".to_string(),
            data_year: 2018,
            dq_rel: 1,
            dq_comp: 2,
            dq_time: 1,
            dq_geog: 1,
            dq_tech: 1,
        }
    }

    fn write_csv(dir: &TempDir) -> String {
        // Half-hourly UTC samples; 05:00Z is midnight in Toronto (EST), so
        // the first local hour of 2018 averages 2.0 and 4.0
        let path = dir.path().join("cp.csv").to_str().unwrap().to_string();
        let mut f = File::create(&path).unwrap();
        writeln!(f, ",Charging Profile").unwrap();
        writeln!(f, "2018-01-01 04:30:00+00:00,9.0").unwrap(); // 2017 locally
        writeln!(f, "2018-01-01 05:00:00+00:00,2.0").unwrap();
        writeln!(f, "2018-01-01 05:30:00+00:00,4.0").unwrap();
        writeln!(f, "2018-01-01 06:00:00+00:00,1.0").unwrap();
        writeln!(f, "2018-01-01 07:00:00+00:00,5.0").unwrap();
        path
    }

    fn archive(dir: &TempDir) -> ChargingProfileArchive {
        let database = dir.path().join("p.sqlite").to_str().unwrap().to_string();
        let conn = Connection::open(&database).unwrap();
        conn.execute_batch(
            "CREATE TABLE DemandSpecificDistribution (regions TEXT, season_name TEXT,
                 time_of_day_name TEXT, demand_name TEXT, dsd REAL, dsd_notes TEXT,
                 reference TEXT, data_year INTEGER, dq_rel INTEGER, dq_comp INTEGER,
                 dq_time INTEGER, dq_geog INTEGER, dq_tech INTEGER);
             CREATE TABLE CapacityFactorTech (regions TEXT, season_name TEXT,
                 time_of_day_name TEXT, tech TEXT, cf_tech REAL, cf_tech_notes TEXT,
                 reference TEXT, data_year INTEGER, dq_rel INTEGER, dq_comp INTEGER,
                 dq_time INTEGER, dq_geog INTEGER, dq_tech INTEGER);",
        )
        .unwrap();
        ChargingProfileArchive {
            csv_path: write_csv(dir),
            database,
            time_zone: "America/Toronto".to_string(),
            weather_year: 2018,
            precision: 10,
        }
    }

    #[test]
    fn hourly_profile_converts_filters_and_averages() {
        let dir = TempDir::new().unwrap();
        let archive = archive(&dir);
        let profile = archive.hourly_profile().unwrap();
        // the 04:30Z sample belongs to local 2017 and is dropped
        assert_eq!(profile.len(), 3);
        assert_eq!(profile[0].0.hour(), 0);
        assert_eq!(profile[0].1, 3.0);
        assert_eq!(profile[1].1, 1.0);
        assert_eq!(profile[2].1, 5.0);
        assert_eq!(season_label(&profile[0].0), "D001");
        assert_eq!(hour_label(&profile[0].0), "H01");
        assert_eq!(hour_label(&profile[2].0), "H03");
    }

    #[test]
    fn normalization_modes() {
        assert_eq!(
            normalize(&[1.0, 3.0], Normalization::SumToOne).unwrap(),
            vec![0.25, 0.75]
        );
        assert_eq!(
            normalize(&[1.0, 4.0], Normalization::MaxToOne).unwrap(),
            vec![0.25, 1.0]
        );
        assert!(normalize(&[0.0, 0.0], Normalization::MaxToOne).is_err());
        assert!(normalize(&[], Normalization::SumToOne).is_err());
    }

    #[test]
    fn dsd_sums_to_one_per_demand() {
        let dir = TempDir::new().unwrap();
        let archive = archive(&dir);
        archive
            .compile_dsd(&[meta("T_D_LDV_C"), meta("T_D_LDV_LT")])
            .unwrap();

        let conn = Connection::open(&archive.database).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM DemandSpecificDistribution", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(n, 6);
        let total: f64 = conn
            .query_row(
                "SELECT SUM(dsd) FROM DemandSpecificDistribution WHERE demand_name = 'T_D_LDV_C'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!((total - 1.0).abs() < 1e-9);
        // provenance only on the first hour of the day
        let noted: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM DemandSpecificDistribution WHERE dsd_notes != ''",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(noted, 2);
    }

    #[test]
    fn cft_peaks_at_one() {
        let dir = TempDir::new().unwrap();
        let archive = archive(&dir);
        archive.compile_cft(&meta("T_LDV_BEV_CHRG")).unwrap();

        let conn = Connection::open(&archive.database).unwrap();
        let peak: f64 = conn
            .query_row("SELECT MAX(cf_tech) FROM CapacityFactorTech", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(peak, 1.0);
        let tod: String = conn
            .query_row(
                "SELECT time_of_day_name FROM CapacityFactorTech WHERE cf_tech = 1.0",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tod, "H03");
    }
}
