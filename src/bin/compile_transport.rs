use std::error::Error;

use canoe_etl::db::profile::{demand_metadata, ProfileMetadata};
use canoe_etl::db::prod_db::ProdDb;
use clap::Parser;
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Represent the LDV charging profile as a demand distribution instead
    /// of a capacity factor
    #[arg(long, default_value_t = false)]
    charging_dsd: bool,

    /// Number of demands that share the charging distribution
    #[arg(long, default_value_t = 3)]
    n_demands: usize,
}

/// Rebuild the transport sector database from the spreadsheet database.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let archive = ProdDb::transport_on();
    archive.compile_all()?;

    let charging = ProdDb::ldv_charging_on();
    if args.charging_dsd {
        match demand_metadata(&archive.spreadsheet, args.n_demands)? {
            Some(demands) => charging.compile_dsd(&demands)?,
            None => warn!("no DemandDist sheet in {}, skipping", archive.spreadsheet),
        }
    } else {
        let meta = ProfileMetadata {
            region: "ON".to_string(),
            name: "T_LDV_BEV_CHRG".to_string(),
            notes: "Hourly variation of electricity demand from light-duty BEV charging, \
                    simulated with RAMP-mobility from TTS 2016 travel survey data and \
                    population-weighted temperature profiles."
                .to_string(),
            reference: "Data Management Group. (2018). Transportation Tomorrow Survey (TTS) \
                        2016. Department of Civil Engineering, University of Toronto. \
                        https://dmg.utoronto.ca/"
                .to_string(),
            data_year: 2018,
            dq_rel: 1,
            dq_comp: 2,
            dq_time: 1,
            dq_geog: 1,
            dq_tech: 1,
        };
        charging.compile_cft(&meta)?;
    }

    info!("transport compilation finished");
    Ok(())
}
