use std::error::Error;
use std::fs;

use canoe_etl::db::prod_db::ProdDb;
use clap::Parser;
use log::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Baseline database to split
    #[arg(short, long)]
    input: String,

    /// Where the split copy is written
    #[arg(short, long)]
    output: String,
}

/// Copy the baseline database and split its vehicle techs into lifetime
/// percentile classes.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    fs::copy(&args.input, &args.output)?;
    info!("copied {} to {}", args.input, args.output);

    let mut job = ProdDb::lifetime_split_on();
    job.database = args.output.clone();
    job.run()?;

    info!("created {}", args.output);
    Ok(())
}
