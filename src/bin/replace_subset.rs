use std::error::Error;

use canoe_etl::db::reconcile::SubsetReplacement;
use clap::Parser;
use log::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Database to update in place
    #[arg(short, long)]
    target: String,

    /// Database carrying the new rows
    #[arg(short, long)]
    source: String,

    /// Database whose techs/commodities mark what to delete first.
    /// Omit it to append without deleting anything.
    #[arg(long)]
    subset: Option<String>,

    /// Audit log file
    #[arg(long, default_value = "replacement_log.txt")]
    log: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let job = SubsetReplacement::new(&args.target, &args.source, args.subset.as_deref(), &args.log);
    job.run()?;

    info!("reconciled {} into {}", args.source, args.target);
    Ok(())
}
