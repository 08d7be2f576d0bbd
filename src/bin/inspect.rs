//! Lists the correlation functions held in day containers.
use clap::Parser;
use itertools::Itertools;
use noise_xcorr::utils::io::read_container;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Lists the records of one or more day containers")]
struct Args {
    /// Day containers (`CCF/YYYY_MM_DD.ccf`)
    #[arg(required = true)]
    containers: Vec<PathBuf>,

    /// Also print per-row start times and segment counts
    #[arg(long)]
    rows: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .init();
    let args = Args::parse();

    for path in &args.containers {
        let records = read_container(path)?;
        println!("{}: {} records", path.display(), records.len());

        // Group by source channel, records come back in key order
        for (data_type, group) in &records.iter().group_by(|record| record.data_type.clone()) {
            println!("  {data_type}");
            for record in group {
                let p = &record.parameters;
                println!(
                    "    {:<20} {} x {} ({}, dt {} s, maxlag {} s) segments {}",
                    record.path,
                    record.data.nrows(),
                    record.data.ncols(),
                    p.method,
                    p.dt,
                    p.maxlag,
                    p.ngood.iter().sum::<usize>()
                );
                if args.rows {
                    for (time, count) in p.time.iter().zip(&p.ngood) {
                        println!("      t = {time:.1} count = {count}");
                    }
                }
            }
        }
    }

    Ok(())
}
