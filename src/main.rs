use anyhow::{bail, Context};
use clap::Parser;
use log::{error, info, warn};
use noise_xcorr::config::{CcOverrides, CcParameters, FftMetadata};
use noise_xcorr::constants::*;
use noise_xcorr::controller::{run_days, DayContext};
use noise_xcorr::error::{CcError, Result};
use noise_xcorr::utils::balancer::Balancer;
use noise_xcorr::utils::dates::day_list;
use noise_xcorr::utils::loader::{discover_station_files, ChunkPlan, DataLayout};
use std::path::PathBuf;
use sysinfo::{System, SystemExt};

/// Cross-correlates the daily noise spectra of every station pair.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Project root holding fft_metadata.json; correlations go to <root>/CCF
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// First day (YYYY_MM_DD), defaults to the spectra stage's
    #[arg(long)]
    start_date: Option<String>,

    /// Day after the last one (YYYY_MM_DD), defaults to the spectra stage's
    #[arg(long)]
    end_date: Option<String>,

    /// Also correlate every station with itself
    #[arg(long)]
    auto_corr: bool,

    /// Keep sub-stacks instead of one average per chunk
    #[arg(long)]
    substack: bool,

    /// Sub-stack length as a multiple of the segment length
    #[arg(long, default_value_t = DEFAULT_SUBSTACK_MULTIPLE)]
    substack_mult: usize,

    /// Half-width of the spectral smoothing window, in bins
    #[arg(long, default_value_t = DEFAULT_SMOOTHSPECT_N)]
    smooth_n: usize,

    /// Segments with max amplitude above this many std are dropped
    #[arg(long, default_value_t = DEFAULT_MAX_OVER_STD)]
    max_over_std: f32,

    /// Stored with the run parameters
    #[arg(long, default_value_t = DEFAULT_MAX_KURTOSIS)]
    max_kurtosis: f32,

    /// Memory budget per worker, GB
    #[arg(long, default_value_t = DEFAULT_MAX_MEM)]
    max_mem: f64,

    /// Rows peaking above this multiple of the median are dropped
    #[arg(long, default_value_t = DEFAULT_AMPMAX_FACTOR)]
    ampmax_factor: f64,

    /// Log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> CcOverrides {
        CcOverrides {
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
            auto_corr: self.auto_corr,
            substack: self.substack,
            substack_multiple: self.substack_mult,
            smoothspect_n: self.smooth_n,
            max_over_std: self.max_over_std,
            max_kurtosis: self.max_kurtosis,
            max_mem: self.max_mem,
            ampmax_factor: self.ampmax_factor,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    match &args.log_file {
        Some(path) => simple_logging::log_to_file(path, log::LevelFilter::Info)
            .with_context(|| format!("cannot log to {}", path.display()))?,
        None => env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .init(),
    }

    // Start Balancer
    let balancer = Balancer::new()?;

    // Every worker must agree on the setup before any day runs
    let setup = setup(&args, &balancer);
    if let Err(err) = &setup {
        error!("rank {}: {err}", balancer.rank);
    }
    let Setup {
        params,
        files,
        layout,
    } = balancer.all_ok(setup)?;
    check_memory_budget(&params);

    let ctx = DayContext::new(&params, &layout, &files);
    log_plan(&ctx.plan);

    let days = day_list(&params.start_date, &params.end_date, params.inc_days)?;
    let local_days = balancer.local_set(&days);
    info!(
        "rank {}: {} of {} days",
        balancer.rank,
        local_days.len(),
        days.len()
    );

    let summary = run_days(&local_days, &ctx);
    info!(
        "rank {}: {} days done, {} without data, {} failed",
        balancer.rank,
        summary.completed.len(),
        summary.unavailable.len(),
        summary.failed.len()
    );

    balancer.barrier();
    if balancer.any_failed(summary.has_failures()) {
        bail!("some days failed, see the log for details");
    }
    if balancer.is_root() {
        info!("step 2 finished for {} days", days.len());
    }
    Ok(())
}

/// Parameters and input layout shared by every day.
struct Setup {
    params: CcParameters,
    files: Vec<PathBuf>,
    layout: DataLayout,
}

fn setup(args: &Args, balancer: &Balancer) -> Result<Setup> {
    let fft = FftMetadata::read(&args.root)?;
    let params = CcParameters::resolve(&args.root, &fft, &args.overrides())?;

    // Only the root records parameters and creates the output directory
    if balancer.is_root() {
        std::fs::create_dir_all(&params.ccf_dir)
            .map_err(|err| CcError::io(&params.ccf_dir, err))?;
        params.write(&args.root)?;
        info!(
            "{} correlation, maxlag {} s, substack {}, writing to {}",
            params.cc_method,
            params.maxlag,
            params.substack,
            params.ccf_dir.display()
        );
    }

    let files = discover_station_files(&params.fft_dir)?;
    let layout = DataLayout::detect(&files)?;
    Ok(Setup {
        params,
        files,
        layout,
    })
}

fn check_memory_budget(params: &CcParameters) {
    let mut sys = System::new_all();
    sys.refresh_memory();
    let available = sys.available_memory() as f64;
    if params.max_mem_bytes() > available {
        warn!(
            "memory budget of {:.2} GB exceeds the {:.2} GB available",
            params.max_mem,
            available / BYTES_PER_GB
        );
    }
}

fn log_plan(plan: &ChunkPlan) {
    info!(
        "{:.3} GB of spectra per day, {} load(s) of {} segments",
        plan.total_bytes / BYTES_PER_GB,
        plan.num_load,
        plan.nseg_per_load
    );
}
