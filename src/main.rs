use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use ldefid_core::{
    config::{LdeConfig, LoggingConfig},
    correlate::{correlate, Basis, ParityClass},
    event::EventTable,
    extract,
    fidelity::{corrected_histogram, CorrectedHistogram, CorrectionMode},
    filter::{filter_gate_phase, filter_times, FilterParameters},
    readout::ConfusionMatrixCorrector,
    sim::RunSimulator,
    store,
    sweep::{BasisTables, SweepDriver, SweepGrid, SweepResult, SweepSettings},
    util,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "ldefid",
    version = util::VERSION,
    about = "Entanglement fidelity analysis for heralded two-node runs (offline)"
)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

/// Which archive pair to read or write.
#[derive(Args, Debug, Clone)]
struct VariantArgs {
    /// Correction mode (default, bestguess, raw, lowerbound, rawbestguess, rawlowerbound).
    #[arg(long)]
    mode: Option<CorrectionMode>,
    /// Use the previous dt value as floor.
    #[arg(long)]
    dt_slices: bool,
    #[arg(long)]
    dt_min: Option<i64>,
}

/// Folder holding the per-basis event tables.
#[derive(Args, Debug, Clone, Default)]
struct EventsDirArg {
    /// Defaults to `<output_dir>/events`.
    #[arg(long)]
    events_dir: Option<PathBuf>,
}

impl EventsDirArg {
    fn resolve(&self, cfg: &LdeConfig) -> PathBuf {
        self.events_dir
            .clone()
            .unwrap_or_else(|| cfg.paths.output_dir.join("events"))
    }
}

/// Folder holding the archive pairs.
#[derive(Args, Debug, Clone, Default)]
struct ArchiveDirArg {
    /// Defaults to `output_dir` from the config.
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

impl ArchiveDirArg {
    fn resolve(&self, cfg: &LdeConfig) -> PathBuf {
        self.out_dir
            .clone()
            .unwrap_or_else(|| cfg.paths.output_dir.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract heralding events of every basis folder into event tables.
    Extract {
        /// Folder holding ZZ/, XX/ and XmX/ run folders.
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[command(flatten)]
        events: EventsDirArg,
    },

    /// Print raw and corrected histograms of one basis for one filter setting.
    Correlate {
        #[arg(long)]
        basis: Basis,
        #[arg(long)]
        dt_max: i64,
        #[arg(long, default_value_t = 0)]
        dt_min: i64,
        #[arg(long)]
        win1: Option<i64>,
        #[arg(long)]
        win2: Option<i64>,
        #[arg(long)]
        mode: Option<CorrectionMode>,
        #[command(flatten)]
        events: EventsDirArg,
    },

    /// Run the parameter sweep and write the archive pair.
    Sweep {
        #[command(flatten)]
        variant: VariantArgs,
        /// Evaluate grid points on all cores.
        #[arg(long)]
        parallel: bool,
        #[command(flatten)]
        events: EventsDirArg,
        #[command(flatten)]
        archives: ArchiveDirArg,
    },

    /// Report the grid point with the highest fidelity.
    Best {
        #[arg(long)]
        parity: ParityClass,
        /// Only consider points with (F - 1/2) / uF at or above this value.
        #[arg(long)]
        min_sigma: Option<f64>,
        #[command(flatten)]
        variant: VariantArgs,
        #[command(flatten)]
        archives: ArchiveDirArg,
    },

    /// Summarize the grid point nearest to the given values.
    Point {
        #[arg(long)]
        parity: ParityClass,
        #[arg(long)]
        dt: i64,
        #[arg(long)]
        win1: i64,
        #[arg(long)]
        win2: i64,
        #[command(flatten)]
        variant: VariantArgs,
        #[command(flatten)]
        archives: ArchiveDirArg,
    },

    /// Write a simulated dataset (detection and outcome files per basis).
    Simulate {
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 2)]
        runs: u32,
        #[arg(long, default_value_t = 2000)]
        shots: usize,
        #[arg(long, default_value_t = 0.9)]
        visibility: f64,
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },

    /// Print version information.
    Version,
}

#[derive(Debug, Serialize)]
struct ParityReport {
    parity: ParityClass,
    raw: [u64; 4],
    corrected: Option<CorrectedHistogram>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = LdeConfig::load(cli.config.as_deref()).context("load config")?;
    cfg.apply_env().context("apply environment overrides")?;
    cfg.readout.validate().context("readout parameters")?;

    init_logging(&cfg.logging)?;

    match cli.cmd {
        Commands::Extract { data_dir, events } => {
            let data_dir = data_dir.unwrap_or(cfg.paths.data_dir.clone());
            let events_dir = events.resolve(&cfg);
            util::validate_path(&data_dir, "data dir")?;
            let data_dir = util::canonicalize_if_exists(&data_dir, "data dir")?;
            for basis in Basis::ALL {
                let folder = data_dir.join(basis.label());
                let table = extract::extract_folder(&folder, &cfg.extraction)
                    .with_context(|| format!("extract {basis} events"))?;
                let path = events_dir.join(format!("{}.csv", basis.label()));
                table.write_csv(&path).context("write event table")?;
            }
        }

        Commands::Correlate {
            basis,
            dt_max,
            dt_min,
            win1,
            win2,
            mode,
            events,
        } => {
            let mode = mode.unwrap_or(cfg.sweep.mode);
            let params = FilterParameters {
                channel_starts: [
                    cfg.sweep.ch0_start,
                    cfg.sweep.ch0_start + cfg.sweep.ch1_offset,
                ],
                window1: win1.unwrap_or(FilterParameters::default().window1),
                window2: win2.unwrap_or(FilterParameters::default().window2),
                dt_min,
                dt_max,
            };
            params.validate().context("filter parameters")?;

            let table = load_table(&events.resolve(&cfg), basis)?;
            let filtered = filter_times(&filter_gate_phase(&table), &params);
            let (c, ok) = correlate(&filtered);
            if !ok {
                warn!(%basis, "a parity class has no counts; correction skipped");
            }

            let fids = cfg.readout.regular();
            let mut reports = Vec::new();
            for parity in ParityClass::ALL {
                let hist = c.get(parity);
                let corrected = if hist.is_empty() {
                    None
                } else {
                    Some(
                        corrected_histogram(hist, mode, &ConfusionMatrixCorrector, &fids)
                            .with_context(|| format!("correct {parity} histogram"))?,
                    )
                };
                reports.push(ParityReport {
                    parity,
                    raw: hist.counts(),
                    corrected,
                });
            }
            print_json(&reports)?;
        }

        Commands::Sweep {
            variant,
            parallel,
            events,
            archives,
        } => {
            let out_dir = archives.resolve(&cfg);
            let events_dir = events.resolve(&cfg);
            util::validate_path(&out_dir, "output dir")?;

            let mut settings = SweepSettings::from_config(&cfg.sweep);
            apply_variant(&mut settings, &variant);
            let grid = SweepGrid::from_config(&cfg.sweep).context("sweep axes")?;

            let zz = load_table(&events_dir, Basis::ZZ)?;
            let xx = load_table(&events_dir, Basis::XX)?;
            let xmx = load_table(&events_dir, Basis::XmX)?;
            let tables = BasisTables::gate_filtered(&zz, &xx, &xmx);

            let result = SweepDriver::new(grid, settings, cfg.readout.clone())
                .parallel(parallel || cfg.sweep.parallel)
                .run(&tables)
                .context("run sweep")?;
            let suffix = store::save(&result, &out_dir).context("save archives")?;
            info!(out_dir = %out_dir.display(), %suffix, "sweep complete");
        }

        Commands::Best {
            parity,
            min_sigma,
            variant,
            archives,
        } => {
            let result = load_result(&cfg, &variant, &archives.resolve(&cfg))?;
            match result.best_point(parity, min_sigma) {
                Some(best) => print_json(&best)?,
                None => anyhow::bail!("no evaluated grid point satisfies the constraints"),
            }
        }

        Commands::Point {
            parity,
            dt,
            win1,
            win2,
            variant,
            archives,
        } => {
            let result = load_result(&cfg, &variant, &archives.resolve(&cfg))?;
            let summary = result
                .point_summary(parity, dt, win1, win2)
                .context("empty sweep grid")?;
            if !summary.evaluated {
                warn!(index = ?summary.index, "grid point was not evaluated");
            }
            print_json(&summary)?;
        }

        Commands::Simulate {
            out_dir,
            runs,
            shots,
            visibility,
            seed,
        } => {
            let out_dir = out_dir.unwrap_or(cfg.paths.data_dir.clone());
            util::validate_path(&out_dir, "output dir")?;
            let mut sim = RunSimulator::new(seed);
            sim.shots = shots;
            sim.visibility = visibility;
            sim.ch0_start = cfg.sweep.ch0_start;
            sim.ch1_offset = cfg.sweep.ch1_offset;
            sim.write_dataset(&out_dir, &cfg.extraction, runs)
                .context("write simulated dataset")?;
        }

        Commands::Version => {
            println!("{}", util::version_string());
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn apply_variant(settings: &mut SweepSettings, variant: &VariantArgs) {
    if let Some(mode) = variant.mode {
        settings.mode = mode;
    }
    if variant.dt_slices {
        settings.dt_slices = true;
    }
    if let Some(dt_min) = variant.dt_min {
        settings.dt_min = dt_min;
    }
}

fn load_result(cfg: &LdeConfig, variant: &VariantArgs, dir: &Path) -> Result<SweepResult> {
    let mut settings = SweepSettings::from_config(&cfg.sweep);
    apply_variant(&mut settings, variant);
    store::load(
        dir,
        settings.mode,
        settings.dt_slices,
        settings.dt_min,
    )
    .context("load sweep archives")
}

fn load_table(dir: &Path, basis: Basis) -> Result<EventTable> {
    let path = dir.join(format!("{}.csv", basis.label()));
    EventTable::read_csv(&path).with_context(|| format!("load {basis} events"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_stdout {
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).init();
    } else if !cfg.json_log_file.is_empty() {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .with_context(|| format!("open json log file {}", cfg.json_log_file))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(file_layer).with(console_layer).init();
    } else {
        // human-readable on stderr; stdout carries command output
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(console_layer).init();
    }
    Ok(())
}
