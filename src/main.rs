//! CLI Entry Point for beamline-daq
//!
//! Provides command-line access to the acquisition controller, running
//! against the FPGA simulator:
//! - `expand`: print the scan points of a collection order
//! - `collect`: collect the missing points of a dataset
//! - `erase`: remove every file and logfile line of a dataset
//! - `status`: report how much of a dataset is collected
//!
//! # Usage
//!
//! ```bash
//! beamline-daq expand --order "Delay=[-10us,0,10us],Laser_on,Repeat=2"
//! beamline-daq collect --directory /data/lysozyme --basename lyso --order "Laser_on,Repeat=4"
//! ```
//!
//! Dataset options not given on the command line come from the settings
//! store, and the merged result is written back.

use anyhow::{Context, Result};
use beamline_daq::acquisition::{
    plan_passes, wait_axes_changing_at, AcquisitionController, CollectionOutcome, DetectorSelection,
};
use beamline_daq::beamline::Beamline;
use beamline_daq::config::{ControllerConfig, DEFAULT_CONFIG_FILE};
use beamline_daq::logging;
use beamline_daq::settings::{SettingsStore, SettingsWatcher};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "beamline-daq")]
#[command(about = "Timing-system driven data acquisition for time-resolved beamline experiments", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the expanded scan
    Expand {
        #[command(flatten)]
        dataset: DatasetArgs,
    },

    /// Collect the missing points of a dataset
    Collect {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Sequence mode (a `methods` entry)
        #[arg(long)]
        mode: Option<String>,

        /// Directory of configuration tables to snapshot with the dataset
        #[arg(long)]
        tables: Option<PathBuf>,

        /// Stop at the end of the current block of this axis
        #[arg(long)]
        finish_series: Option<String>,
    },

    /// Erase a dataset
    Erase {
        #[command(flatten)]
        dataset: DatasetArgs,
    },

    /// Report dataset progress
    Status {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// List raw files missing for logged points
        #[arg(long)]
        missing: bool,
    },
}

#[derive(Args, Debug)]
struct DatasetArgs {
    /// Dataset directory
    #[arg(long)]
    directory: Option<PathBuf>,

    /// File name prefix
    #[arg(long)]
    basename: Option<String>,

    /// Collection order, e.g. "Delay,Laser_on,Temperature,Repeat=16"
    #[arg(long)]
    order: Option<String>,

    /// Detectors, e.g. "xray_detector,xray_scope.C1"
    #[arg(long)]
    detectors: Option<String>,

    /// Replace the Repeat count of the collection order
    #[arg(long)]
    repeat: Option<usize>,

    #[arg(long)]
    description: Option<String>,
}

impl DatasetArgs {
    fn apply(&self, controller: &AcquisitionController) {
        controller.update_settings(|settings| {
            if let Some(directory) = &self.directory {
                settings.directory = directory.clone();
            }
            if let Some(basename) = &self.basename {
                settings.basename = basename.clone();
            }
            if let Some(order) = &self.order {
                settings.collection_order = order.clone();
            }
            if let Some(detectors) = &self.detectors {
                settings.detectors = DetectorSelection::parse(detectors);
            }
            if let Some(repeat) = self.repeat {
                settings.override_repeat = true;
                settings.override_repeat_count = repeat;
            }
            if let Some(description) = &self.description {
                settings.description = description.clone();
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ControllerConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    if let Commands::Collect { mode: Some(mode), .. } = &cli.command {
        let selected = config
            .method(Some(mode.as_str()))
            .cloned()
            .with_context(|| format!("no method named '{mode}'"))?;
        config.methods.retain(|m| m.name != selected.name);
        config.methods.insert(0, selected);
    }

    let store = Arc::new(config.settings.store(&config.application.name));
    let check_interval = config.settings.check_interval;
    let table_name = format!("domains/{}/acquisition", config.timing.domain);
    let beamline = Beamline::simulated(config)?;
    let controller = Arc::clone(&beamline.controller);
    controller.load_settings(&store.table(table_name.as_str()));

    let dataset = match &cli.command {
        Commands::Expand { dataset }
        | Commands::Collect { dataset, .. }
        | Commands::Erase { dataset }
        | Commands::Status { dataset, .. } => dataset,
    };
    dataset.apply(&controller);

    let result = match cli.command {
        Commands::Expand { .. } => expand(&controller),
        Commands::Collect {
            tables,
            finish_series,
            ..
        } => {
            let watcher = SettingsWatcher::spawn(Arc::clone(&store), check_interval);
            let follower = follow_finish_series(&store, &table_name, &controller);
            let result = collect(&beamline, tables, finish_series).await;
            follower.abort();
            watcher.stop().await;
            result
        }
        Commands::Erase { .. } => erase(&controller).await,
        Commands::Status { missing, .. } => status(&controller, missing),
    };
    save_settings(&store, &table_name, &controller);
    result
}

fn save_settings(store: &SettingsStore, table_name: &str, controller: &AcquisitionController) {
    if let Err(e) = controller.save_settings(&store.table(table_name)) {
        warn!("settings not saved: {e}");
    }
}

/// Apply `finish_series` edits made to the settings table while collecting.
fn follow_finish_series(
    store: &SettingsStore,
    table_name: &str,
    controller: &Arc<AcquisitionController>,
) -> tokio::task::JoinHandle<()> {
    let mut changes = store.subscribe();
    let table = table_name.to_string();
    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) if change.table == table && change.key == "finish_series" => {
                    let finish = change.value.and_then(|v| v.as_bool()).unwrap_or(false);
                    info!(finish, "finish series changed in settings");
                    controller.finish_series().set_if_changed(finish);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn expand(controller: &AcquisitionController) -> Result<()> {
    let scan = controller.expansion()?;
    println!("{}", scan.table());
    println!(
        "{} points, {} passes, sequence period {}",
        scan.n(),
        scan.pass_count(),
        scan.sequence_period()
    );
    for pass in plan_passes(&scan, 0, scan.n()) {
        let moving: Vec<&str> = wait_axes_changing_at(&scan, *pass.start())
            .into_iter()
            .map(|j| scan.axes()[j].name())
            .collect();
        println!(
            "pass {}-{}: {}",
            pass.start() + 1,
            pass.end() + 1,
            if moving.is_empty() { "-".to_string() } else { moving.join(", ") }
        );
    }
    Ok(())
}

async fn collect(
    beamline: &Beamline,
    tables: Option<PathBuf>,
    finish_series: Option<String>,
) -> Result<()> {
    let controller = Arc::clone(&beamline.controller);
    if let Some(directory) = tables {
        let loaded = beamline.load_tables(&directory)?;
        info!(loaded, directory = %directory.display(), "configuration tables loaded");
    }
    if let Some(variable) = finish_series {
        controller.update_settings(|s| s.finish_series_variable = variable);
        controller.finish_series().set(true);
    }

    let cancel = Arc::clone(&controller);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let outcome = controller.collect_dataset().await;
    ctrl_c.abort();

    match outcome? {
        CollectionOutcome::AlreadyComplete => println!("Dataset already complete"),
        CollectionOutcome::Completed { collected } => {
            println!("Collection completed: {collected} points")
        }
        CollectionOutcome::SeriesFinished {
            collected,
            n_collect,
        } => println!("Series finished at point {n_collect}: {collected} points"),
        CollectionOutcome::Cancelled { collected } => {
            println!("Cancelled after {collected} points")
        }
    }
    Ok(())
}

async fn erase(controller: &AcquisitionController) -> Result<()> {
    let outcome = controller.erase_dataset().await?;
    println!("{outcome:?}");
    Ok(())
}

fn status(controller: &AcquisitionController, missing: bool) -> Result<()> {
    let scan = controller.expansion()?;
    let layout = controller.layout();
    let status = controller.dataset_status()?;
    println!(
        "{}: {}/{} points collected, next point {}",
        layout.logfile_path().display(),
        status.acquired_count(),
        status.n(),
        status.collection_first_i() + 1
    );
    if missing {
        for path in status.missing_files(&layout, &scan) {
            println!("missing: {}", path.display());
        }
    }
    Ok(())
}
