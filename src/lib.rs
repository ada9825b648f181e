//! # Beamline DAQ Core Library
//!
//! Data acquisition for time-resolved (pump-probe) X-ray experiments. An FPGA
//! timing system fires lasers, choppers, detectors and oscilloscopes from a
//! queue of pre-computed sequences; this library builds those sequences from
//! a scan description, steps the sequencer through the scan and records one
//! logfile line per scan point.
//!
//! ## Crate Structure
//!
//! - **`observable`**: monitored values with change events, derived values and
//!   their dependency graph. Everything that changes is observed through it.
//! - **`settings`**: persistent key/value tables on disk, with a file watcher.
//! - **`timing`**: FPGA register map, clock dividers, transport trait and an
//!   FPGA simulator.
//! - **`channels`**: the 24 timing-system output channels.
//! - **`sequence`**: sequences, the composer that builds them from scan points,
//!   and the sequencer queue that uploads and runs them.
//! - **`scan`**: collection-order parsing, scan expansion and per-axis drivers.
//! - **`hardware`**: `Motor`, `Readable` and `Detector` capabilities with
//!   dummy and simulated devices.
//! - **`diagnostics`**: per-point statistics of sampled channels.
//! - **`logfile`**: the dataset logfile, one line per collected point.
//! - **`tables`**: configuration (methods) tables and motor-path resolution.
//! - **`acquisition`**: dataset layout, erase, pass planning and the
//!   collection loop.
//! - **`beamline`**: assembles all of the above against the simulator.
//! - **`config`**, **`logging`**, **`error`**, **`format`**: ambient support.

pub mod acquisition;
pub mod beamline;
pub mod channels;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod format;
pub mod hardware;
pub mod logfile;
pub mod logging;
pub mod observable;
pub mod scan;
pub mod sequence;
pub mod settings;
pub mod tables;
pub mod timing;

pub use error::{AppResult, DaqError};
