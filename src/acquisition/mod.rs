//! Dataset acquisition.
//!
//! - [`dataset`]: on-disk layout of a dataset, completion status and erase
//! - [`passes`]: splitting a scan into sequencer passes
//! - [`controller`]: the collection loop

pub mod controller;
pub mod dataset;
pub mod passes;

pub use controller::{
    corrected_timestamp, AcquisitionConfig, AcquisitionController, AcquisitionSettings,
    CollectionOutcome,
};
pub use dataset::{
    erase_dataset, DatasetLayout, DatasetStatus, DetectorSelection, EraseOutcome, LASER_TRACES,
    XRAY_IMAGES, XRAY_TRACES,
};
pub use passes::{plan_passes, wait_axes_changing_at};
