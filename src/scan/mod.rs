//! Scan specification: values grammar, axes, expansion and drivers.

pub mod axis;
pub mod driver;
pub mod expander;
pub mod expression;

pub use axis::{AxisKind, ScanAxis};
pub use driver::{AxisConfig, DriverTarget, ScanDriver};
pub use expander::{parse_collection_order, OrderItem, ScanExpander, ScanExpansion};
pub use expression::expand_scan_points;
