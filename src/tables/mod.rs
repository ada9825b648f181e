//! Configuration tables.
//!
//! A configuration table (methods table) stores named machine states, one per
//! row. Applying a row drives every motor column to the row's cell value.

pub mod resolver;
pub mod table;

pub use resolver::{ColumnTarget, MotorPath, MotorRegistry, TableSet, MAX_NESTING};
pub use table::{ConfigTable, TableColumn, TableRow};
