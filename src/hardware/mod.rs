//! Hardware capabilities and simulated devices.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Detector, DetectorRun, Motor, MotorValue, Readable};
pub use mock::{DummyMotor, SimulatedDetector, SimulatedMotor, SimulatedReadable};
