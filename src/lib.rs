pub mod config;
pub mod error;
pub mod kill;
pub mod simulation;
pub mod station;
pub mod worker;

pub use error::Error;
pub use simulation::{ShutdownReport, Simulation};
