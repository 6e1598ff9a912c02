//! Control loop: the single-writer controller and its tick driver.

mod controller;
mod scheduler;

pub use controller::{
    Controller, ControllerSettings, LiquidationReport, TickOutcome, TickReport,
};
pub use scheduler::TickScheduler;
