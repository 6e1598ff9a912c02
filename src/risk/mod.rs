//! Risk and collateral policy.
//!
//! The pure half of the control loop:
//! - Volatility-based risk weights (with cache and overrides)
//! - Target collateral allocation
//! - Rebalance planning and execution
//! - Deficit detection and partial-close planning
//! - Emergency detection from snapshots and price updates

mod allocator;
mod estimator;
mod events;
mod liquidation;
mod rebalance;

pub use allocator::TargetAllocator;
pub use estimator::RiskEstimator;
pub use events::EventDetector;
pub use liquidation::{LiquidationAssessment, LiquidationPlanner, PartialClose};
pub use rebalance::{MarginAdjustment, RebalanceOutcome, RebalancePlanner};
