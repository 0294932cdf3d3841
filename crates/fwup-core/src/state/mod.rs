//! Burn state machine module.

pub mod burn;
pub mod machine;
pub mod reconcile;

pub use burn::{BurnOptions, BurnOutcome, ModuleBurner};
pub use machine::{BurnState, ProgressTracker};
pub use reconcile::{BlockPlan, BlockRecord, BlockRecords, BlockStatus, plan_blocks};
