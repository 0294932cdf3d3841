//! Burn state machine states and progress accounting.

use std::fmt;

/// State of one module's burn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BurnState {
    /// Not started.
    #[default]
    Idle,
    /// Fetching module state and block table.
    Querying,
    /// Module already up to date.
    Skip,
    /// Session open, blocks in flight.
    Updating,
    /// Re-reading the block table after transfer.
    Verifying,
    /// Committing the module.
    Activating,
    Done,
    Failed,
}

impl fmt::Display for BurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BurnState::Idle => write!(f, "IDLE"),
            BurnState::Querying => write!(f, "QUERYING"),
            BurnState::Skip => write!(f, "SKIP"),
            BurnState::Updating => write!(f, "UPDATING"),
            BurnState::Verifying => write!(f, "VERIFYING"),
            BurnState::Activating => write!(f, "ACTIVATING"),
            BurnState::Done => write!(f, "DONE"),
            BurnState::Failed => write!(f, "FAILED"),
        }
    }
}

impl BurnState {
    /// Check if no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BurnState::Done | BurnState::Failed)
    }

    /// Whether `next` is a legal successor.
    pub fn can_transition_to(&self, next: BurnState) -> bool {
        use BurnState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Querying)
                | (Querying, Skip)
                | (Querying, Updating)
                | (Skip, Activating)
                | (Skip, Done)
                | (Updating, Verifying)
                | (Verifying, Activating)
                | (Activating, Done)
        )
    }
}

/// Progress across every block of a run.
///
/// Each block, transferred or skipped, advances progress by
/// `1 / total_blocks`.
pub struct ProgressTracker<'a> {
    total_blocks: usize,
    completed: usize,
    sink: &'a mut dyn FnMut(f32),
}

impl<'a> ProgressTracker<'a> {
    pub fn new(total_blocks: usize, sink: &'a mut dyn FnMut(f32)) -> Self {
        Self {
            total_blocks,
            completed: 0,
            sink,
        }
    }

    pub fn fraction(&self) -> f32 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        (self.completed as f32 / self.total_blocks as f32).min(1.0)
    }

    /// Report 0.0.
    pub fn start(&mut self) {
        self.completed = 0;
        (self.sink)(0.0);
    }

    /// One block processed.
    pub fn tick(&mut self) {
        self.completed += 1;
        let fraction = self.fraction();
        (self.sink)(fraction);
    }

    /// Report 1.0.
    pub fn finish(&mut self) {
        self.completed = self.total_blocks;
        (self.sink)(1.0);
    }
}
