//! Plan execution
//!
//! Moves are submitted to the [`MoveJournal`] one at a time in plan order.
//! A failing move (missing source, taken destination, escape, I/O error) is
//! recorded and execution continues with the next one. Two things stop the
//! run early:
//!
//! - cancellation, checked before every move
//! - an error that makes further appends unsafe ([`DeclutterError::halts_execution`])
//!
//! Nothing already applied is rolled back. The report says where to pick up
//! again, and [`first_unapplied`] recomputes that from the journal after a
//! restart.

use crate::error::{DeclutterError, Result};
use crate::journal::{MoveJournal, MoveRecord};
use crate::plan::{self, Plan, ProposedMove};
use crate::types::{ProgressCallback, ProgressInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; takes effect before the next move
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A move that was attempted and failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveFailure {
    /// Position in the plan
    pub index: usize,
    /// Source path
    pub source: PathBuf,
    /// Intended destination
    pub destination: PathBuf,
    /// What went wrong
    pub error: String,
}

/// Outcome of running a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Journal records of the moves that went through
    pub applied: Vec<MoveRecord>,
    /// Moves that failed; execution continued past them
    pub failures: Vec<MoveFailure>,
    /// Index of the first move not attempted
    pub next_index: usize,
    /// Number of moves in the plan
    pub total: usize,
    /// Whether the run stopped because of cancellation
    pub cancelled: bool,
    /// Error that stopped the run, if any
    pub halted: Option<String>,
}

impl ExecutionReport {
    /// Whether every move was attempted
    pub fn is_complete(&self) -> bool {
        self.next_index >= self.total
    }

    /// Whether every move was attempted and none failed
    pub fn is_success(&self) -> bool {
        self.is_complete() && self.failures.is_empty()
    }

    /// Get a summary of the execution
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Applied {} of {} moves, {} failed",
            self.applied.len(),
            self.total,
            self.failures.len()
        );
        if self.cancelled {
            summary.push_str(&format!("; cancelled before move {}", self.next_index + 1));
        }
        if let Some(reason) = &self.halted {
            summary.push_str(&format!("; halted: {}", reason));
        }
        summary
    }
}

/// Runs plans against a journal
pub struct Executor<'a> {
    journal: &'a MoveJournal,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
}

impl<'a> Executor<'a> {
    /// Executor without cancellation or progress reporting
    pub fn new(journal: &'a MoveJournal) -> Self {
        Self {
            journal,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    /// Use this cancellation token
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report progress after every move
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run the whole plan
    pub fn execute(&self, plan: &Plan) -> Result<ExecutionReport> {
        self.execute_from(plan, 0)
    }

    /// Run the plan starting at `start`
    ///
    /// # Errors
    ///
    /// Errors only when nothing was attempted: an invalid plan, or a journal
    /// blocked by unacknowledged reconciliation findings. Per-move failures
    /// are in the report.
    #[instrument(skip(self, plan), fields(moves = plan.len()))]
    pub fn execute_from(&self, plan: &Plan, start: usize) -> Result<ExecutionReport> {
        plan::validate_plan(plan)?;
        let report = self.journal.reconciliation();
        if report.blocks_mutation() {
            return Err(DeclutterError::inconsistency(report.summary()));
        }

        let mut report = ExecutionReport {
            next_index: start.min(plan.len()),
            total: plan.len(),
            ..Default::default()
        };
        for (index, proposed) in plan.moves.iter().enumerate().skip(start) {
            if self.cancel.is_cancelled() {
                info!("Execution cancelled before move {}", index + 1);
                report.cancelled = true;
                break;
            }

            match self.apply(proposed) {
                Ok(record) => report.applied.push(record),
                Err(e) if e.halts_execution() => {
                    warn!("Execution halted at move {}: {}", index + 1, e);
                    report.halted = Some(e.user_message());
                    break;
                }
                Err(e) => {
                    warn!("Move {} failed: {}", index + 1, e);
                    report.failures.push(MoveFailure {
                        index,
                        source: proposed.source().to_path_buf(),
                        destination: proposed.destination.clone(),
                        error: e.user_message(),
                    });
                }
            }
            report.next_index = index + 1;

            if let Some(progress) = &self.progress {
                progress(ProgressInfo {
                    operation: "Moving photos".to_string(),
                    current_item: Some(proposed.source().display().to_string()),
                    processed: index + 1,
                    total: Some(plan.len()),
                });
            }
        }

        info!("{}", report.summary());
        Ok(report)
    }

    fn apply(&self, proposed: &ProposedMove) -> Result<MoveRecord> {
        debug!("Moving {} ({})", proposed.photo, proposed.reason);
        self.journal
            .propose_move(proposed.source(), &proposed.destination)
    }
}

/// Index of the first plan entry the journal has not applied
///
/// Entries are matched against forward moves that are still in effect.
pub fn first_unapplied(plan: &Plan, journal: &MoveJournal) -> usize {
    let applied: BTreeSet<(PathBuf, PathBuf)> = journal
        .active_moves()
        .into_iter()
        .map(|r| (r.source, r.destination))
        .collect();
    plan.moves
        .iter()
        .position(|m| !applied.contains(&(m.source().to_path_buf(), m.destination.clone())))
        .unwrap_or(plan.len())
}
