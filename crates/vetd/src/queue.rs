//! Transition queue: the single entry point for package status changes.
//!
//! Callers record the intent "move this package to `next`". Today the intent
//! is applied synchronously by a compare-and-set inside a storage transaction
//! ([`DirectQueue`]). A broker-backed implementation can replace it later;
//! callers may only rely on `true` meaning the transition will not be lost.

use chrono::Utc;
use vet_core::state::PackageStatus;
use vet_core::types::PackageId;

use crate::persistence::{PersistenceError, SqliteStore};
use crate::state_machine::{
    check_transition, edge, predecessor, AdvanceOutcome, StateMachineError, TransitionActor,
};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
}

pub trait TransitionQueue {
    /// Advance `package_id` to `next` if it currently sits at the expected
    /// predecessor.
    ///
    /// `Ok(false)` means nothing was applied: the package is missing, the
    /// target is illegal or reserved for [`record_decision`], or a concurrent
    /// caller won the race. None of these are errors. `Err` is reserved for
    /// storage failures.
    fn advance_status(&self, package_id: &PackageId, next: PackageStatus)
        -> Result<bool, QueueError>;
}

/// Applies transitions directly through a storage transaction.
#[derive(Debug, Clone, Copy)]
pub struct DirectQueue<'a> {
    store: &'a SqliteStore,
}

impl<'a> DirectQueue<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self { store }
    }

    /// Same as [`TransitionQueue::advance_status`] with the detailed outcome.
    pub fn try_advance(
        &self,
        package_id: &PackageId,
        next: PackageStatus,
    ) -> Result<AdvanceOutcome, QueueError> {
        let outcome = self.store.advance(package_id, next, Utc::now())?;
        match outcome {
            AdvanceOutcome::Applied { from } => {
                tracing::debug!(package_id = %package_id, %from, to = %next, "status advanced");
            }
            AdvanceOutcome::Conflict { current } => {
                tracing::debug!(
                    package_id = %package_id,
                    %current,
                    target = %next,
                    "status compare-and-set lost; transition already applied elsewhere"
                );
            }
            AdvanceOutcome::NotFound => {
                tracing::warn!(package_id = %package_id, target = %next, "advance skipped: package not found");
            }
            AdvanceOutcome::IllegalTarget => {
                tracing::warn!(package_id = %package_id, target = %next, "advance skipped: status has no predecessor");
            }
        }
        Ok(outcome)
    }
}

impl TransitionQueue for DirectQueue<'_> {
    fn advance_status(
        &self,
        package_id: &PackageId,
        next: PackageStatus,
    ) -> Result<bool, QueueError> {
        let approval_edge = predecessor(next)
            .and_then(|from| edge(from, next))
            .is_some_and(|edge| edge.actor == TransitionActor::ApprovalApi);
        if approval_edge {
            tracing::warn!(
                package_id = %package_id,
                target = %next,
                "advance refused: target is reserved for the approval path"
            );
            return Ok(false);
        }
        Ok(self.try_advance(package_id, next)?.applied())
    }
}

/// Human decision on a package waiting for approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn target(self) -> PackageStatus {
        match self {
            Decision::Approve => PackageStatus::Approved,
            Decision::Reject => PackageStatus::Rejected,
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "approve" | "approved" => Ok(Decision::Approve),
            "reject" | "rejected" => Ok(Decision::Reject),
            other => Err(format!(
                "invalid decision '{other}'. valid values: approve, reject"
            )),
        }
    }
}

/// Terminal edge used by the approval path.
///
/// Unlike worker advances, deciding on a package that is not waiting for
/// approval is reported as an error, since a human asked for it explicitly.
pub fn record_decision(
    queue: &DirectQueue<'_>,
    package_id: &PackageId,
    decision: Decision,
) -> Result<AdvanceOutcome, QueueError> {
    let outcome = queue.try_advance(package_id, decision.target())?;
    if let AdvanceOutcome::Conflict { current } = outcome {
        check_transition(current, decision.target())?;
    }
    Ok(outcome)
}
