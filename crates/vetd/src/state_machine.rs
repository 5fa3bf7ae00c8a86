//! Package transition table.
//!
//! Every status write in the pipeline goes through [`predecessor`]: a package
//! may only move to `next` when it currently holds exactly
//! `predecessor(next)`. There is no skipping and no moving backwards.
//!
//! ```text
//! Requested → Parsed → LicenseChecked → Downloaded → SecurityScanning
//!     → SecurityScanned → PendingApproval → Approved | Rejected
//! ```

use vet_core::state::PackageStatus;

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid package status transition: {from} -> {to}")]
    InvalidTransition {
        from: PackageStatus,
        to: PackageStatus,
    },
}

/// Who is allowed to perform an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionActor {
    /// A polling stage worker (through its stage service).
    Worker,
    /// The human approval path.
    ApprovalApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: PackageStatus,
    pub to: PackageStatus,
    pub actor: TransitionActor,
}

pub const EDGES: &[Edge] = &[
    Edge {
        from: PackageStatus::Requested,
        to: PackageStatus::Parsed,
        actor: TransitionActor::Worker,
    },
    Edge {
        from: PackageStatus::Parsed,
        to: PackageStatus::LicenseChecked,
        actor: TransitionActor::Worker,
    },
    Edge {
        from: PackageStatus::LicenseChecked,
        to: PackageStatus::Downloaded,
        actor: TransitionActor::Worker,
    },
    Edge {
        from: PackageStatus::Downloaded,
        to: PackageStatus::SecurityScanning,
        actor: TransitionActor::Worker,
    },
    Edge {
        from: PackageStatus::SecurityScanning,
        to: PackageStatus::SecurityScanned,
        actor: TransitionActor::Worker,
    },
    Edge {
        from: PackageStatus::SecurityScanned,
        to: PackageStatus::PendingApproval,
        actor: TransitionActor::Worker,
    },
    Edge {
        from: PackageStatus::PendingApproval,
        to: PackageStatus::Approved,
        actor: TransitionActor::ApprovalApi,
    },
    Edge {
        from: PackageStatus::PendingApproval,
        to: PackageStatus::Rejected,
        actor: TransitionActor::ApprovalApi,
    },
];

/// The only status a package may hold immediately before `next`.
///
/// `None` for `Requested`, which is only ever written on creation.
pub fn predecessor(next: PackageStatus) -> Option<PackageStatus> {
    EDGES
        .iter()
        .find(|edge| edge.to == next)
        .map(|edge| edge.from)
}

pub fn edge(from: PackageStatus, to: PackageStatus) -> Option<&'static Edge> {
    EDGES.iter().find(|edge| edge.from == from && edge.to == to)
}

/// Check if a status transition is legal. Self-transitions are not.
pub fn is_transition_allowed(from: PackageStatus, to: PackageStatus) -> bool {
    edge(from, to).is_some()
}

/// Validate a transition, returning the edge it follows.
pub fn check_transition(
    from: PackageStatus,
    to: PackageStatus,
) -> Result<&'static Edge, StateMachineError> {
    edge(from, to).ok_or(StateMachineError::InvalidTransition { from, to })
}

/// Result of one compare-and-set advance attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The write applied; the package moved from `from` to the target.
    Applied { from: PackageStatus },
    /// The package was not at the expected predecessor at write time.
    Conflict { current: PackageStatus },
    NotFound,
    /// The target has no predecessor (only `Requested`).
    IllegalTarget,
}

impl AdvanceOutcome {
    pub fn applied(self) -> bool {
        matches!(self, AdvanceOutcome::Applied { .. })
    }
}
