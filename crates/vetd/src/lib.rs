//! Package vetting daemon: status pipeline, stage workers and storage.

pub mod health;
pub mod logging;
pub mod persistence;
pub mod queue;
pub mod selector;
// services are reached through their module path; only the contract is re-exported.
pub mod services;
pub mod state_machine;
pub mod worker_loop;
pub mod workers;

pub use health::*;
pub use logging::*;
pub use persistence::*;
pub use queue::*;
pub use selector::*;
pub use services::{BatchResult, ItemOutcome, ServiceContext, ServiceError, StageService};
pub use state_machine::*;
pub use worker_loop::*;
pub use workers::*;

#[cfg(test)]
mod tests {
    use super::{is_transition_allowed, predecessor};
    use vet_core::state::PackageStatus;

    #[test]
    fn crate_root_reexports_state_machine_helpers() {
        assert_eq!(
            predecessor(PackageStatus::Approved),
            Some(PackageStatus::PendingApproval)
        );
        assert!(is_transition_allowed(
            PackageStatus::Downloaded,
            PackageStatus::SecurityScanning
        ));
    }
}
