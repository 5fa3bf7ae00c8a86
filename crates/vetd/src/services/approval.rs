use vet_core::types::Stage;

use super::{BatchResult, ServiceContext, ServiceError, StageService};
use crate::selector::BatchSelector;

/// Hands scanned packages to the human approver (`SecurityScanned ->
/// PendingApproval`). The decision itself arrives through `record_decision`.
#[derive(Debug)]
pub struct ApprovalTransitionService {
    ctx: ServiceContext,
}

impl ApprovalTransitionService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }
}

impl StageService for ApprovalTransitionService {
    fn process_batch(&mut self, limit: usize) -> Result<BatchResult, ServiceError> {
        let packages = BatchSelector::new(&self.ctx.store)
            .packages_at(Stage::Approval.precondition(), limit)?;
        let mut result = BatchResult::empty();
        for package in &packages {
            let outcome = self.ctx.advance(package, Stage::Approval.postcondition())?;
            result.record(&outcome);
        }
        Ok(result)
    }
}
