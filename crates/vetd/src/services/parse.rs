use chrono::Utc;
use vet_core::types::{Package, Stage};

use super::manifest::parse_manifest;
use super::{BatchResult, ItemOutcome, ServiceContext, ServiceError, StageService};
use crate::selector::BatchSelector;

/// Expands pending requests into packages, then validates `Requested`
/// packages and moves them to `Parsed`.
#[derive(Debug)]
pub struct ParseService {
    ctx: ServiceContext,
}

impl ParseService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn expand_requests(&self, limit: usize, result: &mut BatchResult) -> Result<(), ServiceError> {
        let requests = BatchSelector::new(&self.ctx.store).pending_requests(limit)?;
        for request in requests {
            let now = Utc::now();
            match parse_manifest(&request.payload) {
                Ok(entries) => {
                    let packages = entries
                        .into_iter()
                        .map(|entry| {
                            Package::new(
                                request.id.clone(),
                                entry.name,
                                entry.version,
                                entry.licenses,
                                now,
                            )
                        })
                        .collect::<Vec<_>>();
                    if self.ctx.store.expand_request(&request.id, &packages, now)? {
                        tracing::debug!(
                            request_id = %request.id,
                            packages = packages.len(),
                            "request expanded"
                        );
                        result.bump("requests_expanded", 1);
                        result.bump("packages_created", packages.len());
                    }
                }
                Err(err) => {
                    let reason = err.to_string();
                    if self.ctx.store.fail_request(&request.id, &reason, now)? {
                        tracing::warn!(request_id = %request.id, reason = %reason, "request rejected");
                        result.bump("requests_failed", 1);
                    }
                }
            }
        }
        Ok(())
    }

    fn validate(&self, package: &Package) -> Result<ItemOutcome, ServiceError> {
        match coordinate_problem(&package.name, &package.version) {
            Some(problem) => self
                .ctx
                .fail_item_permanently(Stage::Parse, package, &problem),
            None => self.ctx.advance(package, Stage::Parse.postcondition()),
        }
    }
}

impl StageService for ParseService {
    fn process_batch(&mut self, limit: usize) -> Result<BatchResult, ServiceError> {
        let mut result = BatchResult::empty();
        self.expand_requests(limit, &mut result)?;

        let packages =
            BatchSelector::new(&self.ctx.store).packages_at(Stage::Parse.precondition(), limit)?;
        for package in &packages {
            let outcome = self.validate(package)?;
            result.record(&outcome);
        }
        Ok(result)
    }
}

/// Why a name/version pair cannot be resolved, if it cannot.
fn coordinate_problem(name: &str, version: &str) -> Option<String> {
    if name.trim().is_empty() {
        return Some("package name is empty".to_string());
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Some(format!("package name `{name}` contains whitespace"));
    }
    if version.trim().is_empty() {
        return Some(format!("package `{name}` has no version"));
    }
    let well_formed = version
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '_'));
    if !well_formed {
        return Some(format!("package `{name}` has malformed version `{version}`"));
    }
    None
}
