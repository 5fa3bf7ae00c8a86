use vet_core::config::LicensePolicy;
use vet_core::types::Stage;

use super::{BatchResult, ServiceContext, ServiceError, StageService};
use crate::selector::{BatchSelector, LicenseGroup};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseRuling {
    Allowed,
    Denied { reason: String },
}

/// Rule on a resolved license set.
///
/// Each entry may be an `OR` expression; an entry passes when any of its
/// alternatives is allowed and not denied. Every entry must pass.
pub fn evaluate_licenses(policy: &LicensePolicy, licenses: &[String]) -> LicenseRuling {
    if licenses.is_empty() {
        return if policy.allow_unlicensed {
            LicenseRuling::Allowed
        } else {
            LicenseRuling::Denied {
                reason: "no license resolved".to_string(),
            }
        };
    }

    for entry in licenses {
        let alternatives = entry
            .split(" OR ")
            .map(|alt| alt.trim().trim_matches(|c| c == '(' || c == ')').trim())
            .filter(|alt| !alt.is_empty())
            .collect::<Vec<_>>();
        let passes = alternatives
            .iter()
            .any(|alt| policy.allowed.contains(*alt) && !policy.denied.contains(*alt));
        if passes {
            continue;
        }
        if let Some(denied) = alternatives.iter().find(|alt| policy.denied.contains(**alt)) {
            return LicenseRuling::Denied {
                reason: format!("license {denied} is denied by policy"),
            };
        }
        return LicenseRuling::Denied {
            reason: format!("license {entry} is not in the allow list"),
        };
    }
    LicenseRuling::Allowed
}

/// One policy evaluation per fingerprint group, fanned out to all members.
#[derive(Debug)]
pub struct LicenseService {
    ctx: ServiceContext,
    policy: LicensePolicy,
}

impl LicenseService {
    pub fn new(ctx: ServiceContext, policy: LicensePolicy) -> Self {
        Self { ctx, policy }
    }

    fn rule_group(&self, group: &LicenseGroup, result: &mut BatchResult) -> Result<(), ServiceError> {
        let Some(head) = group.head() else {
            return Ok(());
        };
        let ruling = evaluate_licenses(&self.policy, &head.licenses);
        tracing::debug!(
            fingerprint = %group.fingerprint,
            members = group.members.len(),
            ruling = ?ruling,
            "license group evaluated"
        );
        result.bump("groups_evaluated", 1);

        match ruling {
            LicenseRuling::Allowed => {
                for member in &group.members {
                    let outcome = self.ctx.advance(member, Stage::License.postcondition())?;
                    result.record(&outcome);
                }
            }
            LicenseRuling::Denied { reason } => {
                result.bump("groups_denied", 1);
                for member in &group.members {
                    let outcome = self.ctx.fail_item(Stage::License, member, &reason)?;
                    result.record(&outcome);
                }
            }
        }
        Ok(())
    }
}

impl StageService for LicenseService {
    /// `limit` caps fingerprint groups, not packages.
    fn process_batch(&mut self, limit: usize) -> Result<BatchResult, ServiceError> {
        let groups = BatchSelector::new(&self.ctx.store).license_groups(limit)?;
        let mut result = BatchResult::empty();
        for group in &groups {
            self.rule_group(group, &mut result)?;
        }
        Ok(result)
    }
}
