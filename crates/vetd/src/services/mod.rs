//! Stage services: the business side of each pipeline stage.
//!
//! A service selects its own batch, does the stage work per item and calls
//! the transition queue once an item succeeds. Item failures are recorded on
//! the package and never abort the rest of the batch; storage failures do.

pub mod approval;
pub mod download;
pub mod license;
pub mod manifest;
pub mod parse;
pub mod security;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use vet_core::config::{
    max_item_attempts, require_var, ConfigError, EnvSource, DATABASE_URL,
    DEFAULT_CLAIM_LEASE_SECS, DEFAULT_MAX_ITEM_ATTEMPTS,
};
use vet_core::state::PackageStatus;
use vet_core::types::{Package, Stage};

use crate::persistence::{PersistenceError, SqliteStore};
use crate::queue::{DirectQueue, QueueError, TransitionQueue};

pub use approval::ApprovalTransitionService;
pub use download::{ArtifactFetcher, DownloadService, FetchError, MirrorFetcher};
pub use license::{evaluate_licenses, LicenseRuling, LicenseService};
pub use parse::ParseService;
pub use security::{CommandScanner, ScanError, ScanReport, SecurityService, VulnerabilityScanner};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Contract every stage worker drives once per cycle.
pub trait StageService: Send {
    fn process_batch(&mut self, limit: usize) -> Result<BatchResult, ServiceError>;
}

/// Per-item result inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Advanced,
    Failed { reason: String, permanent: bool },
    /// Someone else moved the package first.
    Conflict,
}

/// Aggregate result of one `process_batch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub success: bool,
    /// Packages advanced to the stage postcondition.
    pub processed_count: usize,
    pub failed_count: usize,
    pub conflict_count: usize,
    pub error: Option<String>,
    pub counters: BTreeMap<&'static str, usize>,
}

impl BatchResult {
    pub fn empty() -> Self {
        Self {
            success: true,
            processed_count: 0,
            failed_count: 0,
            conflict_count: 0,
            error: None,
            counters: BTreeMap::new(),
        }
    }

    /// The batch could not run at all; nothing was advanced.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::empty()
        }
    }

    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a ItemOutcome>) -> Self {
        let mut result = Self::empty();
        for outcome in outcomes {
            result.record(outcome);
        }
        result
    }

    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Advanced => self.processed_count += 1,
            ItemOutcome::Failed { .. } => self.failed_count += 1,
            ItemOutcome::Conflict => self.conflict_count += 1,
        }
    }

    pub fn bump(&mut self, counter: &'static str, by: usize) {
        *self.counters.entry(counter).or_insert(0) += by;
    }

    /// Nothing was eligible this cycle.
    pub fn is_idle(&self) -> bool {
        self.success
            && self.processed_count == 0
            && self.failed_count == 0
            && self.conflict_count == 0
            && self.counters.values().all(|value| *value == 0)
    }

    /// `k=v` pairs for the cycle summary log line.
    pub fn counters_summary(&self) -> String {
        self.counters
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What every service needs: its own store connection and the retry ceiling.
#[derive(Debug)]
pub struct ServiceContext {
    pub store: SqliteStore,
    pub max_attempts: u32,
}

impl ServiceContext {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ITEM_ATTEMPTS,
        }
    }

    /// Connect to `DATABASE_URL` and make sure the schema exists.
    pub fn from_env(env: &dyn EnvSource) -> Result<Self, ServiceError> {
        let url = require_var(env, DATABASE_URL)?;
        let store = SqliteStore::connect(&url)?;
        store.migrate()?;
        Ok(Self {
            store,
            max_attempts: max_item_attempts(env)?,
        })
    }

    pub fn queue(&self) -> DirectQueue<'_> {
        DirectQueue::new(&self.store)
    }

    /// Advance one package, mapping a lost compare-and-set to `Conflict`.
    pub fn advance(
        &self,
        package: &Package,
        next: PackageStatus,
    ) -> Result<ItemOutcome, ServiceError> {
        if self.queue().advance_status(&package.id, next)? {
            Ok(ItemOutcome::Advanced)
        } else {
            Ok(ItemOutcome::Conflict)
        }
    }

    /// Take the claim on a package at `package.status`.
    ///
    /// Claims older than `lease` belong to a holder that crashed and are
    /// taken over. `false` means another worker holds a live claim or the
    /// package moved on.
    pub fn claim(&self, package: &Package, lease: Duration) -> Result<bool, ServiceError> {
        let now = Utc::now();
        Ok(self
            .store
            .claim_package(&package.id, package.status, lease_cutoff(now, lease), now)?)
    }

    /// Record an item failure in place; the package keeps its status and
    /// any claim on it is released.
    ///
    /// The failure only lands while the package still sits at
    /// `package.status`; otherwise it is reported as a `Conflict`.
    pub fn fail_item(
        &self,
        stage: Stage,
        package: &Package,
        reason: &str,
    ) -> Result<ItemOutcome, ServiceError> {
        self.fail_item_with_limit(stage, package, reason, self.max_attempts)
    }

    /// Failure that retrying cannot fix; the package is parked immediately.
    pub fn fail_item_permanently(
        &self,
        stage: Stage,
        package: &Package,
        reason: &str,
    ) -> Result<ItemOutcome, ServiceError> {
        self.fail_item_with_limit(stage, package, reason, 1)
    }

    fn fail_item_with_limit(
        &self,
        stage: Stage,
        package: &Package,
        reason: &str,
        max_attempts: u32,
    ) -> Result<ItemOutcome, ServiceError> {
        let record = self
            .store
            .record_item_failure(
                &package.id,
                stage,
                package.status,
                reason,
                max_attempts,
                Utc::now(),
            )?;
        let Some(record) = record else {
            return Ok(ItemOutcome::Conflict);
        };
        tracing::warn!(
            stage = %stage,
            package_id = %package.id,
            package = %package.coordinate(),
            attempts = record.attempts,
            permanent = record.permanent,
            reason,
            "item failed"
        );
        Ok(ItemOutcome::Failed {
            reason: reason.to_string(),
            permanent: record.permanent,
        })
    }
}

/// Claim lease when a service is built without settings.
pub(crate) fn default_claim_lease() -> Duration {
    Duration::from_secs(DEFAULT_CLAIM_LEASE_SECS)
}

/// Claims stamped at or before the returned instant are expired.
pub(crate) fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn batch_result_counts_outcomes() {
        let outcomes = vec![
            ItemOutcome::Advanced,
            ItemOutcome::Advanced,
            ItemOutcome::Conflict,
            ItemOutcome::Failed {
                reason: "x".to_string(),
                permanent: false,
            },
        ];
        let result = BatchResult::from_outcomes(&outcomes);
        assert!(result.success);
        assert_eq!(result.processed_count, 2);
        assert_eq!(result.conflict_count, 1);
        assert_eq!(result.failed_count, 1);
        assert!(!result.is_idle());
        assert!(BatchResult::empty().is_idle());
        assert!(!BatchResult::failed("db down").is_idle());
    }

    #[test]
    fn counters_summary_is_sorted() {
        let mut result = BatchResult::empty();
        result.bump("reclaimed", 1);
        result.bump("claimed", 2);
        result.bump("claimed", 1);
        assert_eq!(result.counters_summary(), "claimed=3 reclaimed=1");
    }

    #[test]
    fn fail_item_reaches_permanent_at_max_attempts() {
        let mut ctx = mk_ctx();
        ctx.max_attempts = 2;
        let package = seed_package(&ctx, 0, "flaky", "1.0.0", &["MIT"], PackageStatus::Downloaded);

        let first = ctx
            .fail_item(Stage::Security, &package, "scanner timeout")
            .expect("fail");
        assert_eq!(
            first,
            ItemOutcome::Failed {
                reason: "scanner timeout".to_string(),
                permanent: false
            }
        );
        let second = ctx
            .fail_item(Stage::Security, &package, "scanner timeout")
            .expect("fail");
        assert!(matches!(second, ItemOutcome::Failed { permanent: true, .. }));
        assert_eq!(status_of(&ctx, &package), PackageStatus::Downloaded);
    }

    #[test]
    fn failure_after_the_package_moved_on_is_a_conflict() {
        let mut ctx = mk_ctx();
        ctx.max_attempts = 1;
        let package = seed_package(&ctx, 0, "racy", "1.0.0", &["MIT"], PackageStatus::LicenseChecked);
        assert_eq!(
            ctx.advance(&package, PackageStatus::Downloaded).expect("advance"),
            ItemOutcome::Advanced
        );

        let outcome = ctx
            .fail_item(Stage::Download, &package, "late fetch error")
            .expect("fail");
        assert_eq!(outcome, ItemOutcome::Conflict);
        let stored = reload(&ctx, &package);
        assert_eq!(stored.status, PackageStatus::Downloaded);
        assert!(!stored.failed_permanently);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.last_error, None);
    }

    #[test]
    fn claim_is_exclusive_until_failure_releases_it() {
        let ctx = mk_ctx();
        let package = seed_package(&ctx, 0, "serde", "1.0.0", &["MIT"], PackageStatus::LicenseChecked);
        let lease = Duration::from_secs(600);

        assert!(ctx.claim(&package, lease).expect("claim"));
        assert!(!ctx.claim(&package, lease).expect("second claim"));

        ctx.fail_item(Stage::Download, &package, "mirror down")
            .expect("fail");
        assert!(ctx.claim(&package, lease).expect("claim after failure"));
    }

    #[test]
    fn lease_cutoff_saturates_for_huge_leases() {
        let now = base_time();
        assert_eq!(
            lease_cutoff(now, Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
        assert_eq!(
            lease_cutoff(now, Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::UNIX_EPOCH
        );
    }

    #[test]
    fn from_env_requires_database_url() {
        let env = std::collections::HashMap::<String, String>::new();
        let err = ServiceContext::from_env(&env).expect_err("missing url");
        assert!(matches!(
            err,
            ServiceError::Config(ConfigError::MissingEnvVar { .. })
        ));

        let env = std::collections::HashMap::from([(
            DATABASE_URL.to_string(),
            ":memory:".to_string(),
        )]);
        let ctx = ServiceContext::from_env(&env).expect("memory store");
        assert_eq!(ctx.max_attempts, DEFAULT_MAX_ITEM_ATTEMPTS);
    }
}
