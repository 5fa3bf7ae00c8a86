//! The five stage workers: cadence bindings over the worker loop.
//!
//! A [`StageWorker`] owns a sleep interval, a per-cycle cap and a factory for
//! its [`StageService`]. It never writes to storage itself.

use vet_core::config::{
    license_policy_from_env, stage_env_vars, ConfigError, DownloadSettings, EnvSource,
    ScannerSettings, StageSettings, LICENSE_POLICY_PATH,
};
use vet_core::types::Stage;
use vet_core::validation::{has_errors, Validate, ValidationLevel};

use crate::services::{
    ApprovalTransitionService, DownloadService, LicenseService, ParseService, SecurityService,
    ServiceContext, ServiceError, StageService,
};
use crate::worker_loop::{Worker, WorkerError};

pub type ServiceFactory =
    Box<dyn FnOnce(&dyn EnvSource) -> Result<Box<dyn StageService>, ServiceError> + Send>;

pub fn service_factory<F>(build: F) -> ServiceFactory
where
    F: FnOnce(&dyn EnvSource) -> Result<Box<dyn StageService>, ServiceError> + Send + 'static,
{
    Box::new(build)
}

pub struct StageWorker {
    stage: Stage,
    name: String,
    settings: StageSettings,
    factory: Option<ServiceFactory>,
    service: Option<Box<dyn StageService>>,
}

impl StageWorker {
    pub fn new(stage: Stage, settings: StageSettings, factory: ServiceFactory) -> Self {
        Self {
            stage,
            name: format!("{stage}-worker"),
            settings,
            factory: Some(factory),
            service: None,
        }
    }

    /// Worker around an already built service.
    pub fn with_service(stage: Stage, settings: StageSettings, service: Box<dyn StageService>) -> Self {
        Self {
            stage,
            name: format!("{stage}-worker"),
            settings,
            factory: None,
            service: Some(service),
        }
    }

    /// The production binding for `stage`.
    pub fn for_stage(stage: Stage, settings: StageSettings) -> Self {
        match stage {
            Stage::Parse => Self::parse(settings),
            Stage::License => Self::license(settings),
            Stage::Download => Self::download(settings),
            Stage::Security => Self::security(settings),
            Stage::Approval => Self::approval(settings),
        }
    }

    pub fn parse(settings: StageSettings) -> Self {
        Self::new(
            Stage::Parse,
            settings,
            service_factory(|env| Ok(Box::new(ParseService::new(ServiceContext::from_env(env)?)))),
        )
    }

    pub fn license(settings: StageSettings) -> Self {
        Self::new(
            Stage::License,
            settings,
            service_factory(|env| {
                let policy = license_policy_from_env(env)?;
                let issues = policy.validate();
                if has_errors(&issues) {
                    let reason = issues
                        .iter()
                        .filter(|issue| issue.level == ValidationLevel::Error)
                        .map(|issue| issue.message.clone())
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(ServiceError::Config(ConfigError::InvalidValue {
                        name: LICENSE_POLICY_PATH.to_string(),
                        value: env.var(LICENSE_POLICY_PATH).unwrap_or_default(),
                        reason,
                    }));
                }
                for issue in issues {
                    tracing::warn!(code = issue.code, "{}", issue.message);
                }
                let ctx = ServiceContext::from_env(env)?;
                Ok(Box::new(LicenseService::new(ctx, policy)))
            }),
        )
    }

    pub fn download(settings: StageSettings) -> Self {
        Self::new(
            Stage::Download,
            settings,
            service_factory(|env| {
                let download = DownloadSettings::from_env(env)?;
                let ctx = ServiceContext::from_env(env)?;
                Ok(Box::new(DownloadService::from_settings(ctx, download)?))
            }),
        )
    }

    pub fn security(settings: StageSettings) -> Self {
        Self::new(
            Stage::Security,
            settings,
            service_factory(|env| {
                let scanner = ScannerSettings::from_env(env)?;
                let ctx = ServiceContext::from_env(env)?;
                Ok(Box::new(SecurityService::from_settings(ctx, &scanner)))
            }),
        )
    }

    pub fn approval(settings: StageSettings) -> Self {
        Self::new(
            Stage::Approval,
            settings,
            service_factory(|env| {
                Ok(Box::new(ApprovalTransitionService::new(
                    ServiceContext::from_env(env)?,
                )))
            }),
        )
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn settings(&self) -> StageSettings {
        self.settings
    }
}

impl Worker for StageWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage_env_vars(&self) -> &[&'static str] {
        stage_env_vars(self.stage)
    }

    fn initialize(&mut self, env: &dyn EnvSource) -> Result<(), WorkerError> {
        if self.service.is_some() {
            return Ok(());
        }
        let issues = self.settings.validate();
        if has_errors(&issues) {
            let details = issues
                .iter()
                .map(|issue| issue.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(WorkerError::InvalidSettings(format!(
                "{}: {details}",
                self.stage
            )));
        }
        for issue in issues {
            tracing::warn!(worker = %self.name, code = issue.code, "{}", issue.message);
        }
        let factory = self.factory.take().ok_or(WorkerError::NotInitialized)?;
        self.service = Some(factory(env)?);
        Ok(())
    }

    fn process_cycle(&mut self) -> Result<(), WorkerError> {
        let service = self.service.as_mut().ok_or(WorkerError::NotInitialized)?;
        let result = service.process_batch(self.settings.max_per_cycle)?;

        if !result.success {
            return Err(WorkerError::BatchFailed(
                result
                    .error
                    .unwrap_or_else(|| "no error detail".to_string()),
            ));
        }
        if result.is_idle() {
            tracing::debug!(worker = %self.name, stage = %self.stage, "heartbeat: nothing eligible");
        } else {
            tracing::info!(
                worker = %self.name,
                stage = %self.stage,
                processed = result.processed_count,
                failed = result.failed_count,
                conflicts = result.conflict_count,
                counters = %result.counters_summary(),
                "cycle complete"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use vet_core::config::{
        LicensePolicy, DATABASE_URL, DOWNLOAD_DIR, SCANNER_ENDPOINT, SOURCE_REPOSITORY_URL,
    };
    use vet_core::state::PackageStatus;
    use vet_core::types::{Package, Request};

    use super::*;
    use crate::persistence::SqliteStore;
    use crate::selector::BatchSelector;
    use crate::services::test_support::*;
    use crate::services::{
        ArtifactFetcher, BatchResult, FetchError, ItemOutcome, ScanError, ScanReport,
        VulnerabilityScanner,
    };
    use crate::worker_loop::WorkerLoop;

    /// Advances up to `limit` packages at `from`, or reports a failed batch.
    struct FakeService {
        ctx: ServiceContext,
        from: PackageStatus,
        to: PackageStatus,
        fail: bool,
        limits: Arc<Mutex<Vec<usize>>>,
    }

    impl StageService for FakeService {
        fn process_batch(&mut self, limit: usize) -> Result<BatchResult, ServiceError> {
            self.limits.lock().expect("lock").push(limit);
            if self.fail {
                return Ok(BatchResult::failed("upstream unavailable"));
            }
            let packages = BatchSelector::new(&self.ctx.store).packages_at(self.from, limit)?;
            let outcomes = packages
                .iter()
                .map(|package| self.ctx.advance(package, self.to))
                .collect::<Result<Vec<ItemOutcome>, _>>()?;
            Ok(BatchResult::from_outcomes(&outcomes))
        }
    }

    fn settings(max_per_cycle: usize) -> StageSettings {
        StageSettings {
            sleep: Duration::from_secs(1),
            max_per_cycle,
        }
    }

    /// A file database with one connection for the service and one for asserts.
    fn shared_db(dir: &tempfile::TempDir) -> (ServiceContext, ServiceContext) {
        let path = dir.path().join("workers.sqlite");
        let observer = SqliteStore::open(&path).expect("open observer");
        observer.migrate().expect("migrate");
        let worker_side = SqliteStore::open(&path).expect("open worker");
        (ServiceContext::new(worker_side), ServiceContext::new(observer))
    }

    fn approval_fake(ctx: ServiceContext, fail: bool) -> (FakeService, Arc<Mutex<Vec<usize>>>) {
        let limits = Arc::new(Mutex::new(Vec::new()));
        let service = FakeService {
            ctx,
            from: PackageStatus::SecurityScanned,
            to: PackageStatus::PendingApproval,
            fail,
            limits: Arc::clone(&limits),
        };
        (service, limits)
    }

    #[test]
    fn names_and_required_vars_follow_the_stage() {
        let worker = StageWorker::download(StageSettings::defaults(Stage::Download));
        assert_eq!(worker.name(), "download-worker");
        assert_eq!(worker.stage_env_vars(), &[SOURCE_REPOSITORY_URL, DOWNLOAD_DIR]);

        let shutdown = Arc::new(AtomicBool::new(false));
        let harness = WorkerLoop::new(
            StageWorker::security(StageSettings::defaults(Stage::Security)),
            Duration::from_secs(15),
            shutdown,
        );
        let vars = harness.required_env_vars();
        assert_eq!(vars[0], DATABASE_URL);
        assert!(vars.contains(&SCANNER_ENDPOINT));
        assert!(StageWorker::parse(settings(1)).stage_env_vars().is_empty());
    }

    #[test]
    fn successful_cycle_advances_exactly_processed_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (worker_ctx, observer) = shared_db(&dir);
        let packages = (0..5)
            .map(|offset| {
                seed_package(
                    &observer,
                    offset,
                    &format!("p{offset}"),
                    "1.0.0",
                    &[],
                    PackageStatus::SecurityScanned,
                )
            })
            .collect::<Vec<_>>();
        let (service, limits) = approval_fake(worker_ctx, false);
        let mut worker = StageWorker::with_service(Stage::Approval, settings(3), Box::new(service));
        worker.initialize(&HashMap::<String, String>::new()).expect("init");

        worker.process_cycle().expect("cycle");
        assert_eq!(*limits.lock().expect("lock"), vec![3]);
        let advanced = packages
            .iter()
            .filter(|package| status_of(&observer, package) == PackageStatus::PendingApproval)
            .count();
        assert_eq!(advanced, 3);
    }

    #[test]
    fn failed_batch_changes_nothing_and_surfaces_as_cycle_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (worker_ctx, observer) = shared_db(&dir);
        let package = seed_package(&observer, 0, "p", "1.0.0", &[], PackageStatus::SecurityScanned);
        let (service, limits) = approval_fake(worker_ctx, true);

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut harness = WorkerLoop::new(
            StageWorker::with_service(Stage::Approval, settings(10), Box::new(service)),
            Duration::ZERO,
            shutdown,
        );
        assert!(!harness.run_once(&HashMap::from([(
            DATABASE_URL.to_string(),
            "unused".to_string()
        )]))
        .expect("run once"));

        assert_eq!(limits.lock().expect("lock").len(), 1);
        assert_eq!(
            harness.status().last_error.as_deref(),
            Some("batch reported failure: upstream unavailable")
        );
        assert_eq!(status_of(&observer, &package), PackageStatus::SecurityScanned);
    }

    #[test]
    fn uninitialized_worker_reports_error() {
        let mut worker = StageWorker::new(
            Stage::Parse,
            settings(1),
            service_factory(|_env| {
                Err(ServiceError::Config(ConfigError::MissingEnvVar {
                    name: DATABASE_URL.to_string(),
                }))
            }),
        );
        assert!(matches!(worker.process_cycle(), Err(WorkerError::NotInitialized)));
        assert!(matches!(
            worker.initialize(&HashMap::<String, String>::new()),
            Err(WorkerError::Service(ServiceError::Config(_)))
        ));
    }

    #[test]
    fn factory_builds_service_from_environment() {
        let env = HashMap::from([(DATABASE_URL.to_string(), ":memory:".to_string())]);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut harness = WorkerLoop::new(StageWorker::approval(settings(10)), Duration::ZERO, shutdown);
        assert!(harness.run_once(&env).expect("run once"));
        let status = harness.status();
        assert_eq!(status.name, "approval-worker");
        assert_eq!(status.cycle_count, 1);
        assert_eq!(status.last_error, None);
    }

    #[test]
    fn inconsistent_license_policy_fails_initialization() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policy = dir.path().join("policy.toml");
        fs::write(&policy, "allowed = [\"MIT\"]\ndenied = [\"MIT\"]\n").expect("write policy");
        let env = HashMap::from([
            (DATABASE_URL.to_string(), ":memory:".to_string()),
            (LICENSE_POLICY_PATH.to_string(), policy.display().to_string()),
        ]);

        let mut worker = StageWorker::license(settings(10));
        match worker.initialize(&env) {
            Err(WorkerError::Service(ServiceError::Config(ConfigError::InvalidValue {
                name,
                reason,
                ..
            }))) => {
                assert_eq!(name, LICENSE_POLICY_PATH);
                assert!(reason.contains("both allowed and denied"));
            }
            other => panic!("expected an invalid policy error, got {other:?}"),
        }
        assert!(matches!(worker.process_cycle(), Err(WorkerError::NotInitialized)));
    }

    /// Drops a placeholder artifact into the download directory.
    struct StubFetcher;

    impl ArtifactFetcher for StubFetcher {
        fn fetch(&self, package: &Package, dest_dir: &Path) -> Result<PathBuf, FetchError> {
            let target = dest_dir.join(format!("{}-{}.tar.gz", package.name, package.version));
            fs::create_dir_all(dest_dir)
                .and_then(|()| fs::write(&target, b"tarball bytes"))
                .map_err(|source| FetchError::Io {
                    path: target.clone(),
                    source,
                })?;
            Ok(target)
        }
    }

    struct StubScanner;

    impl VulnerabilityScanner for StubScanner {
        fn scan(&self, _package: &Package, artifact: &Path) -> Result<ScanReport, ScanError> {
            assert!(artifact.is_file(), "scanned before download: {}", artifact.display());
            Ok(ScanReport { findings: 1 })
        }
    }

    #[test]
    fn all_stages_carry_a_request_to_pending_approval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipeline.sqlite");
        let observer = SqliteStore::open(&path).expect("open observer");
        observer.migrate().expect("migrate");
        let connect = || ServiceContext::new(SqliteStore::open(&path).expect("open worker"));

        let request = Request::new("serde==1.0.0 ; license=MIT\n", Utc::now());
        observer.insert_request(&request).expect("submit");

        let workers = vec![
            StageWorker::with_service(
                Stage::Parse,
                settings(10),
                Box::new(ParseService::new(connect())),
            ),
            StageWorker::with_service(
                Stage::License,
                settings(10),
                Box::new(LicenseService::new(connect(), LicensePolicy::default())),
            ),
            StageWorker::with_service(
                Stage::Download,
                settings(10),
                Box::new(DownloadService::new(
                    connect(),
                    Box::new(StubFetcher),
                    dir.path().join("artifacts"),
                )),
            ),
            StageWorker::with_service(
                Stage::Security,
                settings(10),
                Box::new(SecurityService::new(connect(), Box::new(StubScanner))),
            ),
            StageWorker::with_service(
                Stage::Approval,
                settings(10),
                Box::new(ApprovalTransitionService::new(connect())),
            ),
        ];
        let env = HashMap::<String, String>::new();
        for mut worker in workers {
            worker.initialize(&env).expect("init");
            worker.process_cycle().expect("cycle");
        }

        let packages = observer.packages_for_request(&request.id).expect("packages");
        assert_eq!(packages.len(), 1);
        let package = &packages[0];
        assert_eq!(package.coordinate(), "serde@1.0.0");
        assert_eq!(package.status, PackageStatus::PendingApproval);
        assert_eq!(package.security_findings, Some(1));
        assert!(package.artifact_path.is_some());
        assert_eq!(package.attempts, 0);

        let history = observer.status_history(&package.id).expect("history");
        assert_eq!(
            history,
            vec![
                PackageStatus::Requested,
                PackageStatus::Parsed,
                PackageStatus::LicenseChecked,
                PackageStatus::Downloaded,
                PackageStatus::SecurityScanning,
                PackageStatus::SecurityScanned,
                PackageStatus::PendingApproval,
            ]
        );
        assert!(history
            .windows(2)
            .all(|pair| pair[0].rank() < pair[1].rank()));
    }
}
