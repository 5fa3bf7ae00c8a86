//! Security stage: claim, scan, complete.
//!
//! A package is claimed by advancing `Downloaded -> SecurityScanning` before
//! the scanner runs, so two workers never submit the same artifact. The scan
//! completes with `SecurityScanning -> SecurityScanned`. A failed scan
//! releases the claim and is retried on the next cycle. A claim whose worker
//! died mid-scan is taken over once its lease has expired, by a
//! compare-and-set on the claim timestamp.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use vet_core::config::ScannerSettings;
use vet_core::state::PackageStatus;
use vet_core::types::{Package, Stage};

use super::{
    default_claim_lease, lease_cutoff, BatchResult, ItemOutcome, ServiceContext, ServiceError,
    StageService,
};
use crate::selector::BatchSelector;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub findings: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to start scanner {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("scanner timed out after {0:?}")]
    Timeout(Duration),
    #[error("scanner exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("unreadable scanner output: {0}")]
    InvalidOutput(String),
    #[error("scanner io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait VulnerabilityScanner: Send {
    fn scan(&self, package: &Package, artifact: &Path) -> Result<ScanReport, ScanError>;
}

/// Runs the scanner program named by the endpoint once per artifact.
///
/// The endpoint is split on whitespace into a program and leading arguments;
/// the artifact path, package name and version are appended. The program
/// prints the finding count, bare or as `{"findings": n}`, and exits 0.
#[derive(Debug, Clone)]
pub struct CommandScanner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    retry_count: u32,
}

impl CommandScanner {
    pub fn new(endpoint: &str, timeout: Duration, retry_count: u32) -> Self {
        let mut parts = endpoint.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
            timeout,
            retry_count,
        }
    }

    fn run_once(&self, package: &Package, artifact: &Path) -> Result<ScanReport, ScanError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(artifact)
            .arg(&package.name)
            .arg(&package.version)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // The scanner leads its own group so a timeout takes its children too.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);
        let mut child = command
            .spawn()
            .map_err(|source| ScanError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());
        let status = wait_with_timeout(&mut child, self.timeout);

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        let status = status?;
        if !status.success() {
            return Err(ScanError::Failed {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        parse_scan_output(&stdout)
    }
}

impl VulnerabilityScanner for CommandScanner {
    fn scan(&self, package: &Package, artifact: &Path) -> Result<ScanReport, ScanError> {
        let mut attempt = 0;
        loop {
            match self.run_once(package, artifact) {
                Ok(report) => return Ok(report),
                Err(err) if attempt < self.retry_count => {
                    attempt += 1;
                    tracing::debug!(
                        package = %package.coordinate(),
                        attempt,
                        error = %err,
                        "scanner attempt failed; retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut source) = source {
            let _ = source.read_to_string(&mut buffer);
        }
        buffer
    })
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus, ScanError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            kill_process_group(child);
            let _ = child.wait();
            return Err(ScanError::Timeout(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: signals the group the child leads; no memory is shared.
    if unsafe { libc::kill(-pid, libc::SIGKILL) } != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

fn parse_scan_output(stdout: &str) -> Result<ScanReport, ScanError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(ScanReport { findings: 0 });
    }
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|err| ScanError::InvalidOutput(err.to_string()))?;
        let findings = value
            .get("findings")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ScanError::InvalidOutput("missing numeric `findings`".to_string()))?;
        return Ok(ScanReport {
            findings: u32::try_from(findings).unwrap_or(u32::MAX),
        });
    }
    let first = trimmed.split_whitespace().next().unwrap_or_default();
    first
        .parse::<u32>()
        .map(|findings| ScanReport { findings })
        .map_err(|_| ScanError::InvalidOutput(format!("expected a finding count, got `{first}`")))
}

pub struct SecurityService {
    ctx: ServiceContext,
    scanner: Box<dyn VulnerabilityScanner>,
    claim_lease: Duration,
}

impl SecurityService {
    pub fn new(ctx: ServiceContext, scanner: Box<dyn VulnerabilityScanner>) -> Self {
        Self {
            ctx,
            scanner,
            claim_lease: default_claim_lease(),
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn from_settings(ctx: ServiceContext, settings: &ScannerSettings) -> Self {
        let worst_case = settings
            .timeout
            .checked_mul(settings.retry_count.saturating_add(1))
            .unwrap_or(Duration::MAX);
        if settings.claim_lease < worst_case {
            tracing::warn!(
                lease_secs = settings.claim_lease.as_secs(),
                worst_case_secs = worst_case.as_secs(),
                "security claim lease is shorter than a full scan with retries; slow scans may run twice"
            );
        }
        let scanner = CommandScanner::new(&settings.endpoint, settings.timeout, settings.retry_count);
        Self::new(ctx, Box::new(scanner)).with_claim_lease(settings.claim_lease)
    }

    /// Claims up to `limit` packages: released or expired claims first, then
    /// fresh ones.
    fn claim(&self, limit: usize, result: &mut BatchResult) -> Result<Vec<Package>, ServiceError> {
        let selector = BatchSelector::new(&self.ctx.store);
        let cutoff = lease_cutoff(Utc::now(), self.claim_lease);

        let mut claimed = Vec::new();
        for package in selector.claimable(PackageStatus::SecurityScanning, cutoff, limit)? {
            if self.ctx.claim(&package, self.claim_lease)? {
                tracing::info!(package_id = %package.id, package = %package.coordinate(), "reclaimed security scan");
                result.bump("reclaimed", 1);
                claimed.push(package);
            } else {
                result.record(&ItemOutcome::Conflict);
            }
        }

        let fresh = selector.packages_at(
            Stage::Security.precondition(),
            limit.saturating_sub(claimed.len()),
        )?;
        for mut package in fresh {
            match self.ctx.advance(&package, PackageStatus::SecurityScanning)? {
                ItemOutcome::Advanced => {
                    result.bump("claimed", 1);
                    package.status = PackageStatus::SecurityScanning;
                    claimed.push(package);
                }
                other => result.record(&other),
            }
        }
        Ok(claimed)
    }

    fn scan_and_complete(&self, package: &Package, result: &mut BatchResult) -> Result<ItemOutcome, ServiceError> {
        let Some(artifact) = package.artifact_path.as_deref().map(PathBuf::from) else {
            return self.ctx.fail_item_permanently(
                Stage::Security,
                package,
                "no downloaded artifact recorded",
            );
        };
        match self.scanner.scan(package, &artifact) {
            Ok(report) => {
                self.ctx
                    .store
                    .set_security_findings(&package.id, report.findings)?;
                result.bump("findings", report.findings as usize);
                self.ctx.advance(package, Stage::Security.postcondition())
            }
            Err(err) => self.ctx.fail_item(Stage::Security, package, &err.to_string()),
        }
    }
}

impl StageService for SecurityService {
    fn process_batch(&mut self, limit: usize) -> Result<BatchResult, ServiceError> {
        let mut result = BatchResult::empty();
        let claimed = self.claim(limit, &mut result)?;
        for package in &claimed {
            let outcome = self.scan_and_complete(package, &mut result)?;
            result.record(&outcome);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::services::test_support::*;

    #[derive(Clone, Default)]
    struct ScriptedScanner {
        replies: Arc<Mutex<VecDeque<Result<ScanReport, String>>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedScanner {
        fn push(&self, reply: Result<u32, &str>) {
            self.replies.lock().expect("lock").push_back(
                reply
                    .map(|findings| ScanReport { findings })
                    .map_err(str::to_string),
            );
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl VulnerabilityScanner for ScriptedScanner {
        fn scan(&self, _package: &Package, _artifact: &Path) -> Result<ScanReport, ScanError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(Ok(ScanReport { findings: 0 }));
            reply.map_err(|stderr| ScanError::Failed {
                status: "exit status: 2".to_string(),
                stderr,
            })
        }
    }

    fn downloaded(ctx: &ServiceContext, offset: i64, name: &str) -> Package {
        let package = seed_package(ctx, offset, name, "1.0.0", &["MIT"], PackageStatus::Downloaded);
        ctx.store
            .set_artifact_path(&package.id, &format!("/artifacts/{name}-1.0.0.tar.gz"))
            .expect("artifact path");
        package
    }

    #[test]
    fn downloaded_package_is_claimed_scanned_and_completed() {
        let ctx = mk_ctx();
        let package = downloaded(&ctx, 0, "openssl-sys");
        let scanner = ScriptedScanner::default();
        scanner.push(Ok(2));
        let mut service = SecurityService::new(ctx, Box::new(scanner.clone()));

        let result = service.process_batch(10).expect("batch");
        assert!(result.success);
        assert_eq!(result.processed_count, 1);
        assert_eq!(result.counters.get("claimed"), Some(&1));

        let stored = reload(&service.ctx, &package);
        assert_eq!(stored.status, PackageStatus::SecurityScanned);
        assert_eq!(stored.security_findings, Some(2));
        assert_eq!(
            service.ctx.store.status_history(&package.id).expect("history"),
            vec![
                PackageStatus::Requested,
                PackageStatus::SecurityScanning,
                PackageStatus::SecurityScanned,
            ]
        );

        let idle = service.process_batch(10).expect("idle batch");
        assert!(idle.success);
        assert_eq!(idle.processed_count, 0);
        assert!(idle.is_idle());
        assert_eq!(scanner.calls(), 1);
    }

    #[test]
    fn failed_scan_is_retried_on_the_next_cycle() {
        let ctx = mk_ctx();
        let package = downloaded(&ctx, 0, "libxml");
        let scanner = ScriptedScanner::default();
        scanner.push(Err("scanner backend unavailable"));
        let mut service = SecurityService::new(ctx, Box::new(scanner.clone()));

        let first = service.process_batch(10).expect("first batch");
        assert_eq!(first.failed_count, 1);
        let stored = reload(&service.ctx, &package);
        assert_eq!(stored.status, PackageStatus::SecurityScanning);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.claimed_at, None);

        let retried = service.process_batch(10).expect("second batch");
        assert_eq!(retried.counters.get("reclaimed"), Some(&1));
        assert_eq!(retried.processed_count, 1);
        assert_eq!(status_of(&service.ctx, &package), PackageStatus::SecurityScanned);
        assert_eq!(scanner.calls(), 2);
    }

    #[test]
    fn live_scan_is_not_reclaimed_until_its_lease_expires() {
        let ctx = mk_ctx();
        let package = downloaded(&ctx, 0, "libpng");
        assert_eq!(
            ctx.advance(&package, PackageStatus::SecurityScanning)
                .expect("claim"),
            ItemOutcome::Advanced
        );
        let scanner = ScriptedScanner::default();
        let mut service = SecurityService::new(ctx, Box::new(scanner.clone()));

        let held = service.process_batch(10).expect("within lease");
        assert!(held.is_idle());
        assert_eq!(scanner.calls(), 0);

        service.claim_lease = Duration::ZERO;
        let taken_over = service.process_batch(10).expect("after lease");
        assert_eq!(taken_over.counters.get("reclaimed"), Some(&1));
        assert_eq!(taken_over.processed_count, 1);
        assert_eq!(status_of(&service.ctx, &package), PackageStatus::SecurityScanned);
        assert_eq!(scanner.calls(), 1);
    }

    #[test]
    fn claim_cap_includes_reclaimed_packages() {
        let ctx = mk_ctx();
        let retry = downloaded(&ctx, 0, "retry");
        ctx.advance(&retry, PackageStatus::SecurityScanning)
            .expect("claim");
        let retry = reload(&ctx, &retry);
        ctx.fail_item(Stage::Security, &retry, "scanner busy")
            .expect("release");
        for offset in 1..4 {
            downloaded(&ctx, offset, &format!("crate{offset}"));
        }
        let mut service = SecurityService::new(ctx, Box::new(ScriptedScanner::default()));

        let result = service.process_batch(3).expect("batch");
        assert_eq!(result.processed_count, 3);
        assert_eq!(result.counters.get("reclaimed"), Some(&1));
        assert_eq!(result.counters.get("claimed"), Some(&2));
        let remaining = BatchSelector::new(&service.ctx.store)
            .packages_at(PackageStatus::Downloaded, 10)
            .expect("remaining");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "crate3");
    }

    #[test]
    fn missing_artifact_fails_permanently() {
        let ctx = mk_ctx();
        let package = seed_package(&ctx, 0, "phantom", "1.0.0", &["MIT"], PackageStatus::Downloaded);
        let scanner = ScriptedScanner::default();
        let mut service = SecurityService::new(ctx, Box::new(scanner.clone()));

        let result = service.process_batch(10).expect("batch");
        assert_eq!(result.failed_count, 1);
        assert_eq!(scanner.calls(), 0);
        assert!(reload(&service.ctx, &package).failed_permanently);
    }

    #[test]
    fn parses_scanner_output_forms() {
        assert_eq!(parse_scan_output("").expect("empty").findings, 0);
        assert_eq!(parse_scan_output("3\n").expect("bare").findings, 3);
        assert_eq!(
            parse_scan_output(r#"{"findings": 7, "tool": "grype"}"#)
                .expect("json")
                .findings,
            7
        );
        assert!(parse_scan_output("lots").is_err());
        assert!(parse_scan_output(r#"{"count": 1}"#).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_scanner_runs_program_and_kills_its_group_on_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ok_script = dir.path().join("ok.sh");
        std::fs::write(&ok_script, "echo '{\"findings\": 4}'\n").expect("write script");
        let slow_script = dir.path().join("slow.sh");
        // The background sleep keeps the output pipe open after `sh` dies.
        std::fs::write(&slow_script, "sleep 5 &\nsleep 5\n").expect("write script");

        let ctx = mk_ctx();
        let package = downloaded(&ctx, 0, "zlib");
        let artifact = dir.path().join("zlib-1.0.0.tar.gz");

        let scanner = CommandScanner::new(
            &format!("sh {}", ok_script.display()),
            Duration::from_secs(5),
            0,
        );
        assert_eq!(scanner.scan(&package, &artifact).expect("scan").findings, 4);

        let slow = CommandScanner::new(
            &format!("sh {}", slow_script.display()),
            Duration::from_millis(200),
            1,
        );
        let started = Instant::now();
        assert!(matches!(
            slow.scan(&package, &artifact),
            Err(ScanError::Timeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(4));

        let missing = CommandScanner::new("/nonexistent/scanner", Duration::from_secs(1), 0);
        assert!(matches!(
            missing.scan(&package, &artifact),
            Err(ScanError::Spawn { .. })
        ));
    }
}
