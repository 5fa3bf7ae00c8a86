//! Environment-driven configuration for the pipeline workers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Stage;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const SOURCE_REPOSITORY_URL: &str = "SOURCE_REPOSITORY_URL";
pub const DOWNLOAD_DIR: &str = "DOWNLOAD_DIR";
pub const SCANNER_ENDPOINT: &str = "SCANNER_ENDPOINT";
pub const SCANNER_TIMEOUT_SECS: &str = "SCANNER_TIMEOUT_SECS";
pub const SCANNER_RETRY_COUNT: &str = "SCANNER_RETRY_COUNT";
pub const LICENSE_POLICY_PATH: &str = "LICENSE_POLICY_PATH";
pub const MAX_ITEM_ATTEMPTS: &str = "MAX_ITEM_ATTEMPTS";
pub const SECURITY_CLAIM_LEASE_SECS: &str = "SECURITY_CLAIM_LEASE_SECS";
pub const DOWNLOAD_CLAIM_LEASE_SECS: &str = "DOWNLOAD_CLAIM_LEASE_SECS";

/// Variables every worker needs, whatever its stage.
pub const BASE_REQUIRED_ENV_VARS: &[&str] = &[DATABASE_URL];

pub const DEFAULT_MAX_ITEM_ATTEMPTS: u32 = 5;
pub const DEFAULT_CLAIM_LEASE_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {name}")]
    MissingEnvVar { name: String },
    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Source of configuration variables.
pub trait EnvSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Fetch a variable that must be present and non-empty.
pub fn require_var(env: &dyn EnvSource, name: &str) -> Result<String, ConfigError> {
    match env.var(name) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar {
            name: name.to_string(),
        }),
    }
}

/// Returns the names from `names` that are absent (or blank) in `env`.
pub fn missing_vars(env: &dyn EnvSource, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .filter(|name| require_var(env, name).is_err())
        .map(|name| name.to_string())
        .collect()
}

/// Parse an optional positive integer, falling back to `default` when unset.
pub fn positive_var(env: &dyn EnvSource, name: &str, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = env.var(name) else {
        return Ok(default);
    };
    let parsed = raw
        .trim()
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw.clone(),
            reason: err.to_string(),
        })?;
    if parsed == 0 {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

/// Sleep interval and per-cycle cap for one stage worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSettings {
    pub sleep: Duration,
    /// Packages per cycle; license groups per cycle for the license stage.
    pub max_per_cycle: usize,
}

impl StageSettings {
    pub fn defaults(stage: Stage) -> Self {
        let (sleep_secs, max_per_cycle) = match stage {
            Stage::Parse => (10, 50),
            Stage::License => (15, 20),
            Stage::Download => (10, 10),
            Stage::Security => (15, 10),
            Stage::Approval => (30, 100),
        };
        Self {
            sleep: Duration::from_secs(sleep_secs),
            max_per_cycle,
        }
    }

    pub fn from_env(stage: Stage, env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let defaults = Self::defaults(stage);
        let sleep_secs = positive_var(env, &sleep_var(stage), defaults.sleep.as_secs())?;
        let max_per_cycle =
            positive_var(env, &max_per_cycle_var(stage), defaults.max_per_cycle as u64)?;
        Ok(Self {
            sleep: Duration::from_secs(sleep_secs),
            max_per_cycle: max_per_cycle as usize,
        })
    }
}

pub fn sleep_var(stage: Stage) -> String {
    format!("VET_{}_SLEEP_SECS", stage.as_str().to_uppercase())
}

pub fn max_per_cycle_var(stage: Stage) -> String {
    format!("VET_{}_MAX_PER_CYCLE", stage.as_str().to_uppercase())
}

/// Variables a stage needs on top of [`BASE_REQUIRED_ENV_VARS`].
pub fn stage_env_vars(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Download => &[SOURCE_REPOSITORY_URL, DOWNLOAD_DIR],
        Stage::Security => &[SCANNER_ENDPOINT, SCANNER_TIMEOUT_SECS, SCANNER_RETRY_COUNT],
        Stage::Parse | Stage::License | Stage::Approval => &[],
    }
}

/// Retry ceiling shared by every stage service.
pub fn max_item_attempts(env: &dyn EnvSource) -> Result<u32, ConfigError> {
    let value = positive_var(env, MAX_ITEM_ATTEMPTS, u64::from(DEFAULT_MAX_ITEM_ATTEMPTS))?;
    u32::try_from(value).map_err(|_| ConfigError::InvalidValue {
        name: MAX_ITEM_ATTEMPTS.to_string(),
        value: value.to_string(),
        reason: "out of range".to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub source_repository_url: String,
    pub download_dir: PathBuf,
    /// How long a claimed download is protected from other workers.
    pub claim_lease: Duration,
}

impl DownloadSettings {
    pub fn from_env(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            source_repository_url: require_var(env, SOURCE_REPOSITORY_URL)?,
            download_dir: PathBuf::from(require_var(env, DOWNLOAD_DIR)?),
            claim_lease: Duration::from_secs(positive_var(
                env,
                DOWNLOAD_CLAIM_LEASE_SECS,
                DEFAULT_CLAIM_LEASE_SECS,
            )?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerSettings {
    pub endpoint: String,
    pub timeout: Duration,
    pub retry_count: u32,
    pub claim_lease: Duration,
}

impl ScannerSettings {
    pub fn from_env(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let endpoint = require_var(env, SCANNER_ENDPOINT)?;
        let timeout_raw = require_var(env, SCANNER_TIMEOUT_SECS)?;
        let timeout_secs = parse_u64(SCANNER_TIMEOUT_SECS, &timeout_raw)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: SCANNER_TIMEOUT_SECS.to_string(),
                value: timeout_raw,
                reason: "must be greater than zero".to_string(),
            });
        }
        let retries_raw = require_var(env, SCANNER_RETRY_COUNT)?;
        let retry_count = parse_u64(SCANNER_RETRY_COUNT, &retries_raw)?;
        let retry_count = u32::try_from(retry_count).map_err(|_| ConfigError::InvalidValue {
            name: SCANNER_RETRY_COUNT.to_string(),
            value: retries_raw,
            reason: "out of range".to_string(),
        })?;
        let lease_secs = positive_var(env, SECURITY_CLAIM_LEASE_SECS, DEFAULT_CLAIM_LEASE_SECS)?;
        Ok(Self {
            endpoint,
            timeout: Duration::from_secs(timeout_secs),
            retry_count,
            claim_lease: Duration::from_secs(lease_secs),
        })
    }
}

fn parse_u64(name: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw.to_string(),
            reason: err.to_string(),
        })
}

/// License policy evaluated once per fingerprint group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicensePolicy {
    /// SPDX identifiers that pass on their own.
    pub allowed: BTreeSet<String>,
    /// SPDX identifiers that fail a package outright.
    #[serde(default)]
    pub denied: BTreeSet<String>,
    /// Whether a package with no resolved license may pass.
    #[serde(default)]
    pub allow_unlicensed: bool,
}

impl Default for LicensePolicy {
    fn default() -> Self {
        let allowed = [
            "MIT",
            "Apache-2.0",
            "BSD-2-Clause",
            "BSD-3-Clause",
            "ISC",
            "Zlib",
            "Unicode-DFS-2016",
            "MPL-2.0",
        ];
        let denied = ["GPL-2.0", "GPL-3.0", "AGPL-3.0", "SSPL-1.0"];
        Self {
            allowed: allowed.iter().map(|id| id.to_string()).collect(),
            denied: denied.iter().map(|id| id.to_string()).collect(),
            allow_unlicensed: false,
        }
    }
}

pub fn parse_license_policy(contents: &str) -> Result<LicensePolicy, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_license_policy(path: impl AsRef<Path>) -> Result<LicensePolicy, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_license_policy(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// Policy from `LICENSE_POLICY_PATH` when set, the built-in default otherwise.
pub fn license_policy_from_env(env: &dyn EnvSource) -> Result<LicensePolicy, ConfigError> {
    match env.var(LICENSE_POLICY_PATH) {
        Some(path) if !path.trim().is_empty() => load_license_policy(path.trim()),
        _ => Ok(LicensePolicy::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn stage_defaults_match_documented_cadence() {
        let secs = Stage::ALL
            .iter()
            .map(|stage| StageSettings::defaults(*stage).sleep.as_secs())
            .collect::<Vec<_>>();
        assert_eq!(secs, vec![10, 15, 10, 15, 30]);
    }

    #[test]
    fn stage_settings_read_overrides_from_env() {
        let vars = env(&[
            ("VET_LICENSE_SLEEP_SECS", "3"),
            ("VET_LICENSE_MAX_PER_CYCLE", "7"),
        ]);
        let settings = StageSettings::from_env(Stage::License, &vars).expect("settings");
        assert_eq!(settings.sleep, Duration::from_secs(3));
        assert_eq!(settings.max_per_cycle, 7);

        let untouched = StageSettings::from_env(Stage::Parse, &vars).expect("defaults");
        assert_eq!(untouched, StageSettings::defaults(Stage::Parse));
    }

    #[test]
    fn stage_settings_reject_zero_and_garbage() {
        let zero = env(&[("VET_DOWNLOAD_MAX_PER_CYCLE", "0")]);
        assert!(matches!(
            StageSettings::from_env(Stage::Download, &zero),
            Err(ConfigError::InvalidValue { .. })
        ));

        let garbage = env(&[("VET_DOWNLOAD_SLEEP_SECS", "soon")]);
        let err = StageSettings::from_env(Stage::Download, &garbage).expect_err("garbage");
        assert!(err.to_string().contains("VET_DOWNLOAD_SLEEP_SECS"));
    }

    #[test]
    fn missing_vars_treats_blank_as_absent() {
        let vars = env(&[(DATABASE_URL, "  "), (SCANNER_ENDPOINT, "scan")]);
        let missing = missing_vars(&vars, &[DATABASE_URL, SCANNER_ENDPOINT, SCANNER_TIMEOUT_SECS]);
        assert_eq!(
            missing,
            vec![DATABASE_URL.to_string(), SCANNER_TIMEOUT_SECS.to_string()]
        );
    }

    #[test]
    fn stage_env_vars_extend_per_stage() {
        assert!(stage_env_vars(Stage::Parse).is_empty());
        assert_eq!(
            stage_env_vars(Stage::Download),
            &[SOURCE_REPOSITORY_URL, DOWNLOAD_DIR]
        );
        assert_eq!(stage_env_vars(Stage::Security).len(), 3);
    }

    #[test]
    fn scanner_settings_parse_timeout_retries_and_lease() {
        let vars = env(&[
            (SCANNER_ENDPOINT, "/usr/bin/scan"),
            (SCANNER_TIMEOUT_SECS, "30"),
            (SCANNER_RETRY_COUNT, "0"),
        ]);
        let settings = ScannerSettings::from_env(&vars).expect("scanner");
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.retry_count, 0);
        assert_eq!(settings.claim_lease, Duration::from_secs(DEFAULT_CLAIM_LEASE_SECS));

        let no_timeout = env(&[(SCANNER_ENDPOINT, "/usr/bin/scan"), (SCANNER_RETRY_COUNT, "1")]);
        assert!(matches!(
            ScannerSettings::from_env(&no_timeout),
            Err(ConfigError::MissingEnvVar { name }) if name == SCANNER_TIMEOUT_SECS
        ));
    }

    #[test]
    fn download_settings_read_lease_override() {
        let vars = env(&[
            (SOURCE_REPOSITORY_URL, "file:///srv/mirror"),
            (DOWNLOAD_DIR, "/var/lib/vet/artifacts"),
        ]);
        let settings = DownloadSettings::from_env(&vars).expect("download");
        assert_eq!(settings.download_dir, PathBuf::from("/var/lib/vet/artifacts"));
        assert_eq!(settings.claim_lease, Duration::from_secs(DEFAULT_CLAIM_LEASE_SECS));

        let vars = env(&[
            (SOURCE_REPOSITORY_URL, "file:///srv/mirror"),
            (DOWNLOAD_DIR, "/var/lib/vet/artifacts"),
            (DOWNLOAD_CLAIM_LEASE_SECS, "90"),
        ]);
        let settings = DownloadSettings::from_env(&vars).expect("download");
        assert_eq!(settings.claim_lease, Duration::from_secs(90));
    }

    #[test]
    fn max_item_attempts_defaults_and_overrides() {
        assert_eq!(max_item_attempts(&env(&[])).expect("default"), 5);
        assert_eq!(
            max_item_attempts(&env(&[(MAX_ITEM_ATTEMPTS, "2")])).expect("override"),
            2
        );
    }

    #[test]
    fn parses_license_policy_toml() {
        let policy = parse_license_policy(
            r#"
allowed = ["MIT", "Apache-2.0"]
denied = ["GPL-3.0"]
allow_unlicensed = true
"#,
        )
        .expect("parse policy");
        assert!(policy.allowed.contains("MIT"));
        assert!(policy.denied.contains("GPL-3.0"));
        assert!(policy.allow_unlicensed);

        let minimal = parse_license_policy("allowed = [\"ISC\"]").expect("minimal");
        assert!(minimal.denied.is_empty());
        assert!(!minimal.allow_unlicensed);
    }

    #[test]
    fn license_policy_falls_back_to_default_when_unset() {
        let policy = license_policy_from_env(&env(&[])).expect("default policy");
        assert_eq!(policy, LicensePolicy::default());
    }

    #[test]
    fn load_license_policy_reports_missing_file() {
        let err = load_license_policy("/nonexistent/vet/policy.toml").expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
