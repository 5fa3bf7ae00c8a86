//! Core types for the compliance pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{PackageStatus, RequestState};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId(pub String);

impl PackageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PackageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Raw uploaded manifest, consumed exactly once by the parse stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub payload: String,
    pub received_at: DateTime<Utc>,
    pub state: RequestState,
    #[serde(default)]
    pub error: Option<String>,
}

impl Request {
    pub fn new(payload: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::generate(),
            payload: payload.into(),
            received_at,
            state: RequestState::Pending,
            error: None,
        }
    }
}

/// Dedup key for license evaluation: name + version + resolved license set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LicenseFingerprint(pub String);

impl LicenseFingerprint {
    /// License order and duplicates do not affect the fingerprint.
    pub fn compute(name: &str, version: &str, licenses: &[String]) -> Self {
        let mut normalized = licenses
            .iter()
            .map(|license| license.trim().to_string())
            .filter(|license| !license.is_empty())
            .collect::<Vec<_>>();
        normalized.sort();
        normalized.dedup();
        Self(format!(
            "{}@{}#{}",
            name.trim().to_lowercase(),
            version.trim(),
            normalized.join("+")
        ))
    }
}

impl std::fmt::Display for LicenseFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One resolved dependency+version extracted from a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub request_id: RequestId,
    pub name: String,
    pub version: String,
    pub licenses: Vec<String>,
    pub fingerprint: LicenseFingerprint,
    pub status: PackageStatus,
    pub status_changed_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub failed_permanently: bool,
    /// Set while a worker holds the package; cleared on success or failure.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub artifact_path: Option<String>,
    pub security_findings: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Package {
    pub fn new(
        request_id: RequestId,
        name: impl Into<String>,
        version: impl Into<String>,
        licenses: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        let version = version.into();
        let fingerprint = LicenseFingerprint::compute(&name, &version, &licenses);
        Self {
            id: PackageId::generate(),
            request_id,
            name,
            version,
            licenses,
            fingerprint,
            status: PackageStatus::Requested,
            status_changed_at: created_at,
            last_error: None,
            attempts: 0,
            failed_permanently: false,
            claimed_at: None,
            artifact_path: None,
            security_findings: None,
            created_at,
        }
    }

    /// `name@version`, used in logs.
    pub fn coordinate(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// One phase of the pipeline, each driven by its own polling worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    License,
    Download,
    Security,
    Approval,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Parse,
        Stage::License,
        Stage::Download,
        Stage::Security,
        Stage::Approval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::License => "license",
            Stage::Download => "download",
            Stage::Security => "security",
            Stage::Approval => "approval",
        }
    }

    /// Status a package must hold to be picked up by this stage.
    pub fn precondition(self) -> PackageStatus {
        match self {
            Stage::Parse => PackageStatus::Requested,
            Stage::License => PackageStatus::Parsed,
            Stage::Download => PackageStatus::LicenseChecked,
            Stage::Security => PackageStatus::Downloaded,
            Stage::Approval => PackageStatus::SecurityScanned,
        }
    }

    /// Status a package holds once this stage succeeds for it.
    pub fn postcondition(self) -> PackageStatus {
        match self {
            Stage::Parse => PackageStatus::Parsed,
            Stage::License => PackageStatus::LicenseChecked,
            Stage::Download => PackageStatus::Downloaded,
            Stage::Security => PackageStatus::SecurityScanned,
            Stage::Approval => PackageStatus::PendingApproval,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "parse" => Ok(Stage::Parse),
            "license" => Ok(Stage::License),
            "download" => Ok(Stage::Download),
            "security" => Ok(Stage::Security),
            "approval" => Ok(Stage::Approval),
            other => Err(format!(
                "invalid stage '{other}'. valid values: parse, license, download, security, approval"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_license_order_and_duplicates() {
        let a = LicenseFingerprint::compute(
            "Requests",
            "2.31.0",
            &["MIT".to_string(), "Apache-2.0".to_string()],
        );
        let b = LicenseFingerprint::compute(
            "requests",
            "2.31.0",
            &[
                "Apache-2.0".to_string(),
                " MIT ".to_string(),
                "MIT".to_string(),
            ],
        );
        assert_eq!(a, b);
        assert_eq!(a.0, "requests@2.31.0#Apache-2.0+MIT");
    }

    #[test]
    fn fingerprint_distinguishes_versions_and_license_sets() {
        let base = LicenseFingerprint::compute("left-pad", "1.0.0", &["MIT".to_string()]);
        let other_version = LicenseFingerprint::compute("left-pad", "1.0.1", &["MIT".to_string()]);
        let other_license = LicenseFingerprint::compute("left-pad", "1.0.0", &["ISC".to_string()]);
        let no_license = LicenseFingerprint::compute("left-pad", "1.0.0", &[]);
        assert_ne!(base, other_version);
        assert_ne!(base, other_license);
        assert_ne!(base, no_license);
        assert_eq!(no_license.0, "left-pad@1.0.0#");
    }

    #[test]
    fn new_package_starts_requested_with_fingerprint() {
        let now = Utc::now();
        let pkg = Package::new(
            RequestId::new("R1"),
            "serde",
            "1.0.200",
            vec!["MIT".to_string(), "Apache-2.0".to_string()],
            now,
        );
        assert_eq!(pkg.status, PackageStatus::Requested);
        assert_eq!(pkg.attempts, 0);
        assert!(!pkg.failed_permanently);
        assert_eq!(pkg.status_changed_at, now);
        assert_eq!(pkg.fingerprint.0, "serde@1.0.200#Apache-2.0+MIT");
        assert_eq!(pkg.coordinate(), "serde@1.0.200");
    }

    #[test]
    fn stage_conditions_chain_along_the_pipeline() {
        for pair in Stage::ALL.windows(2) {
            let (current, next) = (pair[0], pair[1]);
            assert_eq!(current.postcondition(), next.precondition());
        }
        assert_eq!(Stage::Security.precondition(), PackageStatus::Downloaded);
        assert_eq!(Stage::Security.postcondition(), PackageStatus::SecurityScanned);
    }

    #[test]
    fn stage_parses_from_str() {
        assert_eq!("Download".parse::<Stage>(), Ok(Stage::Download));
        assert!("audit".parse::<Stage>().is_err());
    }
}
