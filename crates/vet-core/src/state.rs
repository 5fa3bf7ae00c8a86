//! Package lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a package moving through the compliance pipeline.
///
/// Variants are declared in pipeline order; `rank()` exposes that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageStatus {
    /// Extracted from a request, not yet validated
    Requested,
    /// Name and version validated
    Parsed,
    /// License policy passed
    LicenseChecked,
    /// Artifact fetched from the source repository
    Downloaded,
    /// Claimed by a security worker, scan in flight
    SecurityScanning,
    /// Scan completed
    SecurityScanned,
    /// Waiting on a human approver
    PendingApproval,
    Approved,
    Rejected,
}

impl PackageStatus {
    pub const ALL: [PackageStatus; 9] = [
        PackageStatus::Requested,
        PackageStatus::Parsed,
        PackageStatus::LicenseChecked,
        PackageStatus::Downloaded,
        PackageStatus::SecurityScanning,
        PackageStatus::SecurityScanned,
        PackageStatus::PendingApproval,
        PackageStatus::Approved,
        PackageStatus::Rejected,
    ];

    /// Stable tag used in storage and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            PackageStatus::Requested => "REQUESTED",
            PackageStatus::Parsed => "PARSED",
            PackageStatus::LicenseChecked => "LICENSE_CHECKED",
            PackageStatus::Downloaded => "DOWNLOADED",
            PackageStatus::SecurityScanning => "SECURITY_SCANNING",
            PackageStatus::SecurityScanned => "SECURITY_SCANNED",
            PackageStatus::PendingApproval => "PENDING_APPROVAL",
            PackageStatus::Approved => "APPROVED",
            PackageStatus::Rejected => "REJECTED",
        }
    }

    /// Position along the pipeline. Both terminal decisions share a rank.
    pub fn rank(self) -> u8 {
        match self {
            PackageStatus::Requested => 0,
            PackageStatus::Parsed => 1,
            PackageStatus::LicenseChecked => 2,
            PackageStatus::Downloaded => 3,
            PackageStatus::SecurityScanning => 4,
            PackageStatus::SecurityScanned => 5,
            PackageStatus::PendingApproval => 6,
            PackageStatus::Approved | PackageStatus::Rejected => 7,
        }
    }

    /// Returns true once a human decision has been recorded.
    pub fn is_terminal(self) -> bool {
        matches!(self, PackageStatus::Approved | PackageStatus::Rejected)
    }

    /// Work is in flight: entering this status takes a claim on the package.
    pub fn is_in_progress(self) -> bool {
        matches!(self, PackageStatus::SecurityScanning)
    }
}

impl std::fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PackageStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        PackageStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("invalid package status '{value}'"))
    }
}

/// Parse state of an uploaded manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    Pending,
    Parsed,
    Failed,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Parsed => "parsed",
            RequestState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(RequestState::Pending),
            "parsed" => Ok(RequestState::Parsed),
            "failed" => Ok(RequestState::Failed),
            other => Err(format!(
                "invalid request state '{other}'. valid values: pending, parsed, failed"
            )),
        }
    }
}
