use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::PackageStatus;
use crate::types::{EventId, PackageId, RequestId, Stage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RequestReceived,
    RequestParsed {
        packages: usize,
    },
    RequestFailed {
        reason: String,
    },
    PackageCreated,
    StatusChanged {
        from: PackageStatus,
        to: PackageStatus,
    },
    /// A worker took (or took over) the package at `status`.
    Claimed {
        status: PackageStatus,
    },
    ItemFailed {
        stage: Stage,
        reason: String,
        attempts: u32,
        permanent: bool,
    },
}

impl EventKind {
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::RequestReceived => "request_received",
            EventKind::RequestParsed { .. } => "request_parsed",
            EventKind::RequestFailed { .. } => "request_failed",
            EventKind::PackageCreated => "package_created",
            EventKind::StatusChanged { .. } => "status_changed",
            EventKind::Claimed { .. } => "claimed",
            EventKind::ItemFailed { .. } => "item_failed",
        }
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub request_id: Option<RequestId>,
    pub package_id: Option<PackageId>,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn for_package(
        request_id: RequestId,
        package_id: PackageId,
        at: DateTime<Utc>,
        kind: EventKind,
    ) -> Self {
        Self {
            id: EventId::generate(),
            request_id: Some(request_id),
            package_id: Some(package_id),
            at,
            kind,
        }
    }

    pub fn for_request(request_id: RequestId, at: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            id: EventId::generate(),
            request_id: Some(request_id),
            package_id: None,
            at,
            kind,
        }
    }
}
