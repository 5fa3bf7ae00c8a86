use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use vet_core::events::{Event, EventKind};
use vet_core::state::{PackageStatus, RequestState};
use vet_core::types::{LicenseFingerprint, Package, PackageId, Request, RequestId, Stage};

use crate::state_machine::{predecessor, AdvanceOutcome};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Outcome of recording an item-level failure on a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub attempts: u32,
    pub permanent: bool,
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Open from a storage connection string: a path, `sqlite://<path>`,
    /// `sqlite:<path>` or `:memory:`.
    pub fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let trimmed = database_url.trim();
        let path = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("sqlite:"))
            .unwrap_or(trimmed);
        if path == ":memory:" {
            return Self::open_in_memory();
        }
        Self::open(path)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn migrate(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS requests (
    request_id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    received_at TEXT NOT NULL,
    state TEXT NOT NULL,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_requests_state ON requests(state, received_at);

CREATE TABLE IF NOT EXISTS packages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    package_id TEXT NOT NULL UNIQUE,
    request_id TEXT NOT NULL REFERENCES requests(request_id),
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    licenses_json TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    last_error TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    failed_permanently INTEGER NOT NULL DEFAULT 0,
    claimed_at TEXT,
    artifact_path TEXT,
    security_findings INTEGER,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_packages_request ON packages(request_id);
CREATE INDEX IF NOT EXISTS idx_packages_fingerprint ON packages(fingerprint);

CREATE TABLE IF NOT EXISTS package_status (
    package_id TEXT PRIMARY KEY REFERENCES packages(package_id),
    status TEXT NOT NULL,
    changed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_package_status_status ON package_status(status, changed_at);

CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    request_id TEXT,
    package_id TEXT,
    at TEXT NOT NULL,
    kind_tag TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_package ON events(package_id, seq);
"#,
        )?;
        Ok(())
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` returns `Ok`. Any other exit (an `Err`, or a panic
    /// unwinding through here) drops the transaction, which rolls it back.
    pub fn with_transaction<T, E>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<PersistenceError>,
    {
        let tx = rusqlite::Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(PersistenceError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(PersistenceError::from)?;
        Ok(value)
    }

    // --- Requests ---

    pub fn insert_request(&self, request: &Request) -> Result<(), PersistenceError> {
        self.with_transaction(|conn| {
            conn.execute(
                r#"
INSERT INTO requests (request_id, payload, received_at, state, error)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
                params![
                    request.id.0,
                    request.payload,
                    format_ts(request.received_at),
                    request.state.as_str(),
                    request.error,
                ],
            )?;
            append_event(
                conn,
                &Event::for_request(
                    request.id.clone(),
                    request.received_at,
                    EventKind::RequestReceived,
                ),
            )
        })
    }

    pub fn load_request(&self, request_id: &RequestId) -> Result<Option<Request>, PersistenceError> {
        let raw = self
            .conn
            .query_row(
                &format!("{REQUEST_SELECT} WHERE request_id = ?1"),
                params![request_id.0],
                RawRequest::from_row,
            )
            .optional()?;
        raw.map(RawRequest::into_request).transpose()
    }

    /// Pending requests, oldest first.
    pub fn pending_requests(&self, limit: usize) -> Result<Vec<Request>, PersistenceError> {
        let mut stmt = self.conn.prepare(&format!(
            "{REQUEST_SELECT} WHERE state = ?1 ORDER BY received_at ASC, request_id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![RequestState::Pending.as_str(), limit as i64],
            RawRequest::from_row,
        )?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?.into_request()?);
        }
        Ok(requests)
    }

    /// Consume a pending request, creating its packages at `Requested`.
    ///
    /// Returns `false` without writing anything when the request is no
    /// longer pending (another parse worker consumed it first).
    pub fn expand_request(
        &self,
        request_id: &RequestId,
        packages: &[Package],
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        self.with_transaction(|conn| {
            let claimed = conn.execute(
                "UPDATE requests SET state = ?1, error = NULL WHERE request_id = ?2 AND state = ?3",
                params![
                    RequestState::Parsed.as_str(),
                    request_id.0,
                    RequestState::Pending.as_str()
                ],
            )?;
            if claimed == 0 {
                return Ok(false);
            }
            for package in packages {
                insert_package(conn, package)?;
            }
            append_event(
                conn,
                &Event::for_request(
                    request_id.clone(),
                    at,
                    EventKind::RequestParsed {
                        packages: packages.len(),
                    },
                ),
            )?;
            Ok(true)
        })
    }

    /// Mark a pending request as unparseable. Returns `false` if it was no
    /// longer pending.
    pub fn fail_request(
        &self,
        request_id: &RequestId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        self.with_transaction(|conn| {
            let updated = conn.execute(
                "UPDATE requests SET state = ?1, error = ?2 WHERE request_id = ?3 AND state = ?4",
                params![
                    RequestState::Failed.as_str(),
                    reason,
                    request_id.0,
                    RequestState::Pending.as_str()
                ],
            )?;
            if updated == 0 {
                return Ok(false);
            }
            append_event(
                conn,
                &Event::for_request(
                    request_id.clone(),
                    at,
                    EventKind::RequestFailed {
                        reason: reason.to_string(),
                    },
                ),
            )?;
            Ok(true)
        })
    }

    // --- Packages ---

    /// Insert a package together with its status row.
    pub fn insert_package(&self, package: &Package) -> Result<(), PersistenceError> {
        self.with_transaction(|conn| insert_package(conn, package))
    }

    pub fn load_package(&self, package_id: &PackageId) -> Result<Option<Package>, PersistenceError> {
        let raw = self
            .conn
            .query_row(
                &format!("{PACKAGE_SELECT} WHERE p.package_id = ?1"),
                params![package_id.0],
                RawPackage::from_row,
            )
            .optional()?;
        raw.map(RawPackage::into_package).transpose()
    }

    pub fn packages_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<Package>, PersistenceError> {
        self.query_packages(
            &format!("{PACKAGE_SELECT} WHERE p.request_id = ?1 ORDER BY p.seq ASC"),
            params![request_id.0],
        )
    }

    pub(crate) fn query_packages(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Package>, PersistenceError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, RawPackage::from_row)?;
        let mut packages = Vec::new();
        for row in rows {
            packages.push(row?.into_package()?);
        }
        Ok(packages)
    }

    /// Package counts per status, in pipeline order, zero counts omitted.
    pub fn status_counts(&self) -> Result<Vec<(PackageStatus, usize)>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM package_status GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            let (tag, count) = row?;
            counts.push((parse_status(&tag)?, count as usize));
        }
        counts.sort_by_key(|(status, _)| PackageStatus::ALL.iter().position(|s| s == status));
        Ok(counts)
    }

    pub fn current_status(
        &self,
        package_id: &PackageId,
    ) -> Result<Option<(PackageStatus, DateTime<Utc>)>, PersistenceError> {
        read_status(&self.conn, package_id)
    }

    /// Compare-and-set advance of a package to `next`.
    ///
    /// Inside one immediate transaction: read the status row, then update it
    /// only while it still equals `predecessor(next)`. A successful write
    /// clears the item error state and appends a `StatusChanged` event.
    /// Entering an in-progress status claims the package at `at`; any other
    /// target releases the claim.
    pub fn advance(
        &self,
        package_id: &PackageId,
        next: PackageStatus,
        at: DateTime<Utc>,
    ) -> Result<AdvanceOutcome, PersistenceError> {
        let Some(expected) = predecessor(next) else {
            return Ok(AdvanceOutcome::IllegalTarget);
        };
        self.with_transaction(|conn| {
            let Some((current, _)) = read_status(conn, package_id)? else {
                return Ok(AdvanceOutcome::NotFound);
            };
            let updated = conn.execute(
                "UPDATE package_status SET status = ?1, changed_at = ?2 WHERE package_id = ?3 AND status = ?4",
                params![next.as_str(), format_ts(at), package_id.0, expected.as_str()],
            )?;
            if updated == 0 {
                return Ok(AdvanceOutcome::Conflict { current });
            }
            let claim = next.is_in_progress().then(|| format_ts(at));
            conn.execute(
                "UPDATE packages SET last_error = NULL, attempts = 0, claimed_at = ?1 WHERE package_id = ?2",
                params![claim, package_id.0],
            )?;
            let request_id = read_request_id(conn, package_id)?;
            append_event(
                conn,
                &Event::for_package(
                    request_id,
                    package_id.clone(),
                    at,
                    EventKind::StatusChanged { from: expected, to: next },
                ),
            )?;
            Ok(AdvanceOutcome::Applied { from: expected })
        })
    }

    /// Take the package for work at `status`.
    ///
    /// Succeeds only while the package is still at `status`, is not
    /// permanently failed and holds no claim stamped after `lease_cutoff`.
    /// Two workers racing for the same package get one `true` between them.
    pub fn claim_package(
        &self,
        package_id: &PackageId,
        status: PackageStatus,
        lease_cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        self.with_transaction(|conn| {
            let updated = conn.execute(
                r#"
UPDATE packages
SET claimed_at = ?1
WHERE package_id = ?2
  AND failed_permanently = 0
  AND (claimed_at IS NULL OR claimed_at <= ?3)
  AND (SELECT status FROM package_status WHERE package_id = ?2) = ?4
"#,
                params![
                    format_ts(at),
                    package_id.0,
                    format_ts(lease_cutoff),
                    status.as_str()
                ],
            )?;
            if updated == 0 {
                return Ok(false);
            }
            let request_id = read_request_id(conn, package_id)?;
            append_event(
                conn,
                &Event::for_package(
                    request_id,
                    package_id.clone(),
                    at,
                    EventKind::Claimed { status },
                ),
            )?;
            Ok(true)
        })
    }

    /// Record an item-level failure in place and release any claim. The
    /// status is never touched.
    ///
    /// Applies only while the package is still at `expected`; a failure
    /// reported after the package moved on returns `None`. Once `attempts`
    /// reaches `max_attempts` the package is marked permanently failed and
    /// selectors stop returning it.
    pub fn record_item_failure(
        &self,
        package_id: &PackageId,
        stage: Stage,
        expected: PackageStatus,
        reason: &str,
        max_attempts: u32,
        at: DateTime<Utc>,
    ) -> Result<Option<FailureRecord>, PersistenceError> {
        self.with_transaction(|conn| {
            let row = conn
                .query_row(
                    "SELECT request_id, attempts FROM packages WHERE package_id = ?1",
                    params![package_id.0],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            let Some((request_id, attempts)) = row else {
                return Ok(None);
            };
            let attempts = u32::try_from(attempts + 1).unwrap_or(u32::MAX);
            let permanent = attempts >= max_attempts;
            let updated = conn.execute(
                r#"
UPDATE packages
SET last_error = ?1, attempts = ?2, failed_permanently = ?3, claimed_at = NULL
WHERE package_id = ?4
  AND (SELECT status FROM package_status WHERE package_id = ?4) = ?5
"#,
                params![reason, attempts, permanent, package_id.0, expected.as_str()],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            append_event(
                conn,
                &Event::for_package(
                    RequestId(request_id),
                    package_id.clone(),
                    at,
                    EventKind::ItemFailed {
                        stage,
                        reason: reason.to_string(),
                        attempts,
                        permanent,
                    },
                ),
            )?;
            Ok(Some(FailureRecord {
                attempts,
                permanent,
            }))
        })
    }

    pub fn set_artifact_path(
        &self,
        package_id: &PackageId,
        path: &str,
    ) -> Result<(), PersistenceError> {
        self.conn.execute(
            "UPDATE packages SET artifact_path = ?1 WHERE package_id = ?2",
            params![path, package_id.0],
        )?;
        Ok(())
    }

    pub fn set_security_findings(
        &self,
        package_id: &PackageId,
        findings: u32,
    ) -> Result<(), PersistenceError> {
        self.conn.execute(
            "UPDATE packages SET security_findings = ?1 WHERE package_id = ?2",
            params![findings, package_id.0],
        )?;
        Ok(())
    }

    /// Packages with a recorded error, most attempts first.
    pub fn failing_packages(&self) -> Result<Vec<Package>, PersistenceError> {
        self.query_packages(
            &format!(
                "{PACKAGE_SELECT} WHERE p.last_error IS NOT NULL ORDER BY p.failed_permanently DESC, p.attempts DESC, p.seq ASC"
            ),
            [],
        )
    }

    // --- Events ---

    pub fn events_for_package(
        &self,
        package_id: &PackageId,
    ) -> Result<Vec<Event>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM events WHERE package_id = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![package_id.0], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            let payload = row?;
            events.push(serde_json::from_str::<Event>(&payload)?);
        }
        Ok(events)
    }

    /// Status history of a package as recorded by `StatusChanged` events.
    pub fn status_history(
        &self,
        package_id: &PackageId,
    ) -> Result<Vec<PackageStatus>, PersistenceError> {
        let events = self.events_for_package(package_id)?;
        let mut history = Vec::new();
        for event in events {
            match event.kind {
                EventKind::PackageCreated => history.push(PackageStatus::Requested),
                EventKind::StatusChanged { to, .. } => history.push(to),
                _ => {}
            }
        }
        Ok(history)
    }
}

pub(crate) const PACKAGE_SELECT: &str = r#"
SELECT p.package_id, p.request_id, p.name, p.version, p.licenses_json, p.fingerprint,
       s.status, s.changed_at, p.last_error, p.attempts, p.failed_permanently,
       p.artifact_path, p.security_findings, p.created_at, p.claimed_at
FROM packages p
JOIN package_status s ON s.package_id = p.package_id
JOIN requests r ON r.request_id = p.request_id
"#;

const REQUEST_SELECT: &str =
    "SELECT request_id, payload, received_at, state, error FROM requests";

struct RawRequest {
    id: String,
    payload: String,
    received_at: String,
    state: String,
    error: Option<String>,
}

impl RawRequest {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            received_at: row.get(2)?,
            state: row.get(3)?,
            error: row.get(4)?,
        })
    }

    fn into_request(self) -> Result<Request, PersistenceError> {
        Ok(Request {
            id: RequestId(self.id),
            payload: self.payload,
            received_at: parse_ts(self.received_at)?,
            state: self
                .state
                .parse::<RequestState>()
                .map_err(PersistenceError::Corrupt)?,
            error: self.error,
        })
    }
}

pub(crate) struct RawPackage {
    id: String,
    request_id: String,
    name: String,
    version: String,
    licenses_json: String,
    fingerprint: String,
    status: String,
    changed_at: String,
    last_error: Option<String>,
    attempts: i64,
    failed_permanently: bool,
    artifact_path: Option<String>,
    security_findings: Option<i64>,
    created_at: String,
    claimed_at: Option<String>,
}

impl RawPackage {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_id: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            licenses_json: row.get(4)?,
            fingerprint: row.get(5)?,
            status: row.get(6)?,
            changed_at: row.get(7)?,
            last_error: row.get(8)?,
            attempts: row.get(9)?,
            failed_permanently: row.get(10)?,
            artifact_path: row.get(11)?,
            security_findings: row.get(12)?,
            created_at: row.get(13)?,
            claimed_at: row.get(14)?,
        })
    }

    pub(crate) fn into_package(self) -> Result<Package, PersistenceError> {
        Ok(Package {
            id: PackageId(self.id),
            request_id: RequestId(self.request_id),
            name: self.name,
            version: self.version,
            licenses: serde_json::from_str(&self.licenses_json)?,
            fingerprint: LicenseFingerprint(self.fingerprint),
            status: parse_status(&self.status)?,
            status_changed_at: parse_ts(self.changed_at)?,
            last_error: self.last_error,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| PersistenceError::Corrupt(format!("attempts {}", self.attempts)))?,
            failed_permanently: self.failed_permanently,
            claimed_at: self.claimed_at.map(parse_ts).transpose()?,
            artifact_path: self.artifact_path,
            security_findings: self
                .security_findings
                .map(|value| u32::try_from(value).unwrap_or(u32::MAX)),
            created_at: parse_ts(self.created_at)?,
        })
    }
}

fn insert_package(conn: &Connection, package: &Package) -> Result<(), PersistenceError> {
    conn.execute(
        r#"
INSERT INTO packages (package_id, request_id, name, version, licenses_json, fingerprint,
                      last_error, attempts, failed_permanently, artifact_path, security_findings, created_at,
                      claimed_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
"#,
        params![
            package.id.0,
            package.request_id.0,
            package.name,
            package.version,
            serde_json::to_string(&package.licenses)?,
            package.fingerprint.0,
            package.last_error,
            package.attempts,
            package.failed_permanently,
            package.artifact_path,
            package.security_findings,
            format_ts(package.created_at),
            package.claimed_at.map(format_ts),
        ],
    )?;
    conn.execute(
        "INSERT INTO package_status (package_id, status, changed_at) VALUES (?1, ?2, ?3)",
        params![
            package.id.0,
            package.status.as_str(),
            format_ts(package.status_changed_at)
        ],
    )?;
    append_event(
        conn,
        &Event::for_package(
            package.request_id.clone(),
            package.id.clone(),
            package.created_at,
            EventKind::PackageCreated,
        ),
    )
}

fn read_status(
    conn: &Connection,
    package_id: &PackageId,
) -> Result<Option<(PackageStatus, DateTime<Utc>)>, PersistenceError> {
    let row = conn
        .query_row(
            "SELECT status, changed_at FROM package_status WHERE package_id = ?1",
            params![package_id.0],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    row.map(|(status, changed_at)| Ok((parse_status(&status)?, parse_ts(changed_at)?)))
        .transpose()
}

fn read_request_id(conn: &Connection, package_id: &PackageId) -> Result<RequestId, PersistenceError> {
    let id: String = conn.query_row(
        "SELECT request_id FROM packages WHERE package_id = ?1",
        params![package_id.0],
        |row| row.get(0),
    )?;
    Ok(RequestId(id))
}

fn append_event(conn: &Connection, event: &Event) -> Result<(), PersistenceError> {
    let payload = serde_json::to_string(event)?;
    conn.execute(
        r#"
INSERT INTO events (event_id, request_id, package_id, at, kind_tag, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
        params![
            event.id.0,
            event.request_id.as_ref().map(|id| id.0.clone()),
            event.package_id.as_ref().map(|id| id.0.clone()),
            format_ts(event.at),
            event.kind.tag(),
            payload,
        ],
    )?;
    Ok(())
}

fn parse_status(tag: &str) -> Result<PackageStatus, PersistenceError> {
    tag.parse::<PackageStatus>()
        .map_err(PersistenceError::Corrupt)
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub(crate) fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: String) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| PersistenceError::TimestampParse { value, source })
}
