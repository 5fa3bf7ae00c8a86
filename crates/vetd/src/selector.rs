//! Per-cycle batch selection.
//!
//! Every query re-reads eligibility from storage; nothing is cached between
//! cycles. Ordering is oldest request first, then package creation order.

use chrono::{DateTime, Utc};
use rusqlite::params;
use vet_core::state::PackageStatus;
use vet_core::types::{LicenseFingerprint, Package, Request};

use crate::persistence::{format_ts, PersistenceError, SqliteStore, PACKAGE_SELECT};

/// Packages sharing one license fingerprint; evaluated once, ruled together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseGroup {
    pub fingerprint: LicenseFingerprint,
    pub members: Vec<Package>,
}

impl LicenseGroup {
    /// Representative member; all members share name, version and licenses.
    pub fn head(&self) -> Option<&Package> {
        self.members.first()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSelector<'a> {
    store: &'a SqliteStore,
}

impl<'a> BatchSelector<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self { store }
    }

    /// Up to `limit` retryable packages at `status`, oldest request first.
    pub fn packages_at(
        &self,
        status: PackageStatus,
        limit: usize,
    ) -> Result<Vec<Package>, PersistenceError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.query_packages(
            &format!(
                "{PACKAGE_SELECT} WHERE s.status = ?1 AND p.failed_permanently = 0 \
                 ORDER BY r.received_at ASC, p.seq ASC LIMIT ?2"
            ),
            params![status.as_str(), limit as i64],
        )
    }

    /// Up to `max_groups` distinct fingerprint groups of `Parsed` packages.
    ///
    /// The cap bounds groups, not packages: every eligible member of a
    /// selected group is returned.
    pub fn license_groups(&self, max_groups: usize) -> Result<Vec<LicenseGroup>, PersistenceError> {
        if max_groups == 0 {
            return Ok(Vec::new());
        }
        let status = PackageStatus::Parsed;
        let fingerprints = {
            let mut stmt = self.store.conn().prepare(
                r#"
SELECT p.fingerprint
FROM packages p
JOIN package_status s ON s.package_id = p.package_id
JOIN requests r ON r.request_id = p.request_id
WHERE s.status = ?1 AND p.failed_permanently = 0
GROUP BY p.fingerprint
ORDER BY MIN(r.received_at) ASC, MIN(p.seq) ASC
LIMIT ?2
"#,
            )?;
            let rows = stmt.query_map(params![status.as_str(), max_groups as i64], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut groups = Vec::with_capacity(fingerprints.len());
        for fingerprint in fingerprints {
            let members = self.store.query_packages(
                &format!(
                    "{PACKAGE_SELECT} WHERE s.status = ?1 AND p.failed_permanently = 0 \
                     AND p.fingerprint = ?2 ORDER BY r.received_at ASC, p.seq ASC"
                ),
                params![status.as_str(), fingerprint],
            )?;
            if members.is_empty() {
                continue;
            }
            groups.push(LicenseGroup {
                fingerprint: LicenseFingerprint(fingerprint),
                members,
            });
        }
        Ok(groups)
    }

    /// Packages at `status` nobody holds: never claimed, released by a
    /// failure, or claimed at or before `lease_cutoff`.
    pub fn claimable(
        &self,
        status: PackageStatus,
        lease_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Package>, PersistenceError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.query_packages(
            &format!(
                "{PACKAGE_SELECT} WHERE s.status = ?1 AND p.failed_permanently = 0 \
                 AND (p.claimed_at IS NULL OR p.claimed_at <= ?2) \
                 ORDER BY r.received_at ASC, p.seq ASC LIMIT ?3"
            ),
            params![status.as_str(), format_ts(lease_cutoff), limit as i64],
        )
    }

    /// Up to `limit` pending requests, oldest first.
    pub fn pending_requests(&self, limit: usize) -> Result<Vec<Request>, PersistenceError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.pending_requests(limit)
    }
}
