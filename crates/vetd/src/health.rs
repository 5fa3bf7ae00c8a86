use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::worker_loop::WorkerStatus;

/// Intervals a worker may miss before it counts as stalled.
const STALL_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub name: String,
    pub status: HealthStatus,
    pub cycle_count: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub version: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub workers: Vec<WorkerHealth>,
}

impl PipelineHealth {
    /// Aggregate worker snapshots; the worst worker decides the pipeline status.
    pub fn evaluate(
        snapshots: &[WorkerStatus],
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let workers = snapshots
            .iter()
            .map(|snapshot| worker_health(snapshot, now))
            .collect::<Vec<_>>();
        let status = workers
            .iter()
            .map(|worker| worker.status)
            .fold(HealthStatus::Healthy, max_health_status);
        Self {
            status,
            uptime_secs: (now - started_at).num_seconds().max(0) as u64,
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            started_at,
            workers,
        }
    }

    pub fn display_compact(&self) -> String {
        let healthy = self
            .workers
            .iter()
            .filter(|worker| worker.status == HealthStatus::Healthy)
            .count();
        let cycles = self
            .workers
            .iter()
            .map(|worker| worker.cycle_count)
            .sum::<u64>();
        let mut line = format!(
            "status={} uptime={} workers={}/{} cycles={}",
            health_status_label(self.status),
            format_uptime(self.uptime_secs),
            healthy,
            self.workers.len(),
            cycles
        );
        for worker in &self.workers {
            if let Some(reason) = &worker.reason {
                line.push_str(&format!(" {}=\"{}\"", worker.name, reason));
            }
        }
        line
    }
}

fn worker_health(snapshot: &WorkerStatus, now: DateTime<Utc>) -> WorkerHealth {
    let (status, reason) = if !snapshot.running {
        (HealthStatus::Unhealthy, Some("not running".to_string()))
    } else if let Some(error) = &snapshot.last_error {
        (HealthStatus::Degraded, Some(error.clone()))
    } else if is_stalled(snapshot, now) {
        (
            HealthStatus::Degraded,
            Some(format!("no cycle within {STALL_FACTOR}x interval")),
        )
    } else {
        (HealthStatus::Healthy, None)
    };
    WorkerHealth {
        name: snapshot.name.clone(),
        status,
        cycle_count: snapshot.cycle_count,
        reason,
    }
}

fn is_stalled(snapshot: &WorkerStatus, now: DateTime<Utc>) -> bool {
    let Some(reference) = snapshot.last_run_at.or(snapshot.started_at) else {
        return false;
    };
    let budget = snapshot
        .interval
        .checked_mul(STALL_FACTOR)
        .and_then(|budget| chrono::Duration::from_std(budget).ok());
    match budget {
        Some(budget) => now - reference > budget,
        None => false,
    }
}

pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn health_status_label(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Unhealthy => "unhealthy",
    }
}

fn health_severity(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unhealthy => 2,
    }
}

fn max_health_status(a: HealthStatus, b: HealthStatus) -> HealthStatus {
    if health_severity(a) >= health_severity(b) {
        a
    } else {
        b
    }
}
