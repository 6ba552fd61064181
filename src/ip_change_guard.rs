//! IP Change Guard
//!
//! Bounds how often the node's externally observed address may change.
//! More than one change inside a rolling 20 hour window latches a
//! process-lifetime flag; callers seeing it tear down every local workload.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::collaborators::{CollaboratorError, WorkloadManager};
use crate::lock_utils::lock_or_recover;
use crate::shell::CommandRunner;

/// Rolling window for address changes
pub const IP_CHANGE_WINDOW: Duration = Duration::from_secs(20 * 60 * 60);

/// Changes inside one window that trip the guard
pub const IP_CHANGE_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct IpChangeRecord {
    window_start: Instant,
    change_count: u32,
}

/// Tracks address changes for the lifetime of the process
#[derive(Debug, Default)]
pub struct IpChangeGuard {
    record: Mutex<Option<IpChangeRecord>>,
    over_limit: AtomicBool,
}

impl IpChangeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address change and report whether the limit is exceeded
    pub fn changes_over_limit(&self) -> bool {
        self.changes_over_limit_at(Instant::now())
    }

    pub fn changes_over_limit_at(&self, now: Instant) -> bool {
        let mut record = lock_or_recover(&self.record, "ip change record");

        let Some(current) = record.as_mut() else {
            *record = Some(IpChangeRecord {
                window_start: now,
                change_count: 1,
            });
            return false;
        };

        if now.saturating_duration_since(current.window_start) > IP_CHANGE_WINDOW {
            *current = IpChangeRecord {
                window_start: now,
                change_count: 1,
            };
            return false;
        }

        current.change_count += 1;
        if current.change_count >= IP_CHANGE_LIMIT {
            if !self.over_limit.swap(true, Ordering::SeqCst) {
                error!(
                    "Address changed {} times within {:?}; node disabled until restart",
                    current.change_count, IP_CHANGE_WINDOW
                );
            }
            return true;
        }
        false
    }

    /// Whether the permanent over-limit flag is set
    pub fn is_over_limit(&self) -> bool {
        self.over_limit.load(Ordering::SeqCst)
    }
}

// =============================================================================
// WORKLOAD TEARDOWN
// =============================================================================

/// Result of a best-effort teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Remove every installed workload. Failures are logged and skipped.
pub async fn teardown_workloads(workloads: &dyn WorkloadManager) -> TeardownReport {
    let mut report = TeardownReport::default();

    let installed = match workloads.installed().await {
        Ok(names) => names,
        Err(e) => {
            error!("Unable to list installed workloads for teardown: {}", e);
            return report;
        }
    };

    info!("Tearing down {} workloads", installed.len());
    for name in installed {
        match workloads.remove(&name).await {
            Ok(()) => {
                info!("Workload {} removed", name);
                report.removed.push(name);
            }
            Err(e) => {
                warn!("Failed to remove workload {}: {}", name, e);
                report.failed.push(name);
            }
        }
    }
    report
}

/// Workload manager driven by configurable shell commands
pub struct ShellWorkloads {
    runner: Arc<dyn CommandRunner>,
    list_command: String,
    remove_command: String,
}

impl ShellWorkloads {
    pub fn new(runner: Arc<dyn CommandRunner>, list_command: &str, remove_command: &str) -> Self {
        Self {
            runner,
            list_command: list_command.to_string(),
            remove_command: remove_command.to_string(),
        }
    }
}

#[async_trait]
impl WorkloadManager for ShellWorkloads {
    async fn installed(&self) -> Result<Vec<String>, CollaboratorError> {
        let output = self
            .runner
            .run_checked(&self.list_command)
            .await
            .map_err(|e| CollaboratorError::transport("workloads", e))?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove(&self, name: &str) -> Result<(), CollaboratorError> {
        if name.chars().any(char::is_whitespace) {
            return Err(CollaboratorError::decode(
                "workloads",
                format!("invalid workload name '{}'", name),
            ));
        }
        let command = self.remove_command.replace("{name}", name);
        self.runner
            .run_checked(&command)
            .await
            .map(|_| ())
            .map_err(|e| CollaboratorError::transport("workloads", e))
    }
}
