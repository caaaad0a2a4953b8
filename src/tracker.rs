//! Matches initiated migrations to cluster tasks and resolves their terminal
//! outcome (§4.H), including the stale-record policy from SPEC_FULL §4.H.

use crate::history::{ResourceHistoryStore, VmSample};
use crate::models::{ClusterTask, MigrationOutcome, MigrationRecord};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub struct MigrationTracker {
    pub stale_timeout: chrono::Duration,
}

impl MigrationTracker {
    pub fn new(stale_timeout: chrono::Duration) -> Self {
        Self { stale_timeout }
    }

    /// Walks every still-`initiated` record, matching it against the running
    /// or recently finished cluster task list and resolving it in place.
    /// Already-resolved records are left untouched (idempotent).
    pub fn resolve(&self, records: &mut [MigrationRecord], tasks: &[ClusterTask], history: &mut ResourceHistoryStore, now: DateTime<Utc>) {
        for record in records.iter_mut() {
            if !record.is_initiated() {
                continue;
            }

            let vmid_str = record.vmid.to_string();
            let matching_task = tasks
                .iter()
                .filter(|t| t.task_type == "qmigrate" && t.id.contains(&vmid_str) && t.id.contains(&record.source))
                .max_by_key(|t| t.start_time);

            match matching_task {
                Some(task) if task.status == "stopped" => {
                    if task.exit_status.as_deref() == Some("OK") {
                        record.outcome = MigrationOutcome::Success;
                        record.completion_ts = Some(now);
                        history.push_vm(
                            record.vmid,
                            VmSample { ts: now, cpu: 0.0, mem_used: 0, node: record.target.clone(), migration_success: Some(true) },
                        );
                        info!(vmid = record.vmid, source = %record.source, target = %record.target, "migration succeeded");
                    } else {
                        let error = task.exit_status.clone().unwrap_or_else(|| "unknown".to_string());
                        record.completion_ts = Some(now);
                        history.push_vm(
                            record.vmid,
                            VmSample { ts: now, cpu: 0.0, mem_used: 0, node: record.source.clone(), migration_success: Some(false) },
                        );
                        warn!(vmid = record.vmid, source = %record.source, target = %record.target, %error, "migration failed");
                        record.outcome = MigrationOutcome::Failed { error };
                    }
                }
                Some(_) => {} // still running; leave as initiated
                None => {
                    if now - record.start_ts >= self.stale_timeout {
                        warn!(vmid = record.vmid, source = %record.source, target = %record.target, "marking stale migration as failed");
                        record.outcome = MigrationOutcome::Failed { error: "stale: no matching cluster task".to_string() };
                        record.completion_ts = Some(now);
                    }
                }
            }
        }
    }

    /// Number of currently-running `qmigrate` tasks cluster-wide, used to
    /// enforce the parallelism cap by observing external state rather than
    /// an internal counter (§5).
    pub fn inflight_migrations(tasks: &[ClusterTask]) -> usize {
        tasks.iter().filter(|t| t.task_type == "qmigrate" && t.status == "running").count()
    }
}
