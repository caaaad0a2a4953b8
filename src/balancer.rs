//! The periodic tick that ties every other component together (§4.G).

use crate::affinity::AffinityDiscovery;
use crate::error::Result;
use crate::gate::MigrationGate;
use crate::history::ResourceHistoryStore;
use crate::hypervisor::HypervisorClient;
use crate::imbalance::ImbalanceDetector;
use crate::models::{
    MigrationOutcome, MigrationRecord, MigrationReason, NodeSnapshot, StrategyPlan, VmRequirements, VmSnapshot, VmStatus,
};
use crate::scorer::NodeScorer;
use crate::state::AppState;
use crate::strategy::StrategyPlanner;
use crate::tracker::MigrationTracker;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const RESOURCE_REFRESH_INTERVAL: chrono::Duration = chrono::Duration::seconds(60);
const GROUP_REDERIVE_INTERVAL: chrono::Duration = chrono::Duration::hours(24);

pub struct BalancerLoop {
    client: Arc<dyn HypervisorClient>,
}

impl BalancerLoop {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self { client }
    }

    /// Runs ticks forever until `shutdown` is signaled, sleeping between
    /// ticks for `check_interval_secs` but waking within ~1s of shutdown.
    pub async fn run(&self, state: AppState, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.tick(&state).await {
                warn!(error = %e, "tick failed, will retry next interval");
            }

            let interval_secs = { state.lock().await.config.check_interval_secs };
            let sleep = tokio::time::sleep(Duration::from_secs(interval_secs));
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("balancer loop shutting down");
                            return;
                        }
                    }
                }
            }

            if *shutdown.borrow() {
                return;
            }
        }
    }

    /// One full tick (§4.G steps 1-5). Step 6 (sleep) is the caller's job.
    pub async fn tick(&self, state: &AppState) -> Result<()> {
        let now = Utc::now();

        // Hypervisor I/O happens with no lock held.
        let tasks = self.client.list_cluster_tasks(false).await?;

        {
            let mut guard = state.lock().await;
            let mut migrations = std::mem::take(&mut guard.migrations);
            MigrationTracker::new(chrono::Duration::seconds(
                guard.config.check_interval_secs as i64 * guard.config.stale_migration_timeout_ticks as i64,
            ))
            .resolve(&mut migrations, &tasks, &mut guard.history, now);
            guard.migrations = migrations;
        }

        let nodes = self.client.list_nodes().await?;
        let mut vms: Vec<VmSnapshot> = Vec::new();
        for node in nodes.iter().filter(|n| n.is_online()) {
            match self.client.list_vms(&node.name).await {
                Ok(mut node_vms) => vms.append(&mut node_vms),
                Err(e) => warn!(node = %node.name, error = %e, "failed to list vms, skipping node this tick"),
            }
        }

        let should_refresh_history = {
            let guard = state.lock().await;
            now - guard.last_resource_update > RESOURCE_REFRESH_INTERVAL
        };

        if should_refresh_history {
            let mut guard = state.lock().await;
            for node in &nodes {
                guard.history.record_node_snapshot(node);
            }
            for vm in &vms {
                guard.history.record_vm_snapshot(vm, now);
            }
            guard.last_resource_update = now;

            let should_rederive_groups = now - guard.last_group_update > GROUP_REDERIVE_INTERVAL;
            if should_rederive_groups {
                let name_groups = AffinityDiscovery::name_pattern_groups(&vms);
                let correlated_groups = AffinityDiscovery::correlated_groups(&vms, &guard.history);
                let mut detected = name_groups;
                detected.extend(correlated_groups);
                let persisted = std::mem::take(&mut guard.vm_groups);
                guard.vm_groups = AffinityDiscovery::merge(persisted, detected);
                guard.last_group_update = now;
            }
        }

        let inflight = MigrationTracker::inflight_migrations(&tasks);
        let max_parallel = { state.lock().await.config.max_parallel_migrations };
        if inflight >= max_parallel {
            info!(inflight, max_parallel, "parallelism cap reached, skipping tick");
            return Ok(());
        }
        let mut budget = max_parallel - inflight;

        let (plans, dispatches) = {
            let guard = state.lock().await;
            let excluded_nodes: HashSet<String> = guard.config.node_exclusions.iter().cloned().collect();
            let detector = ImbalanceDetector::new(guard.config.high_load_threshold, guard.config.low_load_threshold);
            let planner = StrategyPlanner {
                migrate_high_load: guard.config.migrate_high_load,
                migrate_to_low_load: guard.config.migrate_to_low_load,
                consider_affinity: guard.config.consider_affinity,
            };
            let plans = planner.plan(&nodes, &vms, &guard.vm_groups, &detector, &excluded_nodes);

            let scorer = NodeScorer::new(&guard.history, guard.config.resource_weights);
            let gate = MigrationGate {
                excluded_vms: &guard.config.vm_exclusions,
                min_balance_interval: chrono::Duration::seconds(guard.config.min_balance_interval_secs),
                consider_time_of_day: guard.config.consider_time_of_day,
                off_hours: guard.config.off_hours,
            };

            let dispatches = self.plan_dispatches(&plans, &nodes, &vms, &scorer, &gate, &guard.last_balance, &excluded_nodes, now, &mut budget);
            (plans, dispatches)
        };
        let _ = plans;

        for dispatch in dispatches {
            match self
                .client
                .migrate(&dispatch.source, dispatch.vmid, &dispatch.target, dispatch.online, true)
                .await
            {
                Ok(()) => {
                    info!(vmid = dispatch.vmid, source = %dispatch.source, target = %dispatch.target, reason = ?dispatch.reason, "migration dispatched");
                    let mut guard = state.lock().await;
                    guard.migrations.push(MigrationRecord {
                        id: uuid::Uuid::new_v4(),
                        vmid: dispatch.vmid,
                        vm_name: dispatch.vm_name.clone(),
                        source: dispatch.source.clone(),
                        target: dispatch.target.clone(),
                        start_ts: now,
                        reason: dispatch.reason,
                        requirements: dispatch.requirements,
                        outcome: MigrationOutcome::Initiated,
                        completion_ts: None,
                    });
                    guard.last_balance.insert(dispatch.vmid, now);
                    guard.history.record_vm_snapshot(
                        &VmSnapshot {
                            vmid: dispatch.vmid,
                            name: dispatch.vm_name,
                            status: VmStatus::Running,
                            node: dispatch.source.clone(),
                            cpu_usage: dispatch.cpu_at_dispatch,
                            mem_used: 0,
                            mem_max: 0,
                            max_cpu: 0,
                            max_disk: 0,
                            uptime: None,
                        },
                        now,
                    );
                }
                Err(e) => {
                    warn!(vmid = dispatch.vmid, source = %dispatch.source, target = %dispatch.target, error = %e, "migration dispatch rejected");
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_dispatches(
        &self,
        plans: &[StrategyPlan],
        nodes: &[NodeSnapshot],
        vms: &[VmSnapshot],
        scorer: &NodeScorer,
        gate: &MigrationGate,
        last_balance: &crate::models::LastBalanceMap,
        excluded_nodes: &HashSet<String>,
        now: chrono::DateTime<Utc>,
        budget: &mut usize,
    ) -> Vec<Dispatch> {
        let mut dispatched_this_tick: HashSet<u32> = HashSet::new();
        let mut out = Vec::new();

        for plan in plans {
            if *budget == 0 {
                break;
            }
            for source in &plan.sources {
                if *budget == 0 {
                    break;
                }
                let candidates = select_migration_candidates(source, vms, gate, last_balance, now, &dispatched_this_tick, *budget);

                for vm in candidates {
                    if *budget == 0 {
                        break;
                    }
                    let req = VmRequirements::from_vm(vm);

                    let destination = if !plan.targets.is_empty() {
                        plan.targets
                            .iter()
                            .filter(|t| !excluded_nodes.contains(*t) && *t != source)
                            .find_map(|t| nodes.iter().find(|n| &n.name == t))
                            .filter(|n| scorer.score(n, Some(&req)).is_finite())
                            .or_else(|| {
                                let mut excl = excluded_nodes.clone();
                                excl.insert(source.clone());
                                scorer.select_best(nodes, Some(&req), &excl)
                            })
                    } else {
                        let mut excl = excluded_nodes.clone();
                        excl.insert(source.clone());
                        scorer.select_best(nodes, Some(&req), &excl)
                    };

                    let Some(destination) = destination else {
                        continue;
                    };

                    dispatched_this_tick.insert(vm.vmid);
                    *budget -= 1;
                    out.push(Dispatch {
                        vmid: vm.vmid,
                        vm_name: vm.name.clone(),
                        source: source.clone(),
                        target: destination.name.clone(),
                        online: vm.status == VmStatus::Running,
                        reason: plan.reason,
                        requirements: req,
                        cpu_at_dispatch: vm.cpu_usage,
                    });
                }
            }
        }

        out
    }
}

struct Dispatch {
    vmid: u32,
    vm_name: Option<String>,
    source: String,
    target: String,
    online: bool,
    reason: MigrationReason,
    requirements: VmRequirements,
    cpu_at_dispatch: f64,
}

/// Eligible VMs on `source`, sorted by descending current CPU, capped at
/// `budget` (preserved verbatim from the original's current-CPU-only sort).
fn select_migration_candidates<'v>(
    source: &str,
    vms: &'v [VmSnapshot],
    gate: &MigrationGate,
    last_balance: &crate::models::LastBalanceMap,
    now: chrono::DateTime<Utc>,
    already_dispatched: &HashSet<u32>,
    budget: usize,
) -> Vec<&'v VmSnapshot> {
    let mut eligible: Vec<&VmSnapshot> = vms
        .iter()
        .filter(|v| v.node == source)
        .filter(|v| v.status == VmStatus::Running)
        .filter(|v| !already_dispatched.contains(&v.vmid))
        .filter(|v| gate.may_migrate(v.vmid, last_balance, now))
        .collect();

    eligible.sort_by(|a, b| b.cpu_usage.partial_cmp(&a.cpu_usage).unwrap_or(std::cmp::Ordering::Equal));
    eligible.into_iter().take(budget).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerConfig;
    use crate::models::{ClusterTask, NodeStatus};
    use crate::state::new_app_state;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct MockClient {
        nodes: Vec<NodeSnapshot>,
        vms: Vec<VmSnapshot>,
        tasks: Vec<ClusterTask>,
        dispatched: StdMutex<Vec<(String, u32, String)>>,
    }

    #[async_trait]
    impl HypervisorClient for MockClient {
        async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>> {
            Ok(self.nodes.clone())
        }
        async fn list_vms(&self, node: &str) -> Result<Vec<VmSnapshot>> {
            Ok(self.vms.iter().filter(|v| v.node == node).cloned().collect())
        }
        async fn list_cluster_tasks(&self, _running_only: bool) -> Result<Vec<ClusterTask>> {
            Ok(self.tasks.clone())
        }
        async fn migrate(&self, source: &str, vmid: u32, target: &str, _online: bool, _with_local_disks: bool) -> Result<()> {
            self.dispatched.lock().unwrap().push((source.to_string(), vmid, target.to_string()));
            Ok(())
        }
    }

    fn node(name: &str, cpu: f64) -> NodeSnapshot {
        NodeSnapshot { name: name.to_string(), status: NodeStatus::Online, cpu_usage: cpu, cpu_count: 16, mem_used: 10, mem_total: 1_000_000_000_000, disk_used: 0, disk_total: 1_000_000_000_000, load: None, uptime: None }
    }

    fn vm(vmid: u32, node: &str, cpu: f64) -> VmSnapshot {
        VmSnapshot { vmid, name: Some(format!("vm{vmid}")), status: VmStatus::Running, node: node.to_string(), cpu_usage: cpu, mem_used: 0, mem_max: 0, max_cpu: 1, max_disk: 0, uptime: None }
    }

    #[tokio::test]
    async fn overload_relief_dispatches_one_migration() {
        let client = Arc::new(MockClient {
            nodes: vec![node("a", 0.9), node("b", 0.1)],
            vms: vec![vm(100, "a", 0.9)],
            tasks: vec![],
            dispatched: StdMutex::new(Vec::new()),
        });

        let mut config = BalancerConfig::default();
        config.min_balance_interval_secs = 0;
        config.consider_time_of_day = false;
        config.max_parallel_migrations = 1;
        let state = new_app_state(config);

        let loop_ = BalancerLoop::new(client.clone());
        loop_.tick(&state).await.unwrap();

        let dispatched = client.dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0], ("a".to_string(), 100, "b".to_string()));
    }

    #[tokio::test]
    async fn parallelism_cap_blocks_tick() {
        let client = Arc::new(MockClient {
            nodes: vec![node("a", 0.9), node("b", 0.1)],
            vms: vec![vm(100, "a", 0.9)],
            tasks: vec![
                ClusterTask { task_type: "qmigrate".into(), id: "UPID:a:1:qmigrate:200:".into(), status: "running".into(), exit_status: None, start_time: 1 },
                ClusterTask { task_type: "qmigrate".into(), id: "UPID:b:2:qmigrate:201:".into(), status: "running".into(), exit_status: None, start_time: 2 },
            ],
            dispatched: StdMutex::new(Vec::new()),
        });

        let mut config = BalancerConfig::default();
        config.min_balance_interval_secs = 0;
        config.consider_time_of_day = false;
        config.max_parallel_migrations = 2;
        let state = new_app_state(config);

        let loop_ = BalancerLoop::new(client.clone());
        loop_.tick(&state).await.unwrap();
        loop_.tick(&state).await.unwrap();

        assert!(client.dispatched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cooldown_blocks_repeated_dispatch() {
        let client = Arc::new(MockClient {
            nodes: vec![node("a", 0.9), node("b", 0.1)],
            vms: vec![vm(100, "a", 0.9)],
            tasks: vec![],
            dispatched: StdMutex::new(Vec::new()),
        });

        let mut config = BalancerConfig::default();
        config.min_balance_interval_secs = 3600;
        config.consider_time_of_day = false;
        config.max_parallel_migrations = 1;
        let state = new_app_state(config);

        let loop_ = BalancerLoop::new(client.clone());
        loop_.tick(&state).await.unwrap();
        loop_.tick(&state).await.unwrap();
        loop_.tick(&state).await.unwrap();

        // Only the first successful dispatch; cooldown then blocks re-dispatch.
        assert_eq!(client.dispatched.lock().unwrap().len(), 1);
    }
}
