//! End-to-end exercise of a full tick against a mock hypervisor, checking
//! that an overloaded node sheds exactly one VM to an idle one and that the
//! resulting migration is recorded as initiated.

use async_trait::async_trait;
use hv_balancer::balancer::BalancerLoop;
use hv_balancer::config::BalancerConfig;
use hv_balancer::error::Result;
use hv_balancer::hypervisor::HypervisorClient;
use hv_balancer::models::{ClusterTask, MigrationOutcome, NodeSnapshot, NodeStatus, VmSnapshot, VmStatus};
use hv_balancer::state::new_app_state;
use std::sync::{Arc, Mutex as StdMutex};

struct FixtureClient {
    nodes: Vec<NodeSnapshot>,
    vms: Vec<VmSnapshot>,
    dispatched: StdMutex<Vec<(String, u32, String)>>,
}

#[async_trait]
impl HypervisorClient for FixtureClient {
    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>> {
        Ok(self.nodes.clone())
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSnapshot>> {
        Ok(self.vms.iter().filter(|v| v.node == node).cloned().collect())
    }

    async fn list_cluster_tasks(&self, _running_only: bool) -> Result<Vec<ClusterTask>> {
        Ok(Vec::new())
    }

    async fn migrate(&self, source: &str, vmid: u32, target: &str, _online: bool, _with_local_disks: bool) -> Result<()> {
        self.dispatched.lock().unwrap().push((source.to_string(), vmid, target.to_string()));
        Ok(())
    }
}

fn node(name: &str, cpu: f64, mem_total: u64, mem_used: u64) -> NodeSnapshot {
    NodeSnapshot {
        name: name.to_string(),
        status: NodeStatus::Online,
        cpu_usage: cpu,
        cpu_count: 16,
        mem_used,
        mem_total,
        disk_used: 0,
        disk_total: 1_000_000_000_000,
        load: None,
        uptime: None,
    }
}

fn vm(vmid: u32, name: &str, node: &str, cpu: f64) -> VmSnapshot {
    VmSnapshot {
        vmid,
        name: Some(name.to_string()),
        status: VmStatus::Running,
        node: node.to_string(),
        cpu_usage: cpu,
        mem_used: 1_000_000_000,
        mem_max: 2_000_000_000,
        max_cpu: 2,
        max_disk: 0,
        uptime: Some(3600),
    }
}

#[tokio::test]
async fn overloaded_node_sheds_one_vm_to_idle_node() {
    let client = Arc::new(FixtureClient {
        nodes: vec![
            node("hv-01", 0.92, 64_000_000_000, 58_000_000_000),
            node("hv-02", 0.05, 64_000_000_000, 4_000_000_000),
        ],
        vms: vec![vm(500, "app-1", "hv-01", 0.9), vm(501, "app-2", "hv-01", 0.1)],
        dispatched: StdMutex::new(Vec::new()),
    });

    let mut config = BalancerConfig::default();
    config.min_balance_interval_secs = 0;
    config.consider_time_of_day = false;
    config.max_parallel_migrations = 1;
    let state = new_app_state(config);

    let loop_ = BalancerLoop::new(client.clone());
    loop_.tick(&state).await.expect("tick should succeed");

    let dispatched = client.dispatched.lock().unwrap();
    assert_eq!(dispatched.len(), 1, "exactly one migration should be dispatched within the parallelism cap");
    assert_eq!(dispatched[0].0, "hv-01");
    assert_eq!(dispatched[0].1, 500, "the busier VM should be chosen first");
    assert_eq!(dispatched[0].2, "hv-02");

    let guard = state.lock().await;
    assert_eq!(guard.migrations.len(), 1);
    assert_eq!(guard.migrations[0].outcome, MigrationOutcome::Initiated);
    assert!(guard.last_balance.contains_key(&500));
}

#[tokio::test]
async fn parallelism_cap_prevents_a_second_dispatch_in_one_tick() {
    let client = Arc::new(FixtureClient {
        nodes: vec![
            node("hv-01", 0.95, 64_000_000_000, 60_000_000_000),
            node("hv-02", 0.05, 64_000_000_000, 4_000_000_000),
        ],
        vms: vec![vm(600, "app-1", "hv-01", 0.9), vm(601, "app-2", "hv-01", 0.85)],
        dispatched: StdMutex::new(Vec::new()),
    });

    let mut config = BalancerConfig::default();
    config.min_balance_interval_secs = 0;
    config.consider_time_of_day = false;
    config.max_parallel_migrations = 1;
    let state = new_app_state(config);

    let loop_ = BalancerLoop::new(client.clone());
    loop_.tick(&state).await.expect("tick should succeed");

    assert_eq!(client.dispatched.lock().unwrap().len(), 1, "the migration budget caps dispatches at one per tick here");
}
