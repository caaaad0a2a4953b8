//! The hypervisor client contract (§4.A). The balancing core depends only on
//! this trait; it never knows the wire shape of the concrete collaborator.

pub mod proxmox;

use crate::error::Result;
use crate::models::{ClusterTask, NodeSnapshot, VmSnapshot};
use async_trait::async_trait;

/// Read-mostly view onto a hypervisor cluster, plus the one write operation
/// (`migrate`) the balancer needs. Implementations must degrade gracefully on
/// transient failure: return `Err`, never panic.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Lists all nodes known to the cluster, online or not.
    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>>;

    /// Lists all VMs/containers resident on `node`.
    async fn list_vms(&self, node: &str) -> Result<Vec<VmSnapshot>>;

    /// Lists cluster tasks, optionally restricted to currently-running ones.
    async fn list_cluster_tasks(&self, running_only: bool) -> Result<Vec<ClusterTask>>;

    /// Dispatches a live (or cold) migration. `online` requests a live
    /// migration; `with_local_disks` requests local-disk migration alongside
    /// it. Returns once the hypervisor has accepted (not completed) the
    /// request.
    async fn migrate(
        &self,
        source: &str,
        vmid: u32,
        target: &str,
        online: bool,
        with_local_disks: bool,
    ) -> Result<()>;
}
