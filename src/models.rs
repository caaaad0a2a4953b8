//! Domain types shared across the balancing core.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A physical hypervisor host at the moment it was last refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub status: NodeStatus,
    pub cpu_usage: f64,
    /// Total vCPU count (`cpuinfo.cpus`), used by the scorer's feasibility
    /// check; not a utilization figure.
    pub cpu_count: u32,
    pub mem_used: u64,
    pub mem_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub load: Option<f64>,
    pub uptime: Option<u64>,
}

impl NodeSnapshot {
    /// Fraction of total memory in use, 0 when total is unknown or zero.
    pub fn mem_frac(&self) -> f64 {
        if self.mem_total == 0 {
            0.0
        } else {
            self.mem_used as f64 / self.mem_total as f64
        }
    }

    pub fn mem_free(&self) -> u64 {
        self.mem_total.saturating_sub(self.mem_used)
    }

    pub fn disk_free(&self) -> u64 {
        self.disk_total.saturating_sub(self.disk_used)
    }

    pub fn is_online(&self) -> bool {
        matches!(self.status, NodeStatus::Online)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// A VM or container at the moment it was last refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub vmid: u32,
    pub name: Option<String>,
    pub status: VmStatus,
    pub node: String,
    pub cpu_usage: f64,
    pub mem_used: u64,
    pub mem_max: u64,
    pub max_cpu: u32,
    pub max_disk: u64,
    pub uptime: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

/// Resource ask derived from a VM's configuration, with the original's
/// documented defaults applied when the hypervisor omits a field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VmRequirements {
    pub cpu: u32,
    pub mem: u64,
    pub disk: u64,
}

impl VmRequirements {
    pub const DEFAULT_CPU: u32 = 1;
    pub const DEFAULT_MEM: u64 = 1024 * 1024 * 1024; // 1 GiB
    pub const DEFAULT_DISK: u64 = 10 * 1024 * 1024 * 1024; // 10 GiB

    pub fn from_vm(vm: &VmSnapshot) -> Self {
        Self {
            cpu: if vm.max_cpu == 0 { Self::DEFAULT_CPU } else { vm.max_cpu },
            mem: if vm.mem_max == 0 { Self::DEFAULT_MEM } else { vm.mem_max },
            disk: if vm.max_disk == 0 { Self::DEFAULT_DISK } else { vm.max_disk },
        }
    }
}

/// Why a migration was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationReason {
    HighToLow,
    Distribution,
    Affinity,
    Manual,
}

/// Terminal or in-flight outcome of a dispatched migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum MigrationOutcome {
    Initiated,
    Success,
    Failed { error: String },
}

/// One dispatched (or attempted) migration, append-only once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: uuid::Uuid,
    pub vmid: u32,
    pub vm_name: Option<String>,
    pub source: String,
    pub target: String,
    pub start_ts: chrono::DateTime<chrono::Utc>,
    pub reason: MigrationReason,
    pub requirements: VmRequirements,
    pub outcome: MigrationOutcome,
    pub completion_ts: Option<chrono::DateTime<chrono::Utc>>,
}

impl MigrationRecord {
    pub fn is_initiated(&self) -> bool {
        matches!(self.outcome, MigrationOutcome::Initiated)
    }
}

/// A group of VMs that should be kept together (or consolidated) where possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmGroup {
    pub name: String,
    pub members: HashSet<u32>,
}

/// Resource weight set used by the node scorer; always kept normalized to sum 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceWeights {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network: f64,
}

impl Default for ResourceWeights {
    fn default() -> Self {
        Self { cpu: 0.4, memory: 0.4, disk: 0.15, network: 0.05 }
    }
}

impl ResourceWeights {
    /// Renormalizes the weights to sum to 1.0 if they drift more than 1% away.
    pub fn normalized(self) -> Self {
        let total = self.cpu + self.memory + self.disk + self.network;
        if (total - 1.0).abs() <= 0.01 || total <= 0.0 {
            return self;
        }
        Self {
            cpu: self.cpu / total,
            memory: self.memory / total,
            disk: self.disk / total,
            network: self.network / total,
        }
    }
}

/// A window of hours, possibly wrapping past midnight, during which migrations
/// are permitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OffHoursWindow {
    pub start: u32,
    pub end: u32,
}

impl Default for OffHoursWindow {
    fn default() -> Self {
        Self { start: 22, end: 6 }
    }
}

impl OffHoursWindow {
    /// True if the given hour-of-day (0..24) falls inside the window.
    pub fn contains_hour(&self, hour: u32) -> bool {
        if self.start < self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// A resource metric tracked per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Cpu, Metric::Memory, Metric::Disk, Metric::Network];
}

/// One running cluster task as reported by the hypervisor (used to match
/// initiated migrations and to compute in-flight parallelism).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTask {
    pub task_type: String,
    pub id: String,
    pub status: String,
    pub exit_status: Option<String>,
    pub start_time: i64,
}

/// A detected resource anomaly on a node or VM time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub target: String,
    pub value: f64,
    pub mean: f64,
    pub std: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    NodeCpuSpike,
    NodeMemorySpike,
    VmCpuSpike,
}

/// A planner-emitted migration opportunity before a destination is chosen.
#[derive(Debug, Clone)]
pub struct PlannedMigration {
    pub strategy: MigrationReason,
    pub vmid: u32,
    pub source: String,
    pub preferred_targets: Vec<String>,
}

/// Per-strategy grouping of candidate sources and preferred targets, emitted
/// by the strategy planner ahead of per-VM candidate selection.
#[derive(Debug, Clone)]
pub struct StrategyPlan {
    pub reason: MigrationReason,
    pub sources: Vec<String>,
    pub targets: Vec<String>,
}

/// Map of vmid to the timestamp of its last successful dispatch.
pub type LastBalanceMap = HashMap<u32, chrono::DateTime<chrono::Utc>>;
