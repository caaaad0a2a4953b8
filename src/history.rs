//! Bounded time-series storage for node and VM resource metrics (§3, §4.B).

use crate::models::{Metric, NodeSnapshot, VmSnapshot};
use std::collections::HashMap;

const NODE_SERIES_CAP: usize = 30;
const VM_SERIES_CAP: usize = 100;

/// One recorded VM sample; `migration_success` is set only by the migration
/// tracker when a dispatch resolves.
#[derive(Debug, Clone)]
pub struct VmSample {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub cpu: f64,
    pub mem_used: u64,
    pub node: String,
    pub migration_success: Option<bool>,
}

/// Ring-bounded history for every node's four metrics and every VM's sample
/// stream. A plain `Vec` with a trim-from-front on overflow plays the ring
/// buffer here: the series are short (≤100) so the O(n) shift is cheap and
/// the code stays simple.
#[derive(Debug, Default)]
pub struct ResourceHistoryStore {
    node_series: HashMap<(String, Metric), Vec<f64>>,
    vm_series: HashMap<u32, Vec<VmSample>>,
}

impl ResourceHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_node(&mut self, node: &str, metric: Metric, value: f64) {
        let series = self.node_series.entry((node.to_string(), metric)).or_default();
        series.push(value);
        if series.len() > NODE_SERIES_CAP {
            let excess = series.len() - NODE_SERIES_CAP;
            series.drain(0..excess);
        }
    }

    pub fn push_vm(&mut self, vmid: u32, sample: VmSample) {
        let series = self.vm_series.entry(vmid).or_default();
        series.push(sample);
        if series.len() > VM_SERIES_CAP {
            let excess = series.len() - VM_SERIES_CAP;
            series.drain(0..excess);
        }
    }

    pub fn latest(&self, node: &str, metric: Metric) -> Option<f64> {
        self.node_series.get(&(node.to_string(), metric)).and_then(|s| s.last().copied())
    }

    pub fn window(&self, node: &str, metric: Metric, k: usize) -> Vec<f64> {
        match self.node_series.get(&(node.to_string(), metric)) {
            Some(series) => {
                let start = series.len().saturating_sub(k);
                series[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    pub fn node_series(&self, node: &str, metric: Metric) -> &[f64] {
        self.node_series.get(&(node.to_string(), metric)).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn vm_series(&self, vmid: u32) -> &[VmSample] {
        self.vm_series.get(&vmid).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn has_node_history(&self, node: &str) -> bool {
        Metric::ALL.iter().any(|m| self.node_series.contains_key(&(node.to_string(), *m)))
    }

    /// Records one tick's worth of samples for every reachable node, deriving
    /// `cpu`/`memory`/`disk` from the snapshot. Network is left to a future
    /// metric source; its series simply stays empty until pushed elsewhere.
    pub fn record_node_snapshot(&mut self, node: &NodeSnapshot) {
        if !node.is_online() {
            return;
        }
        self.push_node(&node.name, Metric::Cpu, node.cpu_usage);
        self.push_node(&node.name, Metric::Memory, node.mem_frac());
        let disk_frac = if node.disk_total == 0 { 0.0 } else { node.disk_used as f64 / node.disk_total as f64 };
        self.push_node(&node.name, Metric::Disk, disk_frac);
    }

    pub fn record_vm_snapshot(&mut self, vm: &VmSnapshot, now: chrono::DateTime<chrono::Utc>) {
        self.push_vm(
            vm.vmid,
            VmSample { ts: now, cpu: vm.cpu_usage, mem_used: vm.mem_used, node: vm.node.clone(), migration_success: None },
        );
    }

    pub fn vm_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.vm_series.keys().copied()
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.node_series.keys().map(|(name, _)| name.as_str())
    }
}

/// Population standard deviation of a slice (0 for fewer than 2 points).
pub fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_series_caps_at_30() {
        let mut store = ResourceHistoryStore::new();
        for i in 0..50 {
            store.push_node("a", Metric::Cpu, i as f64 / 100.0);
        }
        assert_eq!(store.node_series("a", Metric::Cpu).len(), 30);
        // Oldest samples evicted first.
        assert_eq!(store.latest("a", Metric::Cpu), Some(0.49));
    }

    #[test]
    fn vm_series_caps_at_100() {
        let mut store = ResourceHistoryStore::new();
        for i in 0..150 {
            store.push_vm(
                100,
                VmSample { ts: chrono::Utc::now(), cpu: i as f64, mem_used: 0, node: "a".into(), migration_success: None },
            );
        }
        assert_eq!(store.vm_series(100).len(), 100);
    }

    #[test]
    fn window_returns_at_most_k_most_recent() {
        let mut store = ResourceHistoryStore::new();
        for i in 0..10 {
            store.push_node("a", Metric::Cpu, i as f64);
        }
        let w = store.window("a", Metric::Cpu, 3);
        assert_eq!(w, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn stddev_of_constant_series_is_zero() {
        assert_eq!(stddev(&[0.5, 0.5, 0.5]), 0.0);
    }
}
