//! Rolling z-score anomaly detection over node and VM series (§4.J).

use crate::history::{mean, stddev, ResourceHistoryStore};
use crate::models::{Anomaly, AnomalyKind, Metric, NodeSnapshot, VmSnapshot};

const WINDOW: usize = 5;
const Z_THRESHOLD: f64 = 3.0;

pub struct AnomalyDetector;

impl AnomalyDetector {
    /// Compares each node's/VM's *live* current reading against a baseline
    /// window of its *preceding* recorded samples. `current` must never be
    /// drawn from the same series as the baseline, or the self-included
    /// point caps its own z-score (Samuelson's inequality) and the threshold
    /// becomes unreachable.
    pub fn detect(nodes: &[NodeSnapshot], vms: &[VmSnapshot], history: &ResourceHistoryStore) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        for node in nodes.iter().filter(|n| n.is_online()) {
            if let Some(a) = Self::check_series(
                &node.name,
                AnomalyKind::NodeCpuSpike,
                history.node_series(&node.name, Metric::Cpu),
                node.cpu_usage,
            ) {
                anomalies.push(a);
            }
            if let Some(a) = Self::check_series(
                &node.name,
                AnomalyKind::NodeMemorySpike,
                history.node_series(&node.name, Metric::Memory),
                node.mem_frac(),
            ) {
                anomalies.push(a);
            }
        }

        for vm in vms {
            let series: Vec<f64> = history.vm_series(vm.vmid).iter().map(|s| s.cpu).collect();
            if let Some(a) = Self::check_series(&vm.vmid.to_string(), AnomalyKind::VmCpuSpike, &series, vm.cpu_usage) {
                anomalies.push(a);
            }
        }

        anomalies
    }

    fn check_series(target: &str, kind: AnomalyKind, baseline: &[f64], current: f64) -> Option<Anomaly> {
        if baseline.len() < WINDOW {
            return None;
        }
        let window = &baseline[baseline.len() - WINDOW..];
        let mu = mean(window);
        let sigma = stddev(window);
        if sigma <= 0.0 {
            return None;
        }
        let z = (current - mu) / sigma;
        if z > Z_THRESHOLD {
            Some(Anomaly { kind, target: target.to_string(), value: current, mean: mu, std: sigma, z_score: z })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::VmSample;
    use crate::models::{NodeStatus, VmStatus};

    fn node(name: &str, cpu_usage: f64) -> NodeSnapshot {
        NodeSnapshot {
            name: name.into(),
            status: NodeStatus::Online,
            cpu_usage,
            cpu_count: 8,
            mem_used: 0,
            mem_total: 0,
            disk_used: 0,
            disk_total: 0,
            load: None,
            uptime: None,
        }
    }

    fn vm(vmid: u32, cpu_usage: f64) -> VmSnapshot {
        VmSnapshot { vmid, name: None, status: VmStatus::Running, node: "x".into(), cpu_usage, mem_used: 0, mem_max: 0, max_cpu: 1, max_disk: 0, uptime: None }
    }

    #[test]
    fn spike_after_stable_baseline_is_detected() {
        let mut history = ResourceHistoryStore::new();
        for v in [0.10, 0.11, 0.09, 0.10, 0.10] {
            history.push_node("x", Metric::Cpu, v);
        }

        let node = node("x", 0.50);
        let anomalies = AnomalyDetector::detect(&[node], &[], &history);
        assert!(anomalies.iter().any(|a| a.kind == AnomalyKind::NodeCpuSpike && a.target == "x"));
    }

    #[test]
    fn constant_series_never_anomalous() {
        let mut history = ResourceHistoryStore::new();
        for _ in 0..5 {
            history.push_node("x", Metric::Cpu, 0.5);
        }
        let node = node("x", 0.5);
        assert!(AnomalyDetector::detect(&[node], &[], &history).is_empty());
    }

    #[test]
    fn vm_spike_detected_independently_of_node() {
        let mut history = ResourceHistoryStore::new();
        for v in [0.10, 0.11, 0.09, 0.10, 0.10] {
            history.push_vm(200, VmSample { ts: chrono::Utc::now(), cpu: v, mem_used: 0, node: "x".into(), migration_success: None });
        }
        let vm = vm(200, 0.80);
        let anomalies = AnomalyDetector::detect(&[], &[vm], &history);
        assert!(anomalies.iter().any(|a| a.kind == AnomalyKind::VmCpuSpike && a.target == "200"));
    }
}
