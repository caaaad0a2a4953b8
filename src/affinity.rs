//! Name-pattern and CPU-correlation VM grouping (§4.I).

use crate::history::ResourceHistoryStore;
use crate::models::{VmGroup, VmSnapshot, VmStatus};
use std::collections::{HashMap, HashSet};

const MIN_PREFIX_LEN: usize = 2;
const MIN_GROUP_SIZE: usize = 2;
const MIN_CORRELATION_SAMPLES: usize = 5;
const CORRELATION_WINDOW: usize = 10;
const CORRELATION_THRESHOLD: f64 = 0.7;

pub struct AffinityDiscovery;

impl AffinityDiscovery {
    /// Groups running VMs sharing a lowercase name prefix (up to the first
    /// `-`) of length ≥ 2, keeping only groups with ≥ 2 members.
    pub fn name_pattern_groups(vms: &[VmSnapshot]) -> Vec<VmGroup> {
        let mut by_prefix: HashMap<String, HashSet<u32>> = HashMap::new();

        for vm in vms {
            if vm.status != VmStatus::Running {
                continue;
            }
            let Some(name) = &vm.name else { continue };
            let prefix = match name.split('-').next() {
                Some(p) if p.len() >= MIN_PREFIX_LEN => p.to_lowercase(),
                _ => continue,
            };
            by_prefix.entry(prefix).or_default().insert(vm.vmid);
        }

        by_prefix
            .into_iter()
            .filter(|(_, members)| members.len() >= MIN_GROUP_SIZE)
            .map(|(name, members)| VmGroup { name, members })
            .collect()
    }

    /// Groups VM pairs whose last-10 CPU samples correlate above 0.7,
    /// greedily merging by descending correlation.
    pub fn correlated_groups(vms: &[VmSnapshot], history: &ResourceHistoryStore) -> Vec<VmGroup> {
        let vmids: Vec<u32> = vms.iter().map(|v| v.vmid).collect();

        let mut pairs: Vec<(u32, u32, f64)> = Vec::new();
        for i in 0..vmids.len() {
            for j in (i + 1)..vmids.len() {
                let (a, b) = (vmids[i], vmids[j]);
                let series_a: Vec<f64> = history.vm_series(a).iter().map(|s| s.cpu).collect();
                let series_b: Vec<f64> = history.vm_series(b).iter().map(|s| s.cpu).collect();
                if series_a.len() < MIN_CORRELATION_SAMPLES || series_b.len() < MIN_CORRELATION_SAMPLES {
                    continue;
                }
                let k = CORRELATION_WINDOW.min(series_a.len()).min(series_b.len());
                let xa = &series_a[series_a.len() - k..];
                let xb = &series_b[series_b.len() - k..];
                let corr = pearson_correlation(xa, xb);
                if corr > CORRELATION_THRESHOLD {
                    pairs.push((a, b, corr));
                }
            }
        }

        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut groups: Vec<HashSet<u32>> = Vec::new();
        for (a, b, _) in pairs {
            if let Some(group) = groups.iter_mut().find(|g| g.contains(&a) || g.contains(&b)) {
                group.insert(a);
                group.insert(b);
            } else {
                let mut g = HashSet::new();
                g.insert(a);
                g.insert(b);
                groups.push(g);
            }
        }

        groups
            .into_iter()
            .enumerate()
            .map(|(i, members)| VmGroup { name: format!("correlated_group_{}", i + 1), members })
            .collect()
    }

    /// Merges detected groups with persisted ones: detected groups take
    /// precedence for a shared name; unrelated persisted groups survive.
    pub fn merge(persisted: Vec<VmGroup>, detected: Vec<VmGroup>) -> Vec<VmGroup> {
        let mut by_name: HashMap<String, VmGroup> = persisted.into_iter().map(|g| (g.name.clone(), g)).collect();
        for group in detected {
            by_name.insert(group.name.clone(), group);
        }
        by_name.into_values().collect()
    }
}

/// Pearson correlation coefficient of two equal-length series; 0 when
/// either series has zero variance.
fn pearson_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::VmSample;

    fn vm(vmid: u32, name: &str) -> VmSnapshot {
        VmSnapshot { vmid, name: Some(name.to_string()), status: VmStatus::Running, node: "a".into(), cpu_usage: 0.1, mem_used: 0, mem_max: 0, max_cpu: 1, max_disk: 0, uptime: None }
    }

    #[test]
    fn groups_by_shared_prefix() {
        let vms = vec![vm(101, "web-1"), vm(102, "web-2"), vm(103, "db-1")];
        let groups = AffinityDiscovery::name_pattern_groups(&vms);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "web");
        assert!(groups[0].members.contains(&101) && groups[0].members.contains(&102));
    }

    #[test]
    fn short_prefix_is_ignored() {
        let vms = vec![vm(101, "a-1"), vm(102, "a-2")];
        assert!(AffinityDiscovery::name_pattern_groups(&vms).is_empty());
    }

    #[test]
    fn identical_linear_series_are_perfectly_correlated() {
        let mut history = ResourceHistoryStore::new();
        for i in 0..10 {
            let v = i as f64 / 10.0;
            history.push_vm(200, VmSample { ts: chrono::Utc::now(), cpu: v, mem_used: 0, node: "a".into(), migration_success: None });
            history.push_vm(201, VmSample { ts: chrono::Utc::now(), cpu: v, mem_used: 0, node: "b".into(), migration_success: None });
        }
        let vms = vec![vm(200, "x"), vm(201, "y")];
        let groups = AffinityDiscovery::correlated_groups(&vms, &history);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "correlated_group_1");
        assert!(groups[0].members.contains(&200) && groups[0].members.contains(&201));
    }

    #[test]
    fn uncorrelated_series_produce_no_group() {
        let mut history = ResourceHistoryStore::new();
        for i in 0..10 {
            history.push_vm(300, VmSample { ts: chrono::Utc::now(), cpu: (i as f64 / 10.0), mem_used: 0, node: "a".into(), migration_success: None });
            history.push_vm(301, VmSample { ts: chrono::Utc::now(), cpu: if i % 2 == 0 { 0.9 } else { 0.1 }, mem_used: 0, node: "b".into(), migration_success: None });
        }
        let vms = vec![vm(300, "x"), vm(301, "y")];
        assert!(AffinityDiscovery::correlated_groups(&vms, &history).is_empty());
    }
}
