//! Orders candidate rebalancing strategies for a tick (§4.F).

use crate::imbalance::ImbalanceDetector;
use crate::models::{MigrationReason, NodeSnapshot, StrategyPlan, VmGroup, VmSnapshot};
use std::collections::{HashMap, HashSet};

pub struct StrategyPlanner {
    pub migrate_high_load: bool,
    pub migrate_to_low_load: bool,
    pub consider_affinity: bool,
}

impl StrategyPlanner {
    /// Builds the ordered strategy list for this tick. Strategies with no
    /// sources are omitted entirely; the balancer loop stops consuming the
    /// list once its migration budget is exhausted.
    pub fn plan(
        &self,
        nodes: &[NodeSnapshot],
        vms: &[VmSnapshot],
        groups: &[VmGroup],
        detector: &ImbalanceDetector,
        excluded_nodes: &HashSet<String>,
    ) -> Vec<StrategyPlan> {
        let mut plans = Vec::new();

        let overloaded: Vec<String> = detector.overloaded(nodes, excluded_nodes).into_iter().map(|n| n.name.clone()).collect();
        let underloaded: Vec<String> = detector.underloaded(nodes, excluded_nodes).into_iter().map(|n| n.name.clone()).collect();

        if self.migrate_high_load && !overloaded.is_empty() {
            plans.push(StrategyPlan { reason: MigrationReason::HighToLow, sources: overloaded.clone(), targets: underloaded.clone() });
        }

        if self.migrate_to_low_load && overloaded.is_empty() && !underloaded.is_empty() {
            let underloaded_set: HashSet<&String> = underloaded.iter().collect();
            let sources: Vec<String> = nodes
                .iter()
                .filter(|n| n.is_online() && !excluded_nodes.contains(&n.name) && !underloaded_set.contains(&n.name))
                .map(|n| n.name.clone())
                .collect();
            if !sources.is_empty() {
                plans.push(StrategyPlan { reason: MigrationReason::Distribution, sources, targets: underloaded.clone() });
            }
        }

        if self.consider_affinity {
            for plan in self.affinity_plans(vms, groups) {
                plans.push(plan);
            }
        }

        plans
    }

    /// For each group split across multiple nodes, consolidates onto the
    /// node holding the most members: that node becomes the sole target,
    /// every other node holding a member becomes a source.
    fn affinity_plans(&self, vms: &[VmSnapshot], groups: &[VmGroup]) -> Vec<StrategyPlan> {
        let vm_node: HashMap<u32, &str> = vms.iter().map(|v| (v.vmid, v.node.as_str())).collect();

        let mut plans = Vec::new();
        for group in groups {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for vmid in &group.members {
                if let Some(node) = vm_node.get(vmid) {
                    *counts.entry(*node).or_insert(0) += 1;
                }
            }
            if counts.len() < 2 {
                continue; // already consolidated on one node
            }
            let majority_node = counts.iter().max_by_key(|(_, count)| **count).map(|(n, _)| *n).unwrap();
            let sources: Vec<String> = counts.keys().filter(|n| **n != majority_node).map(|n| n.to_string()).collect();
            if sources.is_empty() {
                continue;
            }
            plans.push(StrategyPlan { reason: MigrationReason::Affinity, sources, targets: vec![majority_node.to_string()] });
        }
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeStatus, VmStatus};
    use std::collections::HashSet as Set;

    fn node(name: &str, cpu: f64) -> NodeSnapshot {
        NodeSnapshot { name: name.to_string(), status: NodeStatus::Online, cpu_usage: cpu, cpu_count: 8, mem_used: 10, mem_total: 100, disk_used: 0, disk_total: 0, load: None, uptime: None }
    }

    fn vm(vmid: u32, node: &str) -> VmSnapshot {
        VmSnapshot { vmid, name: None, status: VmStatus::Running, node: node.to_string(), cpu_usage: 0.1, mem_used: 0, mem_max: 0, max_cpu: 1, max_disk: 0, uptime: None }
    }

    #[test]
    fn overload_takes_priority_over_distribution() {
        let planner = StrategyPlanner { migrate_high_load: true, migrate_to_low_load: true, consider_affinity: false };
        let nodes = vec![node("a", 0.9), node("b", 0.1)];
        let detector = ImbalanceDetector::new(0.8, 0.2);
        let plans = planner.plan(&nodes, &[], &[], &detector, &Set::new());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].reason, MigrationReason::HighToLow);
        assert_eq!(plans[0].sources, vec!["a".to_string()]);
    }

    #[test]
    fn distribution_does_not_fire_while_a_node_is_overloaded() {
        // migrate_high_load disabled, but an overloaded node still exists:
        // distribution must not fire in its place (it is gated on
        // overloaded.is_empty(), not on migrate_high_load's value).
        let planner = StrategyPlanner { migrate_high_load: false, migrate_to_low_load: true, consider_affinity: false };
        let nodes = vec![node("a", 0.9), node("b", 0.1)];
        let detector = ImbalanceDetector::new(0.8, 0.2);
        let plans = planner.plan(&nodes, &[], &[], &detector, &Set::new());
        assert!(plans.is_empty());
    }

    #[test]
    fn affinity_targets_majority_node() {
        let planner = StrategyPlanner { migrate_high_load: false, migrate_to_low_load: false, consider_affinity: true };
        let nodes = vec![node("a", 0.3), node("b", 0.3)];
        let vms = vec![vm(101, "a"), vm(102, "a"), vm(103, "b")];
        let mut members = Set::new();
        members.insert(101);
        members.insert(102);
        members.insert(103);
        let groups = vec![VmGroup { name: "app".into(), members }];
        let detector = ImbalanceDetector::new(0.8, 0.2);
        let plans = planner.plan(&nodes, &vms, &groups, &detector, &Set::new());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].reason, MigrationReason::Affinity);
        assert_eq!(plans[0].targets, vec!["a".to_string()]);
        assert_eq!(plans[0].sources, vec!["b".to_string()]);
    }
}
