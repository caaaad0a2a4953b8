//! Node fitness scoring with short-horizon prediction and volatility penalty
//! (§4.C). Lower score is better; infeasible nodes score `f64::INFINITY`.

use crate::history::{mean, stddev, ResourceHistoryStore};
use crate::models::{Metric, NodeSnapshot, ResourceWeights, VmRequirements};
use std::collections::HashSet;

const CURRENT_WEIGHT: f64 = 0.7;
const PREDICTED_WEIGHT: f64 = 0.3;
const VOLATILITY_WEIGHT: f64 = 0.1;
const VOLATILITY_HISTORY_MIN: usize = 5;
const HOURS_AHEAD: f64 = 1.0;

pub struct NodeScorer<'a> {
    history: &'a ResourceHistoryStore,
    weights: ResourceWeights,
}

impl<'a> NodeScorer<'a> {
    pub fn new(history: &'a ResourceHistoryStore, weights: ResourceWeights) -> Self {
        Self { history, weights }
    }

    /// Ordinary least squares over `history` evaluated `hours_ahead` steps
    /// past the last sample, clamped to `[0, 1]`. Fewer than 3 points just
    /// repeats the last value.
    fn predict_next(history: &[f64], hours_ahead: f64) -> f64 {
        let n = history.len();
        if n == 0 {
            return 0.0;
        }
        if n < 3 {
            return history[n - 1];
        }

        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let x_mean = mean(&xs);
        let y_mean = mean(history);

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for i in 0..n {
            numerator += (xs[i] - x_mean) * (history[i] - y_mean);
            denominator += (xs[i] - x_mean).powi(2);
        }

        if denominator == 0.0 {
            return history[n - 1];
        }

        let slope = numerator / denominator;
        let intercept = y_mean - slope * x_mean;
        let future_x = n as f64 + hours_ahead;
        let predicted = slope * future_x + intercept;
        predicted.clamp(0.0, 1.0)
    }

    fn blended(&self, node: &str, metric: Metric) -> f64 {
        let series = self.history.node_series(node, metric);
        let current = series.last().copied().unwrap_or(0.0);
        let predicted = Self::predict_next(series, HOURS_AHEAD);
        CURRENT_WEIGHT * current + PREDICTED_WEIGHT * predicted
    }

    fn feasible(&self, node: &NodeSnapshot, req: &VmRequirements) -> bool {
        let cur_cpu = self.history.latest(&node.name, Metric::Cpu).unwrap_or(node.cpu_usage);
        let available_vcpus = node.cpu_count as f64 * (1.0 - cur_cpu);
        if (req.cpu as f64) > available_vcpus {
            return false;
        }
        if (req.mem as f64) > node.mem_free() as f64 {
            return false;
        }
        if (req.disk as f64) > node.disk_free() as f64 {
            return false;
        }
        true
    }

    /// Computes the fitness score for `node`, returning `f64::INFINITY` when
    /// the node has no history yet or cannot satisfy `req`.
    pub fn score(&self, node: &NodeSnapshot, req: Option<&VmRequirements>) -> f64 {
        if !self.history.has_node_history(&node.name) {
            return f64::INFINITY;
        }

        if let Some(req) = req {
            if !self.feasible(node, req) {
                return f64::INFINITY;
            }
        }

        let cpu_s = self.blended(&node.name, Metric::Cpu);
        let mem_s = self.blended(&node.name, Metric::Memory);
        let disk_s = self.blended(&node.name, Metric::Disk);

        let mut score = self.weights.cpu * cpu_s + self.weights.memory * mem_s + self.weights.disk * disk_s;

        let cpu_history = self.history.node_series(&node.name, Metric::Cpu);
        if cpu_history.len() > VOLATILITY_HISTORY_MIN {
            let mem_history = self.history.node_series(&node.name, Metric::Memory);
            let cpu_last5 = &cpu_history[cpu_history.len() - 5..];
            let mem_last5 = &mem_history[mem_history.len().saturating_sub(5)..];
            let volatility = (stddev(cpu_last5) + stddev(mem_last5)) / 2.0;
            score += VOLATILITY_WEIGHT * volatility;
        }

        score
    }

    /// Lowest-scoring online, non-excluded node, or `None` if no node is
    /// feasible. Ties broken by the order nodes appear in `nodes`.
    pub fn select_best<'n>(
        &self,
        nodes: &'n [NodeSnapshot],
        req: Option<&VmRequirements>,
        excluded: &HashSet<String>,
    ) -> Option<&'n NodeSnapshot> {
        let mut best: Option<(&NodeSnapshot, f64)> = None;
        for node in nodes {
            if !node.is_online() || excluded.contains(&node.name) {
                continue;
            }
            let s = self.score(node, req);
            if !s.is_finite() {
                continue;
            }
            match &best {
                Some((_, best_score)) if s >= *best_score => {}
                _ => best = Some((node, s)),
            }
        }
        best.map(|(n, _)| n)
    }

    /// Top-`k` nodes by ascending score, regardless of exclusion (used for
    /// the `/api/recommendations` endpoint, which reports all candidates).
    pub fn recommend<'n>(&self, nodes: &'n [NodeSnapshot], k: usize, req: Option<&VmRequirements>) -> Vec<&'n NodeSnapshot> {
        let mut scored: Vec<(&NodeSnapshot, f64)> =
            nodes.iter().filter(|n| n.is_online()).map(|n| (n, self.score(n, req))).filter(|(_, s)| s.is_finite()).collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(k).map(|(n, _)| n).collect()
    }
}
