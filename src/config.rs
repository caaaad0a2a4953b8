//! Layered configuration: defaults → file → environment → CLI overrides.

use crate::error::{BalancerError, Result};
use crate::models::{OffHoursWindow, ResourceWeights};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// The full persisted configuration document (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub check_interval_secs: u64,
    pub high_load_threshold: f64,
    pub low_load_threshold: f64,
    pub min_balance_interval_secs: i64,
    pub max_parallel_migrations: usize,
    pub migrate_high_load: bool,
    pub migrate_to_low_load: bool,
    pub resource_weights: ResourceWeights,
    pub vm_exclusions: Vec<u32>,
    pub node_exclusions: Vec<String>,
    pub consider_affinity: bool,
    pub vm_groups: HashMap<String, Vec<u32>>,
    pub consider_time_of_day: bool,
    pub off_hours: OffHoursWindow,
    pub learning_enabled: bool,
    pub auto_configure_hypervisor: bool,
    pub critical_vms: Vec<u32>,
    pub stale_migration_timeout_ticks: u32,
    pub api_key: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            high_load_threshold: 0.8,
            low_load_threshold: 0.2,
            min_balance_interval_secs: 3600,
            max_parallel_migrations: 2,
            migrate_high_load: true,
            migrate_to_low_load: true,
            resource_weights: ResourceWeights::default(),
            vm_exclusions: Vec::new(),
            node_exclusions: Vec::new(),
            consider_affinity: true,
            vm_groups: HashMap::new(),
            consider_time_of_day: true,
            off_hours: OffHoursWindow::default(),
            learning_enabled: true,
            auto_configure_hypervisor: true,
            critical_vms: Vec::new(),
            stale_migration_timeout_ticks: 10,
            api_key: String::new(),
        }
    }
}

impl BalancerConfig {
    /// Loads defaults, then an optional config file, then `HVBAL_`-prefixed
    /// environment overrides, normalizing the result once at the end.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&BalancerConfig::default()).map_err(|e| {
                BalancerError::ConfigInvalid(format!("default config is not representable: {e}"))
            })?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("HVBAL").separator("__"));

        let settings = builder
            .build()
            .map_err(|e| BalancerError::ConfigInvalid(e.to_string()))?;

        let cfg: BalancerConfig = settings
            .try_deserialize()
            .map_err(|e| BalancerError::ConfigInvalid(e.to_string()))?;

        Ok(cfg.normalized())
    }

    /// Re-normalizes weights and validates the off-hours window, returning a
    /// corrected copy. Called once after every full merge (§10.3) and on
    /// every config write via the management API (§6).
    pub fn normalized(mut self) -> Self {
        self.resource_weights = self.resource_weights.normalized();
        if self.off_hours.start >= 24 || self.off_hours.end >= 24 {
            self.off_hours = OffHoursWindow::default();
        }
        self
    }

    pub fn is_excluded_node(&self, name: &str) -> bool {
        self.node_exclusions.iter().any(|n| n == name)
    }

    pub fn is_excluded_vm(&self, vmid: u32) -> bool {
        self.vm_exclusions.contains(&vmid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_sum_to_one() {
        let cfg = BalancerConfig::default().normalized();
        let w = cfg.resource_weights;
        let total = w.cpu + w.memory + w.disk + w.network;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn skewed_weights_are_renormalized() {
        let mut cfg = BalancerConfig::default();
        cfg.resource_weights = ResourceWeights { cpu: 1.0, memory: 1.0, disk: 1.0, network: 1.0 };
        let cfg = cfg.normalized();
        let w = cfg.resource_weights;
        assert!((w.cpu + w.memory + w.disk + w.network - 1.0).abs() < 1e-9);
        assert!((w.cpu - 0.25).abs() < 1e-9);
    }

    #[test]
    fn invalid_off_hours_falls_back_to_default() {
        let mut cfg = BalancerConfig::default();
        cfg.off_hours = OffHoursWindow { start: 40, end: 6 };
        let cfg = cfg.normalized();
        assert_eq!(cfg.off_hours.start, 22);
    }
}
