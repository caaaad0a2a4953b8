//! The single piece of shared mutable state the balancer loop and the
//! management API both touch (§5). Exactly one mutex guards it; holders must
//! never issue hypervisor I/O while holding the lock. Readers clone what they
//! need and release the lock before formatting a response.

use crate::config::BalancerConfig;
use crate::history::ResourceHistoryStore;
use crate::models::{LastBalanceMap, MigrationRecord, VmGroup};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct SharedState {
    pub history: ResourceHistoryStore,
    pub migrations: Vec<MigrationRecord>,
    pub config: BalancerConfig,
    pub last_balance: LastBalanceMap,
    pub vm_groups: Vec<VmGroup>,
    pub last_resource_update: DateTime<Utc>,
    pub last_group_update: DateTime<Utc>,
    pub running: bool,
}

impl SharedState {
    pub fn new(config: BalancerConfig) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            history: ResourceHistoryStore::new(),
            migrations: Vec::new(),
            config,
            last_balance: LastBalanceMap::new(),
            vm_groups: Vec::new(),
            last_resource_update: epoch,
            last_group_update: epoch,
            running: true,
        }
    }
}

/// Shared handle passed to both the balancer loop and the API router.
pub type AppState = Arc<Mutex<SharedState>>;

pub fn new_app_state(config: BalancerConfig) -> AppState {
    Arc::new(Mutex::new(SharedState::new(config)))
}
