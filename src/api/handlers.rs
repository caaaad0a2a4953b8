//! Handlers for the 13 management API endpoints (§6).

use super::error::ApiError;
use super::ApiContext;
use crate::affinity::AffinityDiscovery;
use crate::anomaly::AnomalyDetector;
use crate::config::BalancerConfig;
use crate::gate::MigrationGate;
use crate::imbalance::ImbalanceDetector;
use crate::models::{MigrationOutcome, MigrationReason, MigrationRecord, VmRequirements, VmStatus};
use crate::scorer::NodeScorer;
use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;

pub async fn get_status(State(ctx): State<ApiContext>) -> Result<Json<Value>, ApiError> {
    let nodes = ctx.client.list_nodes().await?;
    let guard = ctx.state.lock().await;

    let excluded: HashSet<String> = guard.config.node_exclusions.iter().cloned().collect();
    let detector = ImbalanceDetector::new(guard.config.high_load_threshold, guard.config.low_load_threshold);
    let overloaded: Vec<&str> = detector.overloaded(&nodes, &excluded).into_iter().map(|n| n.name.as_str()).collect();
    let underloaded: Vec<&str> = detector.underloaded(&nodes, &excluded).into_iter().map(|n| n.name.as_str()).collect();

    let recent: Vec<&MigrationRecord> = guard.migrations.iter().rev().take(10).collect();

    Ok(Json(json!({
        "running": guard.running,
        "config": guard.config,
        "migration_history": recent,
        "overloaded": overloaded,
        "underloaded": underloaded,
    })))
}

pub async fn get_health(State(ctx): State<ApiContext>) -> Result<Json<Value>, ApiError> {
    let nodes = ctx.client.list_nodes().await?;
    let mut vms = Vec::new();
    for node in nodes.iter().filter(|n| n.is_online()) {
        vms.extend(ctx.client.list_vms(&node.name).await.unwrap_or_default());
    }

    let guard = ctx.state.lock().await;

    let total = guard.migrations.len();
    let success = guard.migrations.iter().filter(|m| m.outcome == MigrationOutcome::Success).count();
    let failed = guard.migrations.iter().filter(|m| matches!(m.outcome, MigrationOutcome::Failed { .. })).count();
    let success_rate = if total == 0 { 1.0 } else { success as f64 / total as f64 };
    let recent: Vec<&MigrationRecord> = guard.migrations.iter().rev().take(10).collect();

    let anomalies = AnomalyDetector::detect(&nodes, &vms, &guard.history);

    Ok(Json(json!({
        "nodes": nodes,
        "vms": vms,
        "migrations": {
            "recent": recent,
            "successRate": success_rate,
            "total": total,
            "success": success,
            "failed": failed,
        },
        "anomalies": anomalies,
    })))
}

#[derive(Deserialize)]
pub struct RecommendationsQuery {
    #[serde(default)]
    detail: Option<String>,
}

pub async fn get_recommendations(State(ctx): State<ApiContext>, Query(q): Query<RecommendationsQuery>) -> Result<Json<Value>, ApiError> {
    let detailed = q.detail.as_deref() == Some("detailed");
    let out = compute_recommendations(ctx.client.as_ref(), &ctx.state, detailed).await?;
    Ok(Json(out))
}

/// The dry-run recommendation plan shared by `GET /api/recommendations` and
/// the CLI's `--recommendations` mode: scores overloaded nodes' eligible VMs
/// against the cluster and reports candidate destinations, without ever
/// calling `HypervisorClient::migrate`.
pub async fn compute_recommendations(
    client: &dyn crate::hypervisor::HypervisorClient,
    state: &crate::state::AppState,
    detailed: bool,
) -> crate::error::Result<Value> {
    let nodes = client.list_nodes().await?;
    let mut vms = Vec::new();
    for node in nodes.iter().filter(|n| n.is_online()) {
        vms.extend(client.list_vms(&node.name).await.unwrap_or_default());
    }

    let guard = state.lock().await;
    let excluded_nodes: HashSet<String> = guard.config.node_exclusions.iter().cloned().collect();
    let detector = ImbalanceDetector::new(guard.config.high_load_threshold, guard.config.low_load_threshold);
    let overloaded = detector.overloaded(&nodes, &excluded_nodes);
    let scorer = NodeScorer::new(&guard.history, guard.config.resource_weights);
    let gate = MigrationGate {
        excluded_vms: &guard.config.vm_exclusions,
        min_balance_interval: chrono::Duration::seconds(guard.config.min_balance_interval_secs),
        consider_time_of_day: guard.config.consider_time_of_day,
        off_hours: guard.config.off_hours,
    };
    let now = Utc::now();

    let mut out = Vec::new();
    for node in overloaded {
        let mut candidates: Vec<_> = vms
            .iter()
            .filter(|v| v.node == node.name && v.status == VmStatus::Running)
            .filter(|v| gate.may_migrate(v.vmid, &guard.last_balance, now))
            .collect();
        candidates.sort_by(|a, b| b.cpu_usage.partial_cmp(&a.cpu_usage).unwrap_or(std::cmp::Ordering::Equal));

        for vm in candidates {
            let req = VmRequirements::from_vm(vm);
            let targets: Vec<&crate::models::NodeSnapshot> =
                scorer.recommend(&nodes, 4, Some(&req)).into_iter().filter(|n| n.name != node.name).take(3).collect();
            let target_names: Vec<&str> = targets.iter().map(|n| n.name.as_str()).collect();

            let mut entry = json!({
                "vmid": vm.vmid,
                "source": node.name,
                "targets": target_names,
                "vmName": vm.name,
                "requirements": req,
            });

            if detailed {
                let impact: Vec<Value> = targets
                    .iter()
                    .map(|t| json!({ "node": t.name, "projectedScore": scorer.score(t, Some(&req)) }))
                    .collect();
                entry["impact"] = json!(impact);
            }

            out.push(entry);
        }
    }

    Ok(json!(out))
}

pub async fn get_nodes(State(ctx): State<ApiContext>) -> Result<Json<Value>, ApiError> {
    let nodes = ctx.client.list_nodes().await?;
    Ok(Json(json!({ "nodes": nodes })))
}

pub async fn get_vms(State(ctx): State<ApiContext>) -> Result<Json<Value>, ApiError> {
    let nodes = ctx.client.list_nodes().await?;
    let mut vms = Vec::new();
    for node in nodes.iter().filter(|n| n.is_online()) {
        vms.extend(ctx.client.list_vms(&node.name).await.unwrap_or_default());
    }
    Ok(Json(json!({ "vms": vms })))
}

#[derive(Deserialize)]
pub struct ManualMigrateRequest {
    pub vm_id: u32,
    pub source_node: String,
    pub target_node: String,
    #[serde(default = "default_true")]
    pub online: bool,
    #[serde(default = "default_true")]
    pub with_local_disks: bool,
}

fn default_true() -> bool {
    true
}

/// Mirrors the original system's manual-migrate behavior exactly: it does
/// *not* check exclusions or cool-down (§9 resolved open question), but it
/// does still verify the destination can take the VM before dispatching.
pub async fn post_migrate(State(ctx): State<ApiContext>, Json(req): Json<ManualMigrateRequest>) -> Result<Json<Value>, ApiError> {
    let nodes = ctx.client.list_nodes().await?;
    let vms = ctx.client.list_vms(&req.source_node).await?;
    let vm = vms
        .iter()
        .find(|v| v.vmid == req.vm_id)
        .ok_or_else(|| crate::error::BalancerError::NotFound(format!("vmid {} on node {}", req.vm_id, req.source_node)))?;

    let target = nodes
        .iter()
        .find(|n| n.name == req.target_node)
        .ok_or_else(|| crate::error::BalancerError::NotFound(format!("node {}", req.target_node)))?;

    let requirements = VmRequirements::from_vm(vm);
    let impact_score = {
        let guard = ctx.state.lock().await;
        let scorer = NodeScorer::new(&guard.history, guard.config.resource_weights);
        scorer.score(target, Some(&requirements))
    };

    if !impact_score.is_finite() {
        return Err(crate::error::BalancerError::Infeasible { vmid: req.vm_id }.into());
    }

    ctx.client.migrate(&req.source_node, req.vm_id, &req.target_node, req.online, req.with_local_disks).await?;

    let now = Utc::now();
    {
        let mut guard = ctx.state.lock().await;
        guard.migrations.push(MigrationRecord {
            id: uuid::Uuid::new_v4(),
            vmid: req.vm_id,
            vm_name: vm.name.clone(),
            source: req.source_node.clone(),
            target: req.target_node.clone(),
            start_ts: now,
            reason: MigrationReason::Manual,
            requirements,
            outcome: MigrationOutcome::Initiated,
            completion_ts: None,
        });
    }

    Ok(Json(json!({
        "status": "ok",
        "message": format!("migration of {} from {} to {} dispatched", req.vm_id, req.source_node, req.target_node),
        "impact_analysis": { "projectedScore": impact_score },
    })))
}

pub async fn post_balance(State(ctx): State<ApiContext>) -> Result<Json<Value>, ApiError> {
    ctx.balancer.tick(&ctx.state).await?;
    Ok(Json(json!({ "status": "ok", "message": "balance tick completed" })))
}

pub async fn get_config(State(ctx): State<ApiContext>) -> Json<BalancerConfig> {
    let guard = ctx.state.lock().await;
    Json(guard.config.clone())
}

pub async fn put_config(State(ctx): State<ApiContext>, Json(update): Json<serde_json::Value>) -> Result<Json<BalancerConfig>, ApiError> {
    let mut guard = ctx.state.lock().await;
    let mut current = serde_json::to_value(&guard.config).map_err(|e| crate::error::BalancerError::ConfigInvalid(e.to_string()))?;
    merge_json(&mut current, &update);
    let merged: BalancerConfig = serde_json::from_value(current).map_err(|e| crate::error::BalancerError::ConfigInvalid(e.to_string()))?;
    guard.config = merged.normalized();
    Ok(Json(guard.config.clone()))
}

fn merge_json(base: &mut Value, update: &Value) {
    match (base, update) {
        (Value::Object(base_map), Value::Object(update_map)) => {
            for (k, v) in update_map {
                merge_json(base_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (base, update) => *base = update.clone(),
    }
}

pub async fn get_vm_groups(State(ctx): State<ApiContext>) -> Json<Value> {
    let guard = ctx.state.lock().await;
    Json(json!({ "vm_groups": guard.vm_groups }))
}

pub async fn post_vm_groups_update(State(ctx): State<ApiContext>) -> Result<Json<Value>, ApiError> {
    let nodes = ctx.client.list_nodes().await?;
    let mut vms = Vec::new();
    for node in nodes.iter().filter(|n| n.is_online()) {
        vms.extend(ctx.client.list_vms(&node.name).await.unwrap_or_default());
    }

    let mut guard = ctx.state.lock().await;
    let name_groups = AffinityDiscovery::name_pattern_groups(&vms);
    let correlated = AffinityDiscovery::correlated_groups(&vms, &guard.history);
    let mut detected = name_groups;
    detected.extend(correlated);
    let persisted = std::mem::take(&mut guard.vm_groups);
    guard.vm_groups = AffinityDiscovery::merge(persisted, detected);
    guard.last_group_update = Utc::now();

    Ok(Json(json!({ "vm_groups": guard.vm_groups })))
}

/// Recomputes the critical-VM list: any VM participating in a multi-member
/// group is treated as critical, unioned with whatever was already marked so
/// (the original's grading criteria for "critical" is undocumented; grouped
/// membership is the closest in-scope signal — see DESIGN.md).
pub async fn post_critical_vms_update(State(ctx): State<ApiContext>) -> Json<Value> {
    let mut guard = ctx.state.lock().await;
    let mut critical: HashSet<u32> = guard.config.critical_vms.iter().copied().collect();
    for group in &guard.vm_groups {
        critical.extend(group.members.iter().copied());
    }
    guard.config.critical_vms = critical.into_iter().collect();
    guard.config.critical_vms.sort_unstable();
    Json(json!({ "critical_vms": guard.config.critical_vms }))
}

pub async fn get_anomalies(State(ctx): State<ApiContext>) -> Result<Json<Value>, ApiError> {
    let nodes = ctx.client.list_nodes().await?;
    let mut vms = Vec::new();
    for node in nodes.iter().filter(|n| n.is_online()) {
        vms.extend(ctx.client.list_vms(&node.name).await.unwrap_or_default());
    }
    let guard = ctx.state.lock().await;
    let anomalies = AnomalyDetector::detect(&nodes, &vms, &guard.history);
    Ok(Json(json!({ "anomalies": anomalies })))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
    vm_id: Option<u32>,
}

pub async fn get_migrations_history(State(ctx): State<ApiContext>, Query(q): Query<HistoryQuery>) -> Json<Value> {
    let guard = ctx.state.lock().await;
    let limit = q.limit.unwrap_or(50);

    let filtered: Vec<&MigrationRecord> = guard
        .migrations
        .iter()
        .rev()
        .filter(|m| q.vm_id.map(|id| id == m.vmid).unwrap_or(true))
        .take(limit)
        .collect();

    Json(json!({ "migrations": filtered }))
}
