//! Concrete `HypervisorClient` talking to a Proxmox-shaped REST API.
//!
//! Ticket-based authentication mirrors the original client: a login call
//! exchanges credentials for a session cookie plus CSRF token, both of which
//! are attached to every subsequent request and refreshed on expiry.

use super::HypervisorClient;
use crate::error::{BalancerError, Result};
use crate::models::{ClusterTask, NodeSnapshot, NodeStatus, VmSnapshot, VmStatus};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const TICKET_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Ticket {
    csrf_token: String,
    issued_at: Instant,
}

impl Ticket {
    fn is_expired(&self) -> bool {
        self.issued_at.elapsed() >= TICKET_LIFETIME
    }
}

/// A Proxmox VE cluster reachable over its `/api2/json` REST surface.
pub struct ProxmoxClient {
    base_url: String,
    user: String,
    password: String,
    http: reqwest::Client,
    ticket: Arc<RwLock<Option<Ticket>>>,
}

impl ProxmoxClient {
    pub fn new(base_url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .cookie_store(true)
            .build()
            .map_err(|e| BalancerError::hypervisor(e.to_string()))?;

        Ok(Self { base_url: base_url.into(), user: user.into(), password: password.into(), http, ticket: Arc::new(RwLock::new(None)) })
    }

    async fn ensure_authenticated(&self) -> Result<String> {
        {
            let guard = self.ticket.read().await;
            if let Some(ticket) = guard.as_ref() {
                if !ticket.is_expired() {
                    return Ok(ticket.csrf_token.clone());
                }
            }
        }
        self.login().await
    }

    async fn login(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct LoginData {
            #[serde(rename = "CSRFPreventionToken")]
            csrf_prevention_token: String,
        }
        #[derive(Deserialize)]
        struct LoginResponse {
            data: LoginData,
        }

        let url = format!("{}/api2/json/access/ticket", self.base_url);
        let resp = self
            .http
            .post(&url)
            .form(&[("username", self.user.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(|e| BalancerError::Unauthorized(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(BalancerError::Unauthorized(format!("login rejected: {}", resp.status())));
        }

        let body: LoginResponse = resp.json().await.map_err(|e| BalancerError::Unauthorized(e.to_string()))?;
        let csrf = body.data.csrf_prevention_token;

        let mut guard = self.ticket.write().await;
        *guard = Some(Ticket { csrf_token: csrf.clone(), issued_at: Instant::now() });
        Ok(csrf)
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value> {
        self.ensure_authenticated().await?;
        let url = format!("{}/api2/json{}", self.base_url, path);
        let resp = self.http.get(&url).send().await.map_err(|e| BalancerError::hypervisor(e.to_string()))?;
        self.read_data(resp).await
    }

    async fn post(&self, path: &str, form: &[(&str, &str)]) -> Result<serde_json::Value> {
        let csrf = self.ensure_authenticated().await?;
        let url = format!("{}/api2/json{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("CSRFPreventionToken", csrf)
            .form(form)
            .send()
            .await
            .map_err(|e| BalancerError::hypervisor(e.to_string()))?;
        self.read_data(resp).await
    }

    async fn read_data(&self, resp: reqwest::Response) -> Result<serde_json::Value> {
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BalancerError::Unauthorized("ticket rejected by hypervisor".into()));
        }
        if !resp.status().is_success() {
            return Err(BalancerError::hypervisor(format!("request failed: {}", resp.status())));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| BalancerError::hypervisor(e.to_string()))?;
        body.get("data").cloned().ok_or_else(|| BalancerError::hypervisor("response missing data field"))
    }
}

#[async_trait]
impl HypervisorClient for ProxmoxClient {
    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>> {
        let data = self.get("/nodes").await?;
        let entries = data.as_array().ok_or_else(|| BalancerError::hypervisor("nodes: expected array"))?;

        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry.get("node").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let status = match entry.get("status").and_then(|v| v.as_str()) {
                Some("online") => NodeStatus::Online,
                _ => NodeStatus::Offline,
            };

            // Detailed utilization requires a per-node status call; skip
            // offline nodes to avoid a doomed round trip.
            if status == NodeStatus::Offline {
                nodes.push(NodeSnapshot {
                    name,
                    status,
                    cpu_usage: 0.0,
                    cpu_count: 0,
                    mem_used: 0,
                    mem_total: 0,
                    disk_used: 0,
                    disk_total: 0,
                    load: None,
                    uptime: None,
                });
                continue;
            }

            match self.node_status(&name).await {
                Ok(snapshot) => nodes.push(snapshot),
                Err(e) => {
                    warn!(node = %name, error = %e, "failed to fetch node status, skipping this tick");
                }
            }
        }
        Ok(nodes)
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSnapshot>> {
        let data = self.get(&format!("/nodes/{node}/qemu")).await?;
        let entries = data.as_array().ok_or_else(|| BalancerError::hypervisor("vms: expected array"))?;

        let mut vms = Vec::with_capacity(entries.len());
        for entry in entries {
            let vmid = entry.get("vmid").and_then(|v| v.as_u64()).unwrap_or_default() as u32;
            let status = match entry.get("status").and_then(|v| v.as_str()) {
                Some("running") => VmStatus::Running,
                Some("stopped") => VmStatus::Stopped,
                Some("paused") => VmStatus::Paused,
                _ => VmStatus::Unknown,
            };
            vms.push(VmSnapshot {
                vmid,
                name: entry.get("name").and_then(|v| v.as_str()).map(str::to_string),
                status,
                node: node.to_string(),
                cpu_usage: entry.get("cpu").and_then(|v| v.as_f64()).unwrap_or(0.0),
                mem_used: entry.get("mem").and_then(|v| v.as_u64()).unwrap_or(0),
                mem_max: entry.get("maxmem").and_then(|v| v.as_u64()).unwrap_or(0),
                max_cpu: entry.get("cpus").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                max_disk: entry.get("maxdisk").and_then(|v| v.as_u64()).unwrap_or(0),
                uptime: entry.get("uptime").and_then(|v| v.as_u64()),
            });
        }
        Ok(vms)
    }

    async fn list_cluster_tasks(&self, running_only: bool) -> Result<Vec<ClusterTask>> {
        let data = self.get("/cluster/tasks").await?;
        let entries = data.as_array().ok_or_else(|| BalancerError::hypervisor("tasks: expected array"))?;

        let mut tasks = Vec::new();
        for entry in entries {
            let status = entry.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string();
            if running_only && !status.is_empty() {
                continue;
            }
            tasks.push(ClusterTask {
                task_type: entry.get("type").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                id: entry.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                status: if status.is_empty() { "running".to_string() } else { status },
                exit_status: entry.get("exitstatus").and_then(|v| v.as_str()).map(str::to_string),
                start_time: entry.get("starttime").and_then(|v| v.as_i64()).unwrap_or(0),
            });
        }
        Ok(tasks)
    }

    async fn migrate(&self, source: &str, vmid: u32, target: &str, online: bool, with_local_disks: bool) -> Result<()> {
        debug!(%source, vmid, %target, online, with_local_disks, "dispatching migration");
        let online_str = if online { "1" } else { "0" };
        let disks_str = if with_local_disks { "1" } else { "0" };
        let vmid_str = vmid.to_string();
        self.post(
            &format!("/nodes/{source}/qemu/{vmid}/migrate"),
            &[("target", target), ("online", online_str), ("with-local-disks", disks_str), ("vmid", vmid_str.as_str())],
        )
        .await?;
        Ok(())
    }
}

impl ProxmoxClient {
    async fn node_status(&self, name: &str) -> Result<NodeSnapshot> {
        let data = self.get(&format!("/nodes/{name}/status")).await?;

        let cpu = data.get("cpu").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let cpu_count = data.pointer("/cpuinfo/cpus").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
        let mem_total = data.pointer("/memory/total").and_then(|v| v.as_u64()).unwrap_or(0);
        let mem_used = data.pointer("/memory/used").and_then(|v| v.as_u64()).unwrap_or(0);
        let disk_total = data.pointer("/rootfs/total").and_then(|v| v.as_u64()).unwrap_or(0);
        let disk_used = data.pointer("/rootfs/used").and_then(|v| v.as_u64()).unwrap_or(0);
        let load = data
            .pointer("/loadavg/0")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok());
        let uptime = data.get("uptime").and_then(|v| v.as_u64());

        Ok(NodeSnapshot {
            name: name.to_string(),
            status: NodeStatus::Online,
            cpu_usage: cpu,
            cpu_count,
            mem_used,
            mem_total,
            disk_used,
            disk_total,
            load,
            uptime,
        })
    }
}
