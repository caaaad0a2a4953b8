//! Command-line surface (§6). Mirrors the original binary's mode switch:
//! exactly one mode runs per invocation, daemon mode being the default.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hv-balancer", about = "Autonomic workload balancer for a hypervisor cluster")]
pub struct Cli {
    /// Path to the balancer's YAML/TOML configuration document.
    #[arg(long, env = "HVBAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base URL of the hypervisor's REST API, e.g. https://pve.example.com:8006.
    #[arg(long, env = "HVBAL_HYPERVISOR_URL")]
    pub hypervisor_url: Option<String>,

    /// Hypervisor account used to obtain a ticket.
    #[arg(long, env = "HVBAL_HYPERVISOR_USER")]
    pub hypervisor_user: Option<String>,

    /// Hypervisor account password.
    #[arg(long, env = "HVBAL_HYPERVISOR_PASSWORD")]
    pub hypervisor_password: Option<String>,

    /// Address the management API binds to.
    #[arg(long, default_value = "0.0.0.0:8787")]
    pub bind: String,

    #[command(subcommand)]
    pub mode: Option<Mode>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Mode {
    /// Run the balancing loop and management API forever (the default).
    Daemon,
    /// Run a single tick and exit.
    Once,
    /// Print current cluster status as JSON and exit.
    Status,
    /// Print migration recommendations as JSON and exit, without dispatching.
    Recommendations,
    /// Print the effective configuration as JSON and exit.
    Config,
    /// Validate the configuration document and exit 0/1.
    CheckConfig,
    /// Recompute `critical_vms` from current group membership and exit.
    UpdateCriticalVms,
}
