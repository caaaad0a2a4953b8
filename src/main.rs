//! Binary entry point: CLI dispatch, config load, hypervisor client wiring,
//! and (for daemon mode) the balancer loop plus management API running side
//! by side with shared graceful shutdown, mirroring the teacher's
//! `nexus-api-server` `serve()`/`shutdown_signal()` pattern.

use clap::Parser;
use hv_balancer::api::{self, compute_recommendations, ApiContext};
use hv_balancer::balancer::BalancerLoop;
use hv_balancer::cli::{Cli, Mode};
use hv_balancer::config::BalancerConfig;
use hv_balancer::hypervisor::proxmox::ProxmoxClient;
use hv_balancer::hypervisor::HypervisorClient;
use hv_balancer::state::{new_app_state, AppState};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "hv_balancer=info".into()))
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "hv-balancer exited with an error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> hv_balancer::Result<()> {
    let config = BalancerConfig::load(cli.config.as_deref())?;

    match cli.mode.unwrap_or(Mode::Daemon) {
        Mode::CheckConfig => {
            println!("configuration is valid");
            Ok(())
        }
        Mode::Config => {
            println!("{}", serde_json::to_string_pretty(&config).unwrap_or_default());
            Ok(())
        }
        Mode::Daemon => run_daemon(cli, config).await,
        Mode::Once => {
            let client = build_client(&cli)?;
            let loop_ = BalancerLoop::new(client);
            let state = new_app_state(config);
            loop_.tick(&state).await
        }
        Mode::Status => {
            let client = build_client(&cli)?;
            let nodes = client.list_nodes().await?;
            println!("{}", serde_json::to_string_pretty(&nodes).unwrap_or_default());
            Ok(())
        }
        Mode::Recommendations => {
            let client = build_client(&cli)?;
            let state = new_app_state(config);
            let recommendations = compute_recommendations(client.as_ref(), &state, true).await?;
            println!("{}", serde_json::to_string_pretty(&recommendations).unwrap_or_default());
            Ok(())
        }
        Mode::UpdateCriticalVms => {
            info!("update-critical-vms is served via the management API's POST /api/critical_vms/update in daemon mode");
            Ok(())
        }
    }
}

fn build_client(cli: &Cli) -> hv_balancer::Result<Arc<dyn HypervisorClient>> {
    let base_url = cli.hypervisor_url.clone().ok_or_else(|| {
        hv_balancer::BalancerError::ConfigInvalid("--hypervisor-url (or HVBAL_HYPERVISOR_URL) is required".into())
    })?;
    let user = cli.hypervisor_user.clone().unwrap_or_default();
    let password = cli.hypervisor_password.clone().unwrap_or_default();
    Ok(Arc::new(ProxmoxClient::new(base_url, user, password)?))
}

async fn run_daemon(cli: Cli, config: BalancerConfig) -> hv_balancer::Result<()> {
    let client = build_client(&cli)?;
    let state: AppState = new_app_state(config);
    let balancer = Arc::new(BalancerLoop::new(client.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let ctx = ApiContext { state: state.clone(), client, balancer: balancer.clone() };
    let app = api::router(ctx);

    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .map_err(|e| hv_balancer::BalancerError::ConfigInvalid(format!("failed to bind {}: {e}", cli.bind)))?;
    info!(addr = %cli.bind, "management API listening");

    let loop_state = state.clone();
    let loop_rx = shutdown_rx.clone();
    let balancer_handle = tokio::spawn(async move {
        balancer.run(loop_state, loop_rx).await;
    });

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_tx));
    if let Err(e) = server.await {
        error!(error = %e, "management API server error");
    }

    let _ = balancer_handle.await;
    Ok(())
}

/// Waits for ctrl_c or SIGTERM, then flips the shared shutdown flag so the
/// balancer loop's sleep also wakes and exits.
async fn shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
