use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use xnode::{
    config::{Cli, Config},
    controller::{Controller, ControllerOptions},
    panel::{LocalOverrides, PanelClient, PanelOptions},
    service::Service,
    xray::GrpcRuntime,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    run(cli.config).await
}

async fn run(config: Config) -> Result<()> {
    let build = config.build_context()?;
    let local_rules = match &config.rule_list_path {
        Some(path) => xnode::rules::load_local_rules(path),
        None => Vec::new(),
    };

    let panel = PanelClient::new(PanelOptions {
        api_host: config.api_host.clone(),
        api_key: config.api_key.clone(),
        timeout: config.api_timeout(),
        overrides: LocalOverrides {
            node_id: config.node_id,
            device_limit: config.device_limit,
            speed_limit: config.speed_limit,
        },
    })
    .map_err(|e| anyhow::anyhow!("build control-plane client: {e}"))?;
    let runtime = GrpcRuntime::connect_lazy(config.runtime_api_addr)
        .map_err(|e| anyhow::anyhow!("runtime api {}: {e}", config.runtime_api_addr))?;

    let controller = Arc::new(Controller::new(
        Arc::new(panel),
        Arc::new(runtime),
        ControllerOptions {
            build,
            local_rules,
            disable_get_rule: config.disable_get_rule,
            disable_upload_traffic: config.disable_upload_traffic,
        },
    ));
    controller
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("initial sync: {e}"))?;

    info!(
        version = xnode::version::VERSION,
        node_id = config.node_id,
        api_host = %config.api_host,
        "xnode started"
    );
    let service = Service::spawn(controller, config.update_interval());

    shutdown_signal().await;
    info!("shutting down");
    service.close().await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
