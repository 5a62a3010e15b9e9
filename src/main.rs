//! kmcp - access-controlled multi-cluster Kubernetes core for MCP servers

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use kmcp_cluster::{reload_fn, ProviderParams, ProviderRegistry};
use kmcp_common::config::{ConfigRegistries, Loader};
use kmcp_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kmcp_common::StaticConfig;

/// kmcp - Kubernetes access layer for MCP tool servers
#[derive(Parser, Debug)]
#[command(name = "kmcp", version, about, long_about = None)]
struct Cli {
    /// Main TOML configuration file
    #[arg(long, env = "KMCP_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of drop-in TOML files, applied in lexical order after the main file
    #[arg(long, env = "KMCP_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Kubeconfig file; overrides the configuration file
    #[arg(long)]
    kubeconfig: Option<String>,

    /// Cluster provider strategy (in-cluster, disabled, kubeconfig, acm, acm-kubeconfig)
    #[arg(long)]
    cluster_provider: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "KMCP_LOG_JSON")]
    log_json: bool,

    /// Reject tool calls that carry no bearer token
    #[arg(long)]
    require_oauth: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        default_filter: None,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let registries = kmcp_cluster::config_registries();
    let providers = ProviderRegistry::default();

    loop {
        let config = Arc::new(load_config(&cli, &registries)?);
        let provider = providers
            .create(ProviderParams::new(config))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create cluster provider: {}", e))?;
        info!(
            strategy = provider.strategy(),
            parameter = provider.target_parameter_name(),
            targets = ?provider.targets(),
            default_target = %provider.default_target(),
            "Cluster provider ready"
        );

        // Watchers only signal; the provider is rebuilt here
        let (tx, mut rx) = mpsc::channel::<()>(1);
        provider
            .watch_targets(reload_fn(move || {
                let tx = tx.clone();
                async move {
                    let _ = tx.try_send(());
                    Ok(())
                }
            }))
            .await;

        let reload = tokio::select! {
            _ = tokio::signal::ctrl_c() => false,
            Some(()) = rx.recv() => true,
        };
        provider.close().await;

        if !reload {
            info!("Shutting down");
            return Ok(());
        }
        info!("Cluster configuration changed, reloading provider");
    }
}

/// Load configuration files and apply command line overrides
fn load_config(cli: &Cli, registries: &ConfigRegistries) -> anyhow::Result<StaticConfig> {
    let mut config = Loader::new(registries)
        .read(cli.config.as_deref(), cli.config_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(kubeconfig) = &cli.kubeconfig {
        config.kubeconfig = Some(kubeconfig.clone());
    }
    if let Some(strategy) = &cli.cluster_provider {
        config.cluster_provider_strategy = Some(strategy.clone());
    }
    if cli.require_oauth {
        config.require_oauth = true;
    }
    Ok(config)
}
