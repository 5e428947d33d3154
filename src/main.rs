// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{Context, Result};
use clap::Parser;
use cp_node::api::{build_router, AppState};
use cp_node::chain::{ChainClient, ChainClientConfig};
use cp_node::config::resolver::ConfigResolver;
use cp_node::config::Config;
use cp_node::edge::HttpEdgeStatusClient;
use cp_node::executor::BollardExecutor;
use cp_node::monitoring::Metrics;
use cp_node::pricing::PricingEngine;
use cp_node::probe::DockerResourceProbe;
use cp_node::reconciler::sweeper::StaleSweeper;
use cp_node::reconciler::Reconciler;
use cp_node::registry::{JobRegistry, SqliteJobRegistry};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "cp-node")]
struct Cli {
    /// Path to the node's TOML configuration file.
    #[arg(long, env = "CP_NODE_CONFIG", default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(&cli.config).with_context(|| "loading node configuration")?;

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", &config.log_level);
    }
    tracing_subscriber::fmt::init();

    tracing::info!(listen_addr = %config.listen_addr, "starting compute-provider node");

    let registry: Arc<dyn JobRegistry> =
        Arc::new(SqliteJobRegistry::open(&config.db_path).with_context(|| "opening job registry")?);

    let docker = bollard::Docker::connect_with_local_defaults()
        .with_context(|| "connecting to the container daemon")?;
    let probe = Arc::new(DockerResourceProbe::new(
        docker.clone(),
        config.resource_exporter_container.clone(),
    ));
    let executor = Arc::new(BollardExecutor::new(docker));
    let pricing = PricingEngine::new(config.price_table);
    let metrics = Metrics::new();

    let admission = Arc::new(cp_node::AdmissionController::with_metrics(
        probe,
        pricing,
        registry.clone(),
        executor.clone(),
        config.pricing_enabled,
        metrics.clone(),
    ));

    let chain_id = std::env::var("CP_NODE_CHAIN_ID")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(1);
    let chain = Arc::new(
        ChainClient::connect(ChainClientConfig {
            rpc_url: config.chain_rpc.clone(),
            chain_id,
        })
        .await
        .with_context(|| "connecting to chain RPC")?,
    );
    let edge: Arc<dyn cp_node::edge::EdgeStatusClient> =
        Arc::new(HttpEdgeStatusClient::new(config.edge_url.clone()));
    let resolver = ConfigResolver::new(&config);

    let reconciler = Arc::new(Reconciler::with_metrics(
        chain.clone(),
        edge.clone(),
        registry.clone(),
        executor.clone(),
        resolver,
        config.cp_account_address,
        config.task_payment_created_block,
        metrics.clone(),
    ));
    tokio::spawn(reconciler.run(config.reconciler_interval()));

    let sweeper = Arc::new(StaleSweeper::with_metrics(
        chain,
        edge,
        registry.clone(),
        executor,
        config.cp_account_address,
        config.stale_block_threshold,
        metrics.clone(),
    ));
    tokio::spawn(sweeper.run(config.sweeper_interval()));

    let state = AppState {
        admission,
        registry,
        metrics,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding to {}", config.listen_addr))?;
    axum::serve(listener, app)
        .await
        .with_context(|| "serving HTTP API")?;

    Ok(())
}
