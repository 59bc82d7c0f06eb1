//! AMAS engine: adaptive word-practice scheduling with a LinUCB bandit.
//!
//! Loads configuration, wires the dispatcher registry (accelerated backend,
//! circuit breaker, worker pool) and drives it with a simulated learning
//! session, then reports stats and tears the pool down.

mod simulation;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use amas_core::config::EngineConfig;
use amas_dispatch::DispatcherRegistry;
use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "amas-engine")]
#[command(about = "Adaptive bandit engine with accelerated/reference dispatch")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML/YAML/JSON); environment still overrides it
    #[arg(long, env = "AMAS_ENGINE_CONFIG")]
    config: Option<String>,

    /// Simulated learners
    #[arg(long, default_value_t = 8)]
    users: usize,

    /// Select/update rounds per learner
    #[arg(long, default_value_t = 200)]
    rounds: usize,

    /// Feature dimension (overrides config)
    #[arg(long, env = "AMAS_ENGINE__BANDIT__DIMENSION")]
    dimension: Option<usize>,

    /// Use only the reference model
    #[arg(long, default_value_t = false)]
    no_accelerated: bool,

    /// Run every kernel on the caller
    #[arg(long, default_value_t = false)]
    no_worker: bool,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "AMAS_ENGINE__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Seed for the simulated learners
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amas_engine=info,amas_dispatch=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("AMAS engine starting up");

    let mut config = EngineConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    if let Some(dimension) = cli.dimension {
        config.bandit.dimension = dimension;
    }
    if cli.no_accelerated {
        config.accelerator.use_accelerated = false;
    }
    if cli.no_worker {
        config.worker.use_worker = false;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = Some(port);
    }
    config.validate()?;

    info!(
        dimension = config.bandit.dimension,
        alpha = config.bandit.alpha,
        accelerated = config.accelerator.use_accelerated,
        worker = config.worker.use_worker,
        "Configuration loaded"
    );

    if let Some(port) = config.metrics.port {
        let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => info!(port, "Metrics exporter started"),
            Err(e) => error!(error = %e, "Failed to start metrics exporter"),
        }
    }

    let registry = Arc::new(DispatcherRegistry::from_config(&config)?);
    if let Some(pool) = registry.pool() {
        pool.start()?;
    }

    let report = simulation::run(Arc::clone(&registry), cli.users, cli.rounds, cli.seed).await?;
    info!(
        selections = report.selections,
        mean_reward = report.mean_reward,
        "Simulation finished"
    );

    let mut users = Vec::new();
    for user_id in registry.user_ids() {
        if let Some(dispatcher) = registry.get(&user_id) {
            let dispatcher = dispatcher.lock().await;
            let healthy = dispatcher.self_test();
            if !healthy {
                warn!(user = %user_id, "self-test failed");
            }
            users.push(json!({
                "userId": user_id,
                "updateCount": dispatcher.model().update_count(),
                "selfTest": healthy,
                "diagnostics": dispatcher.diagnose(),
                "stats": dispatcher.stats(),
            }));
        }
    }

    let summary = json!({
        "simulation": report,
        "breaker": registry.breaker().snapshot(),
        "offload": registry.offload().stats(),
        "pool": registry.pool().and_then(|p| p.stats()),
        "users": users,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    registry.shutdown().await;
    info!("AMAS engine shut down");
    Ok(())
}
