use meshkit::config::{AppConfig, DeployerConfig};
use meshkit::deployer::Deployer;
use meshkit::error::Result;
use meshkit::health::HealthReconciler;
use meshkit::listener::HttpListener;
use meshkit::runtime::DockerCli;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{error, info, warn};

const EXIT_CONFIG_LOAD: i32 = 2;
const EXIT_RUN: i32 = 4;

struct Config {
    app: AppConfig,
    deployer: DeployerConfig,
}

fn load_config() -> Result<Config> {
    Ok(Config {
        app: AppConfig::from_env()?,
        deployer: DeployerConfig::from_env()?,
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting deployer");

    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load config: {}", e);
            std::process::exit(EXIT_CONFIG_LOAD);
        }
    };

    if let Err(e) = run(cfg).await {
        error!("fatal error: {}", e);
        std::process::exit(EXIT_RUN);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let runtime = Arc::new(DockerCli::new());
    let containers = Arc::new(Mutex::new(HashMap::new()));
    let reconciler = Arc::new(HealthReconciler::new(
        Arc::clone(&containers),
        runtime.clone(),
    ));

    let deployer = Deployer::new(
        cfg.deployer.clone(),
        runtime,
        containers,
        Arc::clone(&reconciler),
    );

    let listener = HttpListener::bind(
        &format!("0.0.0.0:{}", cfg.deployer.port),
        deployer,
        cfg.deployer.read_header_timeout,
    )
    .await?;
    info!("deployer listening on {}", listener.local_addr());

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let mut server_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = listener.serve(shutdown_rx).await {
                error!("listener error: {}", e);
            }
        }
    });

    let mut reconciler_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    let mut server_finished = false;
    let mut reconciler_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut server_task => {
            server_finished = true;
            if let Err(e) = res {
                error!("server task join error: {}", e);
            }
        }
        res = &mut reconciler_task => {
            reconciler_finished = true;
            if let Err(e) = res {
                error!("reconciler task join error: {}", e);
            }
        }
    }

    let _ = shutdown_tx.send(());

    let drain = async {
        if !server_finished {
            if timeout(cfg.app.shutdown_timeout, &mut server_task).await.is_err() {
                warn!("server did not drain in time, aborting");
                server_task.abort();
            }
        }
        if !reconciler_finished {
            if timeout(cfg.app.shutdown_timeout, &mut reconciler_task).await.is_err() {
                reconciler_task.abort();
            }
        }
    };

    if timeout(cfg.app.terminate_timeout, drain).await.is_err() {
        warn!("teardown exceeded terminate timeout");
    }

    info!("shutdown complete");
    Ok(())
}
