use meshkit::config::{AppConfig, PlaneConfig};
use meshkit::error::Result;
use meshkit::listener::HttpListener;
use meshkit::registry::ControlPlane;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{error, info, warn};

const EXIT_CONFIG_LOAD: i32 = 2;
const EXIT_RUN: i32 = 4;

struct Config {
    app: AppConfig,
    plane: PlaneConfig,
}

fn load_config() -> Result<Config> {
    Ok(Config {
        app: AppConfig::from_env()?,
        plane: PlaneConfig::from_env()?,
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

    info!("starting control plane");

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
    let plane = ControlPlane::new();

    let listener = HttpListener::bind(
        &format!("0.0.0.0:{}", cfg.plane.port),
        plane,
        cfg.plane.read_header_timeout,
    )
    .await?;
    info!("control plane listening on {}", listener.local_addr());

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let mut server_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = listener.serve(shutdown_rx).await {
                error!("listener error: {}", e);
            }
        }
    });

    let mut server_finished = false;

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
    }

    let _ = shutdown_tx.send(());

    let drain = async {
        if !server_finished {
            if timeout(cfg.app.shutdown_timeout, &mut server_task).await.is_err() {
                warn!("server did not drain in time, aborting");
                server_task.abort();
            }
        }
    };

    if timeout(cfg.app.terminate_timeout, drain).await.is_err() {
        warn!("teardown exceeded terminate timeout");
    }

    info!("shutdown complete");
    Ok(())
}
