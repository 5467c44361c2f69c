use meshkit::client::ResilientClient;
use meshkit::config::{
    AppConfig, ClientConfig, ProbesConfig, RateLimiterConfig, RateStoreBackend, SidecarConfig,
};
use meshkit::error::Result;
use meshkit::listener::HttpListener;
use meshkit::metrics::Metrics;
use meshkit::prober::Prober;
use meshkit::ratelimit::redis::RedisStore;
use meshkit::ratelimit::store::{InMemoryStore, RateStore};
use meshkit::ratelimit::RateLimit;
use meshkit::sidecar::Sidecar;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{error, info, warn};

const EXIT_CONFIG_LOAD: i32 = 2;
const EXIT_RUN: i32 = 4;

struct Config {
    app: AppConfig,
    sidecar: SidecarConfig,
    client: ClientConfig,
    ratelimiter: RateLimiterConfig,
    probes: ProbesConfig,
}

fn load_config() -> Result<Config> {
    Ok(Config {
        app: AppConfig::from_env()?,
        sidecar: SidecarConfig::from_env()?,
        client: ClientConfig::from_env()?,
        ratelimiter: RateLimiterConfig::from_env()?,
        probes: ProbesConfig::from_env()?,
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

    info!("starting sidecar");

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
    info!(
        service = %cfg.sidecar.service_name,
        target = %cfg.sidecar.target,
        port = cfg.sidecar.port,
        "config loaded"
    );

    let metrics = Arc::new(Metrics::new(&cfg.sidecar.service_name));

    let store: Arc<dyn RateStore> = match cfg.ratelimiter.backend {
        RateStoreBackend::Memory => Arc::new(InMemoryStore::new()),
        RateStoreBackend::Redis => Arc::new(RedisStore::new(&cfg.ratelimiter.redis_url)?),
    };

    let client = ResilientClient::new(&cfg.client);
    let proxy = Sidecar::new(cfg.sidecar.clone(), client, Arc::clone(&metrics));
    let handler = RateLimit::new(proxy, store, &cfg.ratelimiter, metrics);

    let listener = HttpListener::bind(
        &format!("0.0.0.0:{}", cfg.sidecar.port),
        handler,
        cfg.sidecar.read_header_timeout,
    )
    .await?;
    info!("sidecar listening on {}", listener.local_addr());

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let mut server_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = listener.serve(shutdown_rx).await {
                error!("listener error: {}", e);
            }
        }
    });

    let mut prober_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        let prober = Prober::new(cfg.probes);
        async move {
            prober.run(shutdown_rx).await;
        }
    });

    let mut server_finished = false;
    let mut prober_finished = false;

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
        res = &mut prober_task => {
            prober_finished = true;
            if let Err(e) = res {
                error!("prober task join error: {}", e);
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
        if !prober_finished {
            if timeout(cfg.app.shutdown_timeout, &mut prober_task).await.is_err() {
                prober_task.abort();
            }
        }
    };

    if timeout(cfg.app.terminate_timeout, drain).await.is_err() {
        warn!("teardown exceeded terminate timeout");
    }

    info!("shutdown complete");
    Ok(())
}
