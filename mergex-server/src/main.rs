use anyhow::Context;
use clap::Parser;
use mergex_core::github::{GithubApi, GithubClient, GithubClientConfig};
use mergex_core::ingress::Ingress;
use mergex_core::pipeline::{Pipeline, PipelineConfig};
use mergex_core::queue::{MemoryQueueStore, QueueStore, RedisQueueStore};
use mergex_core::scheduler::{Scheduler, SchedulerConfig};
use mergex_core::Metrics;
use mergex_server::config::Config;
use mergex_server::http::{self, AppState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments for the Mergex server
#[derive(Parser, Debug)]
#[command(name = "mergex-server")]
#[command(about = "Webhook-driven auto-merge service")]
struct Args {
    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Worker count (overrides config)
    #[arg(long, env = "WORKER_COUNT")]
    workers: Option<usize>,

    /// Run against the in-memory queue store (no Redis required)
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    if args.dev {
        // Config validation relaxes required secrets in dev mode.
        unsafe { std::env::set_var("DEV_MODE", "true") };
    }

    // Load configuration from environment
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mergex_server=debug,mergex_core=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("configuration loaded: {}", config.summary());

    let metrics = Arc::new(Metrics::new().context("metric registration failed")?);

    let store: Arc<dyn QueueStore> = match &config.redis_url {
        Some(redis_url) => Arc::new(
            RedisQueueStore::connect(redis_url, config.queue_namespace.clone(), metrics.clone())
                .await
                .context("queue store connection failed")?,
        ),
        None => {
            warn!("DEV MODE: using the in-memory queue store; work is lost on restart");
            Arc::new(MemoryQueueStore::new(metrics.clone()))
        }
    };

    let api: Arc<dyn GithubApi> = Arc::new(
        GithubClient::new(
            GithubClientConfig {
                base_url: config.github_api_base.clone(),
                token: config.github_token.to_string(),
                max_retries: config.api_max_retries,
                backoff_base: config.api_backoff_base,
                backoff_max: config.api_backoff_max,
                request_timeout: config.api_request_timeout,
            },
            metrics.clone(),
        )
        .context("API client construction failed")?,
    );

    let ingress = Arc::new(Ingress::new(store.clone(), metrics.clone()));
    let pipeline = Arc::new(Pipeline::new(
        api.clone(),
        store.clone(),
        metrics.clone(),
        PipelineConfig {
            starvation_window: config.starvation_window,
            rate_limit_min_remaining: config.rate_limit_min_remaining,
            rate_limit_cooldown: config.rate_limit_cooldown,
            rate_limit_jitter: config.rate_limit_jitter,
            max_backoff: config.max_backoff,
        },
    ));
    let scheduler = Scheduler::start(
        SchedulerConfig {
            worker_count: config.worker_count,
            lease_ttl: config.lease_ttl,
            heartbeat_interval: config.heartbeat_interval,
            max_retries: config.max_retries,
            idle_sleep: config.idle_sleep,
            idle_jitter: config.idle_sleep / 2,
        },
        store.clone(),
        pipeline,
        metrics.clone(),
    );

    let ready = Arc::new(AtomicBool::new(false));
    let prober = spawn_prober(
        store.clone(),
        api.clone(),
        ready.clone(),
        config.probe_interval,
        config.dev_mode,
    );

    let state = AppState {
        ingress,
        store,
        metrics,
        webhook_secret: config.webhook_secret.clone(),
        admin_token: config.admin_token.clone(),
        ready,
    };
    let app = http::router(state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop accepting work, then stop the workers. Any pipeline cancelled
    // mid-run leaves its item in flight; lease expiry hands it to the next
    // process.
    info!("shutting down");
    prober.abort();
    scheduler.shutdown().await;
    Ok(())
}

/// Periodically probe the queue store and the API facade; `/readyz` serves
/// 200 only while the latest probe of both succeeded.
fn spawn_prober(
    store: Arc<dyn QueueStore>,
    api: Arc<dyn GithubApi>,
    ready: Arc<AtomicBool>,
    interval: Duration,
    dev_mode: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let store_ok = match store.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("queue store probe failed: {e}");
                    false
                }
            };
            // Dev runs usually have no usable API token; don't hold
            // readiness hostage to it.
            let api_ok = dev_mode
                || match api.ping().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("API facade probe failed: {e}");
                        false
                    }
                };
            ready.store(store_ok && api_ok, Ordering::Relaxed);
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
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
}
