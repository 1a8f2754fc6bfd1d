use anyhow::bail;
use std::env;
use std::time::Duration;
use zeroize::Zeroizing;

/// Server configuration loaded via environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Webhook settings
    pub webhook_secret: Zeroizing<String>,

    // Remote API settings
    pub github_api_base: String,
    pub github_token: Zeroizing<String>,
    pub api_max_retries: u32,
    pub api_backoff_base: Duration,
    pub api_backoff_max: Duration,
    pub api_request_timeout: Duration,

    // Queue store settings
    pub redis_url: Option<String>,
    pub queue_namespace: String,

    // Scheduling settings
    pub worker_count: usize,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub max_retries: u32,
    pub starvation_window: Duration,
    pub idle_sleep: Duration,

    // Backpressure settings
    pub rate_limit_min_remaining: u64,
    pub rate_limit_cooldown: Duration,
    pub rate_limit_jitter: Duration,
    pub max_backoff: Duration,

    // Observability settings
    pub probe_interval: Duration,

    // Admin surface; DLQ endpoints are disabled when unset
    pub admin_token: Option<Zeroizing<String>>,

    // Development settings
    pub dev_mode: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let dev_mode = env_or("DEV_MODE", false);

        let webhook_secret = match env::var("WEBHOOK_SECRET") {
            Ok(secret) if !secret.is_empty() => Zeroizing::new(secret),
            _ if dev_mode => Zeroizing::new("dev-secret".to_string()),
            _ => bail!("WEBHOOK_SECRET must be set"),
        };
        let github_token = match env::var("GITHUB_TOKEN") {
            Ok(token) if !token.is_empty() => Zeroizing::new(token),
            _ if dev_mode => Zeroizing::new(String::new()),
            _ => bail!("GITHUB_TOKEN must be set"),
        };

        let config = Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env_or("SERVER_PORT", 3000),

            webhook_secret,

            github_api_base: env::var("GITHUB_API_BASE")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            github_token,
            api_max_retries: env_or("API_MAX_RETRIES", 3),
            api_backoff_base: Duration::from_millis(env_or("API_BACKOFF_BASE_MS", 500)),
            api_backoff_max: env_secs("API_BACKOFF_MAX_SECONDS", 30),
            api_request_timeout: env_secs("API_REQUEST_TIMEOUT_SECONDS", 30),

            redis_url: env::var("REDIS_URL").ok(),
            queue_namespace: env::var("QUEUE_NAMESPACE")
                .unwrap_or_else(|_| "mergex".to_string()),

            worker_count: env_or("WORKER_COUNT", 4),
            lease_ttl: env_secs("LEASE_TTL_SECONDS", 60),
            heartbeat_interval: env_secs("HEARTBEAT_SECONDS", 15),
            max_retries: env_or("MAX_RETRIES", 5),
            starvation_window: env_secs("STARVATION_WINDOW_SECONDS", 900),
            idle_sleep: Duration::from_millis(env_or("IDLE_SLEEP_MS", 500)),

            rate_limit_min_remaining: env_or("RATE_LIMIT_MIN_REMAINING", 50),
            rate_limit_cooldown: env_secs("RATE_LIMIT_COOLDOWN_SECONDS", 60),
            rate_limit_jitter: env_secs("RATE_LIMIT_JITTER_SECONDS", 30),
            max_backoff: env_secs("MAX_BACKOFF_SECONDS", 1800),

            probe_interval: env_secs("PROBE_INTERVAL_SECONDS", 30),

            admin_token: env::var("ADMIN_TOKEN")
                .ok()
                .filter(|t| !t.is_empty())
                .map(Zeroizing::new),

            dev_mode,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            bail!("WORKER_COUNT must be at least 1");
        }
        // Heartbeats must land well inside the lease window or a single
        // slow refresh loses the lease mid-pipeline.
        if self.heartbeat_interval * 2 >= self.lease_ttl {
            bail!(
                "HEARTBEAT_SECONDS ({}s) must be less than half of LEASE_TTL_SECONDS ({}s)",
                self.heartbeat_interval.as_secs(),
                self.lease_ttl.as_secs()
            );
        }
        if self.redis_url.is_none() && !self.dev_mode {
            bail!("REDIS_URL must be set (or run with DEV_MODE=true for the in-memory store)");
        }
        Ok(())
    }

    /// Startup log line with secrets elided.
    pub fn summary(&self) -> String {
        format!(
            "host={} port={} workers={} lease_ttl={}s heartbeat={}s max_retries={} store={} api={}",
            self.server_host,
            self.server_port,
            self.worker_count,
            self.lease_ttl.as_secs(),
            self.heartbeat_interval.as_secs(),
            self.max_retries,
            if self.redis_url.is_some() {
                "redis"
            } else {
                "memory"
            },
            self.github_api_base,
        )
    }
}
