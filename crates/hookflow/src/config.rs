use std::time::Duration;

// Config is the one place runtime settings are read from the environment.
// Everything downstream gets typed values instead of raw strings.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub poll_interval_ms: u64,
    pub claim_batch_size: i64,
    pub reap_interval_ms: u64,
    pub max_concurrent_deliveries: usize,
    pub publish_queue_capacity: usize,
    pub request_timeout_secs: u64,
    pub failure_threshold: i32,
    pub response_body_limit: usize,
    pub allow_insecure_urls: bool,
    pub stats_window_days: i64,
}

/// The subset of [`Config`] the delivery engine itself needs.
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    pub worker_id: String,
    pub request_timeout: Duration,
    pub failure_threshold: i32,
    pub response_body_limit: usize,
    pub allow_insecure_urls: bool,
    pub max_concurrent_deliveries: usize,
    pub claim_batch_size: i64,
    pub publish_queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            request_timeout: Duration::from_secs(30),
            failure_threshold: 10,
            response_body_limit: 2048,
            allow_insecure_urls: false,
            max_concurrent_deliveries: 16,
            claim_batch_size: 50,
            publish_queue_capacity: 1024,
        }
    }
}

impl DeliveryConfig {
    /// How long a pending attempt stays owned by the worker sending it.
    /// One full request timeout plus slack for the database round-trips.
    pub fn lease_seconds(&self) -> i64 {
        self.request_timeout.as_secs() as i64 + 30
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("HOOKFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let admin_addr = env_or_fallback("HOOKFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("HOOKFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let poll_interval_ms = env_parse("HOOKFLOW_POLL_INTERVAL_MS").unwrap_or(500);
        let claim_batch_size = env_parse::<i64>("HOOKFLOW_CLAIM_BATCH_SIZE")
            .unwrap_or(50)
            .clamp(1, 500);
        let reap_interval_ms = env_parse("HOOKFLOW_REAP_INTERVAL_MS").unwrap_or(5_000);
        let max_concurrent_deliveries = env_parse::<usize>("HOOKFLOW_MAX_CONCURRENT_DELIVERIES")
            .unwrap_or(16)
            .max(1);
        let publish_queue_capacity = env_parse::<usize>("HOOKFLOW_PUBLISH_QUEUE_CAPACITY")
            .unwrap_or(1024)
            .max(1);
        let request_timeout_secs = env_parse("HOOKFLOW_REQUEST_TIMEOUT_SECS").unwrap_or(30);
        let failure_threshold = env_parse::<i32>("HOOKFLOW_FAILURE_THRESHOLD")
            .unwrap_or(10)
            .max(1);
        let response_body_limit = env_parse("HOOKFLOW_RESPONSE_BODY_LIMIT").unwrap_or(2048);
        let allow_insecure_urls = env_bool("HOOKFLOW_ALLOW_INSECURE_URLS").unwrap_or(false);
        let stats_window_days = env_parse::<i64>("HOOKFLOW_STATS_WINDOW_DAYS")
            .unwrap_or(30)
            .max(1);

        Ok(Self {
            database_url,
            worker_id,
            admin_addr,
            migrate_on_startup,
            poll_interval_ms,
            claim_batch_size,
            reap_interval_ms,
            max_concurrent_deliveries,
            publish_queue_capacity,
            request_timeout_secs,
            failure_threshold,
            response_body_limit,
            allow_insecure_urls,
            stats_window_days,
        })
    }

    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_id: self.worker_id.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            failure_threshold: self.failure_threshold,
            response_body_limit: self.response_body_limit,
            allow_insecure_urls: self.allow_insecure_urls,
            max_concurrent_deliveries: self.max_concurrent_deliveries,
            claim_batch_size: self.claim_batch_size,
            publish_queue_capacity: self.publish_queue_capacity,
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
