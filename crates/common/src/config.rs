use std::str::FromStr;

use serde::Deserialize;

/// Global worker configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string
    pub redis_url: String,

    /// Name of the push queue (used for the processing set)
    pub queue_name: String,

    /// Exchange the push and dead-letter queues are bound to
    pub exchange_name: String,

    /// Routing key of the push queue
    pub routing_key: String,

    /// Routing key of the dead-letter queue
    pub dead_letter_routing_key: String,

    /// Highest message priority honoured by the queue (default: 10)
    pub queue_max_priority: u8,

    /// Idle poll interval in milliseconds when the queue is empty
    pub queue_poll_interval_ms: u64,

    /// Maximum number of concurrent deliveries
    pub worker_pool_size: usize,

    /// Seconds to wait for in-flight deliveries on shutdown
    pub shutdown_timeout_secs: u64,

    /// Consecutive transient failures that open the breaker (default: 3)
    pub breaker_failure_threshold: u32,

    /// Failure ratio (0.0-1.0) that opens the breaker; switches the breaker
    /// to rate-based tripping when set
    pub breaker_failure_rate: Option<f64>,

    /// Minimum calls in the window before the failure rate is evaluated
    pub breaker_min_calls: u32,

    /// Sliding window length in seconds
    pub breaker_window_secs: u64,

    /// Open-state cooldown in milliseconds (default: 10000)
    pub breaker_cooldown_ms: u64,

    /// Cooldown growth factor applied each time a probe fails
    pub breaker_cooldown_multiplier: f64,

    /// Upper bound for the grown cooldown
    pub breaker_max_cooldown_ms: u64,

    /// Maximum gateway calls per request (default: 5)
    pub retry_max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    pub retry_base_delay_ms: u64,

    /// Exponential backoff multiplier (default: 3.0)
    pub retry_multiplier: f64,

    /// Optional cap on a single retry delay
    pub retry_max_delay_ms: Option<u64>,

    /// Jitter factor (0.0-1.0), randomizes each delay by +/- this fraction
    pub retry_jitter: f64,

    /// Base64-encoded Firebase service-account JSON
    pub firebase_config: Option<String>,

    /// Path to a Firebase service-account JSON file
    pub firebase_config_path: Option<String>,

    /// Deadline for a single FCM call in milliseconds
    pub fcm_timeout_ms: u64,

    /// Base URL of the owning service (status + user endpoints)
    pub owner_service_url: String,

    /// Capacity of the outbound status report channel
    pub reporter_queue_capacity: usize,

    /// Port of the health endpoint
    pub health_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            queue_name: std::env::var("QUEUE_NAME").unwrap_or_else(|_| "push.queue".to_string()),
            exchange_name: std::env::var("EXCHANGE_NAME")
                .unwrap_or_else(|_| "notifications.direct".to_string()),
            routing_key: std::env::var("ROUTING_KEY").unwrap_or_else(|_| "push".to_string()),
            dead_letter_routing_key: std::env::var("DEAD_LETTER_ROUTING_KEY")
                .unwrap_or_else(|_| "failed".to_string()),
            queue_max_priority: parse_var("QUEUE_MAX_PRIORITY", 10)?,
            queue_poll_interval_ms: parse_var("QUEUE_POLL_INTERVAL_MS", 500)?,
            worker_pool_size: parse_var("WORKER_POOL_SIZE", 8)?,
            shutdown_timeout_secs: parse_var("SHUTDOWN_TIMEOUT_SECS", 30)?,
            breaker_failure_threshold: parse_var("BREAKER_FAILURE_THRESHOLD", 3)?,
            breaker_failure_rate: parse_optional_var("BREAKER_FAILURE_RATE")?,
            breaker_min_calls: parse_var("BREAKER_MIN_CALLS", 10)?,
            breaker_window_secs: parse_var("BREAKER_WINDOW_SECS", 60)?,
            breaker_cooldown_ms: parse_var("BREAKER_COOLDOWN_MS", 10_000)?,
            breaker_cooldown_multiplier: parse_var("BREAKER_COOLDOWN_MULTIPLIER", 1.0)?,
            breaker_max_cooldown_ms: parse_var("BREAKER_MAX_COOLDOWN_MS", 300_000)?,
            retry_max_attempts: parse_var("RETRY_MAX_ATTEMPTS", 5)?,
            retry_base_delay_ms: parse_var("RETRY_BASE_DELAY_MS", 1000)?,
            retry_multiplier: parse_var("RETRY_MULTIPLIER", 3.0)?,
            retry_max_delay_ms: parse_optional_var("RETRY_MAX_DELAY_MS")?,
            retry_jitter: parse_var("RETRY_JITTER", 0.0)?,
            firebase_config: std::env::var("FIREBASE_CONFIG").ok(),
            firebase_config_path: std::env::var("FIREBASE_CONFIG_PATH").ok(),
            fcm_timeout_ms: parse_var("FCM_TIMEOUT_MS", 10_000)?,
            owner_service_url: std::env::var("OWNER_SERVICE_URL").map_err(|_| {
                anyhow::anyhow!("OWNER_SERVICE_URL environment variable is required")
            })?,
            reporter_queue_capacity: parse_var("REPORTER_QUEUE_CAPACITY", 1024)?,
            health_port: parse_var("HEALTH_PORT", 8080)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the worker cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.firebase_config.is_none() && self.firebase_config_path.is_none() {
            anyhow::bail!("one of FIREBASE_CONFIG or FIREBASE_CONFIG_PATH is required");
        }
        if self.retry_max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            anyhow::bail!("RETRY_MULTIPLIER must be a finite number >= 1.0");
        }
        if !self.breaker_cooldown_multiplier.is_finite() || self.breaker_cooldown_multiplier < 1.0 {
            anyhow::bail!("BREAKER_COOLDOWN_MULTIPLIER must be a finite number >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            anyhow::bail!("RETRY_JITTER must be within 0.0..=1.0");
        }
        if let Some(rate) = self.breaker_failure_rate
            && !(rate > 0.0 && rate <= 1.0)
        {
            anyhow::bail!("BREAKER_FAILURE_RATE must be within (0.0, 1.0]");
        }
        if self.breaker_failure_threshold == 0 {
            anyhow::bail!("BREAKER_FAILURE_THRESHOLD must be at least 1");
        }
        if self.worker_pool_size == 0 {
            anyhow::bail!("WORKER_POOL_SIZE must be at least 1");
        }
        if self.reporter_queue_capacity == 0 {
            anyhow::bail!("REPORTER_QUEUE_CAPACITY must be at least 1");
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn parse_optional_var<T: FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", name, raw)),
        _ => Ok(None),
    }
}
