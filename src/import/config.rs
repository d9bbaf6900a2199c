use std::env;
use std::time::Duration;

pub const DEFAULT_PAUSE_MINUTES: i32 = 5;
pub const DEFAULT_THROTTLE_INCREMENT_MINUTES: i32 = 3;
pub const DEFAULT_BURST_EVERY: i32 = 10;
pub const DEFAULT_ATTACHMENT_ORIGIN: &str = r"avito\.st/image/";

fn env_i32(key: &str, default: i32) -> i32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Pause and delay policy for the rate-limit governor.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Base pause a fresh or restarted run starts with.
    pub pause_minutes: i32,
    /// Added to both `pause_minutes` and `extra_delay_minutes` on every throttle.
    pub throttle_increment_minutes: i32,
    /// Force a cooperative pause after this many attachment fetches.
    pub burst_every: i32,
    pub delay_min: Duration,
    pub delay_max: Duration,
}

impl GovernorConfig {
    pub fn from_env() -> Self {
        let delay_min = env_duration_secs("IMPORT_DELAY_MIN_SECS", 3);
        let delay_max = env_duration_secs("IMPORT_DELAY_MAX_SECS", 7).max(delay_min);

        Self {
            pause_minutes: env_i32("IMPORT_PAUSE_MINUTES", DEFAULT_PAUSE_MINUTES),
            throttle_increment_minutes: env_i32(
                "IMPORT_THROTTLE_INCREMENT_MINUTES",
                DEFAULT_THROTTLE_INCREMENT_MINUTES,
            ),
            burst_every: env_i32("IMPORT_BURST_EVERY", DEFAULT_BURST_EVERY),
            delay_min,
            delay_max,
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// HTTP settings for the attachment origin.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub request_timeout: Duration,
    pub max_redirects: usize,
    pub user_agent: String,
    pub referer: Option<String>,
    /// Regular expression the final, post-redirect URL must match.
    pub origin_pattern: String,
}

impl FetchConfig {
    pub fn from_env() -> Self {
        Self {
            request_timeout: env_duration_millis("IMPORT_FETCH_TIMEOUT_MS", 10_000),
            max_redirects: env_usize("IMPORT_MAX_REDIRECTS", 10),
            user_agent: env_string("IMPORT_FETCH_USER_AGENT", "catalog-importer/0.1"),
            referer: env::var("IMPORT_FETCH_REFERER").ok().filter(|v| !v.is_empty()),
            origin_pattern: env_string("IMPORT_ATTACHMENT_ORIGIN", DEFAULT_ATTACHMENT_ORIGIN),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Background dispatcher polling, parallelism and job liveness.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub heartbeat_interval: Duration,
    /// A running job without a heartbeat for this long is requeued.
    pub stale_after: Duration,
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        let heartbeat_interval =
            env_duration_secs("IMPORT_JOB_HEARTBEAT_SECS", 30).max(Duration::from_secs(1));
        let stale_after = env_duration_secs("IMPORT_JOB_STALE_SECS", 120)
            .max(heartbeat_interval * 2);

        Self {
            poll_interval: env_duration_millis("IMPORT_DISPATCHER_POLL_MS", 5_000),
            concurrency: env_usize("IMPORT_DISPATCHER_CONCURRENCY", 4).max(1),
            heartbeat_interval,
            stale_after,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
