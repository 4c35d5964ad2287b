//! Configuration types.

use std::time::Duration;

/// Engine configuration.
///
/// Timeout thresholds and the drain-guard yield are operationally tuned
/// values, not structural invariants — override them per deployment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the local database file.
    pub db_path: String,
    /// Yield between a worker's two consecutive empty-queue reads.
    pub drain_guard_yield: Duration,
    /// Health monitor sweep interval.
    pub monitor_interval: Duration,
    /// Timeout floor for standard-category running jobs.
    pub timeout_standard: Duration,
    /// Timeout floor for explicitly long-running-category jobs.
    pub timeout_long_running: Duration,
    /// Steering messages expire if not consumed within this bound.
    pub steering_ttl: Duration,
    /// Hard cap on consecutive silent auto-continuations per session.
    pub auto_continue_cap: u32,
    /// Classifier verdicts below this confidence are treated as Question.
    pub confidence_floor: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/steerqueue.db".to_string(),
            drain_guard_yield: Duration::from_millis(100),
            monitor_interval: Duration::from_secs(300), // 5 minutes
            timeout_standard: Duration::from_secs(45 * 60),
            timeout_long_running: Duration::from_secs(6 * 3600),
            steering_ttl: Duration::from_secs(3600), // 1 hour
            auto_continue_cap: 3,
            confidence_floor: 0.6,
        }
    }
}

impl EngineConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("STEERQUEUE_DB_PATH") {
            config.db_path = path;
        }
        if let Some(millis) = env_parse::<u64>("STEERQUEUE_DRAIN_GUARD_YIELD_MS") {
            config.drain_guard_yield = Duration::from_millis(millis);
        }
        if let Some(secs) = env_parse::<u64>("STEERQUEUE_MONITOR_INTERVAL_SECS") {
            config.monitor_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("STEERQUEUE_TIMEOUT_STANDARD_SECS") {
            config.timeout_standard = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("STEERQUEUE_TIMEOUT_LONG_RUNNING_SECS") {
            config.timeout_long_running = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("STEERQUEUE_STEERING_TTL_SECS") {
            config.steering_ttl = Duration::from_secs(secs);
        }
        if let Some(cap) = env_parse::<u32>("STEERQUEUE_AUTO_CONTINUE_CAP") {
            config.auto_continue_cap = cap;
        }
        if let Some(floor) = env_parse::<f32>("STEERQUEUE_CONFIDENCE_FLOOR") {
            config.confidence_floor = floor;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
