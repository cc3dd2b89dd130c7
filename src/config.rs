//! Environment-variable-driven configuration, assembled once at startup.
//! Matches the env-var-first style of `agentkern-arbiter`/`agentkern-gate`'s
//! binaries (no config file format).

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub evaluation_window_minutes: i64,
    pub min_sample_size: u64,
    pub success_rate_threshold: f64,
    pub efficiency_threshold: f64,
    pub baseline_window_minutes: i64,
    pub webhook_url: Option<String>,
    pub notification_enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let webhook_url = env::var("NOTIFICATION_WEBHOOK_URL").ok();
        let notification_enabled = env::var("NOTIFICATION_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or_else(|_| webhook_url.is_some());

        Ok(Self {
            database_url,
            port: env_parse("PORT", 3002),
            evaluation_window_minutes: env_parse("EVALUATION_WINDOW_MINUTES", 30),
            min_sample_size: env_parse("MIN_SAMPLE_SIZE", 50),
            success_rate_threshold: env_parse("SUCCESS_RATE_THRESHOLD", 0.05),
            efficiency_threshold: env_parse("EFFICIENCY_THRESHOLD", 0.10),
            baseline_window_minutes: env_parse("BASELINE_WINDOW_MINUTES", 60),
            webhook_url,
            notification_enabled,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_on_missing_or_bad_value() {
        assert_eq!(env_parse::<u16>("PROMPTOPS_TEST_UNSET_VAR", 3002), 3002);
    }
}
