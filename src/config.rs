//! Daemon configuration loaded from environment variables, split into
//! `from_env`/`from_raw_values` so tests can exercise parsing without
//! touching the process environment.

use std::path::PathBuf;

/// Server configuration loaded from environment variables.
pub struct Config {
    pub port: u16,
    pub environment: String,
    /// Defaults to a hidden subdirectory of the user's home.
    pub data_dir: PathBuf,
    /// Seconds an idle runtime (no subscribers, no pending work) is kept
    /// alive before being suspended.
    pub idle_timeout_secs: u64,
    /// Seconds granted to a child for graceful SIGTERM shutdown before
    /// SIGKILL.
    pub shutdown_grace_secs: u64,
    /// Per-subscriber bounded buffer capacity.
    pub subscriber_buffer_capacity: usize,
    /// How often the idle reaper sweeps live sessions. Independent of
    /// `idle_timeout_secs`: this is the polling cadence, not the
    /// threshold.
    pub idle_reap_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("PORT").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("CTHULU_DATA_DIR").ok().as_deref(),
            std::env::var("CTHULU_IDLE_TIMEOUT_SECS").ok().as_deref(),
            std::env::var("CTHULU_SHUTDOWN_GRACE_SECS").ok().as_deref(),
            std::env::var("CTHULU_SUBSCRIBER_BUFFER").ok().as_deref(),
            std::env::var("CTHULU_IDLE_REAP_INTERVAL_SECS").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env
    /// vars). Used directly in tests to avoid mutating process-global
    /// environment.
    pub fn from_raw_values(
        port: Option<&str>,
        environment: Option<&str>,
        data_dir: Option<&str>,
        idle_timeout_secs: Option<&str>,
        shutdown_grace_secs: Option<&str>,
        subscriber_buffer_capacity: Option<&str>,
        idle_reap_interval_secs: Option<&str>,
    ) -> Self {
        let port = port.and_then(|v| v.parse().ok()).unwrap_or(8081);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        let data_dir = data_dir
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let idle_timeout_secs = idle_timeout_secs.and_then(|v| v.parse().ok()).unwrap_or(1800);
        let shutdown_grace_secs = shutdown_grace_secs.and_then(|v| v.parse().ok()).unwrap_or(5);
        let subscriber_buffer_capacity = subscriber_buffer_capacity.and_then(|v| v.parse().ok()).unwrap_or(256);
        let idle_reap_interval_secs = idle_reap_interval_secs.and_then(|v| v.parse().ok()).unwrap_or(60);

        Config {
            port,
            environment,
            data_dir,
            idle_timeout_secs,
            shutdown_grace_secs,
            subscriber_buffer_capacity,
            idle_reap_interval_secs,
        }
    }

    /// Full path to the database file: `<data-root>/chat-persistence.db`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chat-persistence.db")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".cthulu")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_port_uses_default() {
        let config = Config::from_raw_values(Some("not-a-number"), None, None, None, None, None, None);
        assert_eq!(config.port, 8081);
    }

    #[test]
    fn valid_port_is_parsed() {
        let config = Config::from_raw_values(Some("3000"), None, None, None, None, None, None);
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn default_environment_is_local() {
        let config = Config::from_raw_values(None, None, None, None, None, None, None);
        assert_eq!(config.environment, "local");
    }

    #[test]
    fn custom_environment_is_kept() {
        let config = Config::from_raw_values(None, Some("production"), None, None, None, None, None);
        assert_eq!(config.environment, "production");
    }

    #[test]
    fn explicit_data_dir_overrides_default() {
        let config = Config::from_raw_values(None, None, Some("/tmp/my-data"), None, None, None, None);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/my-data"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/my-data/chat-persistence.db"));
    }

    #[test]
    fn default_data_dir_falls_back_to_home() {
        let config = Config::from_raw_values(None, None, None, None, None, None, None);
        assert!(config.data_dir.ends_with(".cthulu"));
    }

    #[test]
    fn idle_and_grace_timeouts_have_sane_defaults() {
        let config = Config::from_raw_values(None, None, None, None, None, None, None);
        assert_eq!(config.idle_timeout_secs, 1800);
        assert_eq!(config.shutdown_grace_secs, 5);
        assert_eq!(config.subscriber_buffer_capacity, 256);
        assert_eq!(config.idle_reap_interval_secs, 60);
    }

    #[test]
    fn custom_idle_reap_interval_is_parsed() {
        let config = Config::from_raw_values(None, None, None, None, None, None, Some("15"));
        assert_eq!(config.idle_reap_interval_secs, 15);
    }
}
