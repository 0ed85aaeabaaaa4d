use std::time::Duration;

pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(300);
pub const DEFAULT_BACKEND_MODE: &str = "apisix";
pub const DEFAULT_CONTROLLER_NAME: &str = "keel.dev/gateway-controller";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Process knobs. [`Settings::from_env`] reads `KEEL_SYNC_PERIOD_SECS`,
/// `KEEL_BACKEND_MODE`, `KEEL_CONTROLLER_NAME`, `KEEL_LOG` and
/// `KEEL_METRICS_ADDR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Interval between full sync cycles; the first one runs after one period.
    pub sync_period: Duration,
    /// Backend flavour handed to the executor.
    pub backend_mode: String,
    /// Controller name matched against `status.parents[].controllerName`.
    pub controller_name: String,
    /// `EnvFilter` directives for the log subscriber.
    pub log_filter: String,
    /// Prometheus listener, `host:port`; no exporter when unset.
    pub metrics_addr: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync_period: DEFAULT_SYNC_PERIOD,
            backend_mode: DEFAULT_BACKEND_MODE.to_string(),
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            metrics_addr: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let secs: u64 = std::env::var("KEEL_SYNC_PERIOD_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_SYNC_PERIOD.as_secs());
        Self {
            sync_period: Duration::from_secs(secs),
            backend_mode: std::env::var("KEEL_BACKEND_MODE").unwrap_or_else(|_| DEFAULT_BACKEND_MODE.to_string()),
            controller_name: std::env::var("KEEL_CONTROLLER_NAME").unwrap_or_else(|_| DEFAULT_CONTROLLER_NAME.to_string()),
            log_filter: std::env::var("KEEL_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
            metrics_addr: std::env::var("KEEL_METRICS_ADDR").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn with_sync_period(mut self, period: Duration) -> Self {
        self.sync_period = period;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_period_falls_back_to_default() {
        std::env::set_var("KEEL_SYNC_PERIOD_SECS", "0");
        assert_eq!(Settings::from_env().sync_period, DEFAULT_SYNC_PERIOD);
        std::env::set_var("KEEL_SYNC_PERIOD_SECS", "7");
        assert_eq!(Settings::from_env().sync_period, Duration::from_secs(7));
        std::env::remove_var("KEEL_SYNC_PERIOD_SECS");
    }

    #[test]
    fn observability_knobs_from_env() {
        std::env::set_var("KEEL_LOG", "keel_provider=debug");
        std::env::set_var("KEEL_METRICS_ADDR", "");
        let s = Settings::from_env();
        assert_eq!(s.log_filter, "keel_provider=debug");
        assert_eq!(s.metrics_addr, None);
        std::env::set_var("KEEL_METRICS_ADDR", "127.0.0.1:9464");
        assert_eq!(Settings::from_env().metrics_addr.as_deref(), Some("127.0.0.1:9464"));
        std::env::remove_var("KEEL_LOG");
        std::env::remove_var("KEEL_METRICS_ADDR");
        assert_eq!(Settings::from_env().log_filter, DEFAULT_LOG_FILTER);
    }
}
