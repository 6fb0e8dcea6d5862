use std::env;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Per-request ceiling on top of the engine's own attempt deadline.
    pub timeout_ms: u64,
    pub max_msg_bytes: usize,
    pub max_in_flight: usize,
    pub report_cache_entries: u64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_msg_bytes: 1_000_000,
            max_in_flight: 64,
            report_cache_entries: 256,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env(|k| env::var(k).ok());
        cfg
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = lookup("SQLGRADE_SERVER_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.timeout_ms = n;
        }
        if let Some(n) = lookup("SQLGRADE_SERVER_MAX_BYTES").and_then(|v| v.parse().ok()) {
            self.max_msg_bytes = n;
        }
        if let Some(n) = lookup("SQLGRADE_SERVER_MAX_IN_FLIGHT").and_then(|v| v.parse::<usize>().ok()) {
            self.max_in_flight = n.max(1);
        }
        if let Some(n) = lookup("SQLGRADE_SERVER_REPORT_CACHE_ENTRIES").and_then(|v| v.parse().ok()) {
            self.report_cache_entries = n;
        }
        if let Some(v) = lookup("SQLGRADE_LOG") {
            self.log_level = v;
        }
    }
}
