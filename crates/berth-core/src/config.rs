use crate::CoreError;
use berth_runtime::OperatorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Agent settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Container engine driver name.
    pub engine: String,
    /// Base URL of the operator endpoints used by readiness checks.
    pub operator_host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_token: Option<String>,
    pub tick_interval_ms: u64,
    pub probe_retry_interval_ms: u64,
    pub default_probe_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub exit_wait_timeout_ms: u64,
    pub engine_call_timeout_ms: u64,
    /// Consecutive deaths tolerated before an entity is parked in backoff.
    pub backoff_limit: u32,
    pub operator_request_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            engine: "mock".to_owned(),
            operator_host: "http://127.0.0.1:8080".to_owned(),
            operator_token: None,
            tick_interval_ms: 5_000,
            probe_retry_interval_ms: 5_000,
            default_probe_timeout_ms: 30_000,
            stop_timeout_ms: 10_000,
            exit_wait_timeout_ms: 30_000,
            engine_call_timeout_ms: 60_000,
            backoff_limit: 5,
            operator_request_timeout_ms: 10_000,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.engine.is_empty() {
            return Err(CoreError::Config("engine must not be empty".to_owned()));
        }
        let intervals = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("probe_retry_interval_ms", self.probe_retry_interval_ms),
            ("engine_call_timeout_ms", self.engine_call_timeout_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(CoreError::Config(format!("{field} must be positive")));
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn probe_retry_interval(&self) -> Duration {
        Duration::from_millis(self.probe_retry_interval_ms)
    }

    pub fn default_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.default_probe_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn exit_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_wait_timeout_ms)
    }

    pub fn engine_call_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_call_timeout_ms)
    }

    pub fn operator_request_timeout(&self) -> Duration {
        Duration::from_millis(self.operator_request_timeout_ms)
    }

    /// Settings for the HTTP operator client.
    pub fn operator_config(&self) -> OperatorConfig {
        let config = OperatorConfig::new(&self.operator_host, self.operator_request_timeout());
        match &self.operator_token {
            Some(token) => config.with_token(token),
            None => config,
        }
    }

    #[must_use]
    pub fn with_engine(mut self, engine: &str) -> Self {
        engine.clone_into(&mut self.engine);
        self
    }

    #[must_use]
    pub fn with_operator_host(mut self, host: &str) -> Self {
        host.clone_into(&mut self.operator_host);
        self
    }

    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_probe_retry_interval(mut self, interval: Duration) -> Self {
        self.probe_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_exit_wait_timeout(mut self, timeout: Duration) -> Self {
        self.exit_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_backoff_limit(mut self, limit: u32) -> Self {
        self.backoff_limit = limit;
        self
    }

    /// Millisecond-scale intervals for tests and simulations.
    #[must_use]
    pub fn fast() -> Self {
        Self::default()
            .with_tick_interval(Duration::from_millis(50))
            .with_probe_retry_interval(Duration::from_millis(10))
            .with_stop_timeout(Duration::from_millis(100))
            .with_exit_wait_timeout(Duration::from_millis(500))
    }
}
