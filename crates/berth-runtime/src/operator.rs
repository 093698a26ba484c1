use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Client for operator endpoints that answer readiness checks.
///
/// Returns the HTTP status of the call; only `200` counts as success.
pub trait OperatorClient: Send + Sync {
    fn call(
        &self,
        kind: &str,
        operator: &str,
        body: &BTreeMap<String, String>,
    ) -> Result<u16, RuntimeError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub host: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

impl OperatorConfig {
    pub fn new(host: &str, timeout: Duration) -> Self {
        Self {
            host: host.trim_end_matches('/').to_owned(),
            auth_token: None,
            timeout,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }
}

/// HTTP operator client.
///
/// Each call is `POST {host}/{kind}/{operator}` with the body serialized as a
/// JSON object.
pub struct HttpOperatorClient {
    config: OperatorConfig,
    agent: ureq::Agent,
}

impl HttpOperatorClient {
    pub fn new(config: OperatorConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout))
            .http_status_as_error(false)
            .build();
        let agent = ureq::Agent::new_with_config(agent_config);
        Self { config, agent }
    }

    pub fn url(&self, kind: &str, operator: &str) -> String {
        format!("{}/{kind}/{operator}", self.config.host)
    }
}

impl OperatorClient for HttpOperatorClient {
    fn call(
        &self,
        kind: &str,
        operator: &str,
        body: &BTreeMap<String, String>,
    ) -> Result<u16, RuntimeError> {
        let url = self.url(kind, operator);
        let payload =
            serde_json::to_vec(body).map_err(|e| RuntimeError::Serialization(e.to_string()))?;
        tracing::debug!("POST {url} ({} bytes)", payload.len());

        let mut req = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req
            .send(&payload[..])
            .map_err(|e| RuntimeError::Operator(format!("{url}: {e}")))?;
        Ok(resp.status().as_u16())
    }
}
