use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// Client for the local Shortcuts bridge (`POST /run`, `GET /health`)
#[derive(Clone)]
pub struct BridgeClient {
    base_url: String,
    token: Option<String>,
    client: Client,
    timeout: Duration,
}

#[derive(Serialize)]
struct RunShortcut<'a> {
    shortcut: &'a str,
    input: &'a str,
}

impl BridgeClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            client: Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn from_config(cfg: &common::BridgeConfig) -> Self {
        Self::new(cfg.url.clone(), std::env::var(&cfg.token_env).ok()).with_timeout(cfg.timeout_seconds)
    }

    pub async fn health(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(error = %e, "bridge health probe failed");
                false
            }
        }
    }

    /// Run a named shortcut. Succeeds only on HTTP 200 with `"success": true`.
    pub async fn run_shortcut(&self, shortcut: &str, input: &str) -> Result<Value> {
        let mut req = self
            .client
            .post(format!("{}/run", self.base_url))
            .timeout(self.timeout)
            .json(&RunShortcut { shortcut, input });
        if let Some(token) = &self.token {
            req = req.header("X-Bridge-Token", token);
        }

        let resp = req.send().await.context("bridge request failed")?;
        let status = resp.status();
        let data: Value = resp.json().await.context("bridge returned non-JSON body")?;

        let success = data.get("success").and_then(Value::as_bool).unwrap_or(false);
        if !status.is_success() || !success {
            let reason = data
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            anyhow::bail!("shortcut '{}' failed ({}): {}", shortcut, status, reason);
        }

        info!(shortcut, "shortcut executed");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn runs_shortcut_with_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/run")
            .match_header("X-Bridge-Token", "tok")
            .match_body(Matcher::Json(serde_json::json!({
                "shortcut": "SendText",
                "input": "hi"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success": true, "output": ""}"#)
            .create_async()
            .await;

        let client = BridgeClient::new(server.url(), Some("tok".into()));
        assert!(client.run_shortcut("SendText", "hi").await.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn reports_shortcut_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/run")
            .with_status(200)
            .with_body(r#"{"success": false, "error": "no such shortcut"}"#)
            .create_async()
            .await;

        let client = BridgeClient::new(server.url(), None);
        let err = client.run_shortcut("Nope", "").await.unwrap_err();
        assert!(err.to_string().contains("no such shortcut"));
    }

    #[tokio::test]
    async fn health_reflects_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/health").with_status(200).create_async().await;
        assert!(BridgeClient::new(server.url(), None).health().await);

        // Nothing listening
        assert!(!BridgeClient::new("http://127.0.0.1:9", None).health().await);
    }
}
