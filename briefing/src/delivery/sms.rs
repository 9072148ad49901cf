use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

/// Twilio-compatible SMS sender used when the bridge cannot deliver text
pub struct SmsClient {
    api_base: String,
    account_sid: String,
    auth_token: String,
    from: String,
    to: String,
    client: Client,
}

impl SmsClient {
    /// None unless every credential env var named in the config is set and non-empty.
    pub fn from_env(cfg: &common::SmsConfig) -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Some(Self {
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            account_sid: var(&cfg.account_sid_env)?,
            auth_token: var(&cfg.auth_token_env)?,
            from: var(&cfg.from_env)?,
            to: var(&cfg.to_env)?,
            client: Client::new(),
        })
    }

    pub async fn send(&self, message: &str) -> Result<()> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", self.to.as_str()),
                ("From", self.from.as_str()),
                ("Body", message),
            ])
            .send()
            .await
            .context("SMS request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("SMS API error {}: {}", status, body);
        }
        Ok(())
    }
}
