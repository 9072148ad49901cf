//! Delivery sinks: text, email, file drafts, notifications, reminders.
//!
//! Every channel reports success as a `bool` and logs its own failures; the
//! pipeline never retries or rolls back on a failed delivery.

use common::{DeliveryConfig, DeliveryMethod};
use std::path::PathBuf;
use tracing::{error, info, warn};

pub mod bridge;
pub mod drafts;
pub mod email;
pub mod sms;

use bridge::BridgeClient;
use email::EmailSender;
use sms::SmsClient;

#[async_trait::async_trait]
pub trait Channels: Send + Sync {
    async fn send_text(&self, message: &str) -> bool;
    async fn send_email(&self, subject: &str, html_body: &str) -> bool;
    async fn save_draft(&self, filename: &str, content: &str) -> bool;
    async fn send_notification(&self, title: &str, body: &str) -> bool;
    async fn create_reminder(&self, title: &str) -> bool;
}

/// What an agent's delivery fan-out attempted and how it went
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    attempts: Vec<(DeliveryMethod, bool)>,
}

impl DeliveryReport {
    pub fn record(&mut self, method: DeliveryMethod, ok: bool) {
        self.attempts.push((method, ok));
    }

    pub fn attempts(&self) -> &[(DeliveryMethod, bool)] {
        &self.attempts
    }

    pub fn sent(&self) -> usize {
        self.attempts.iter().filter(|(_, ok)| *ok).count()
    }

    pub fn failures(&self) -> Vec<DeliveryMethod> {
        self.attempts
            .iter()
            .filter(|(_, ok)| !*ok)
            .map(|(m, _)| *m)
            .collect()
    }

    pub fn all_ok(&self) -> bool {
        self.attempts.iter().all(|(_, ok)| *ok)
    }
}

/// Production `Channels`: Shortcuts bridge, SMTP, SMS fallback and a drafts directory.
pub struct Dispatcher {
    bridge: BridgeClient,
    text_shortcut: String,
    notification_shortcut: String,
    reminder_shortcut: String,
    email: common::EmailConfig,
    sms: common::SmsConfig,
    drafts_dir: PathBuf,
}

impl Dispatcher {
    pub fn from_config(cfg: &DeliveryConfig) -> Self {
        Self {
            bridge: BridgeClient::from_config(&cfg.bridge),
            text_shortcut: cfg.bridge.text_shortcut.clone(),
            notification_shortcut: cfg.bridge.notification_shortcut.clone(),
            reminder_shortcut: cfg.bridge.reminder_shortcut.clone(),
            email: cfg.email.clone(),
            sms: cfg.sms.clone(),
            drafts_dir: PathBuf::from(&cfg.drafts_dir),
        }
    }

    async fn run_shortcut(&self, shortcut: &str, input: &str) -> bool {
        match self.bridge.run_shortcut(shortcut, input).await {
            Ok(_) => true,
            Err(e) => {
                warn!(shortcut, error = %e, "shortcut failed");
                false
            }
        }
    }

    async fn send_sms(&self, message: &str) -> bool {
        let Some(client) = SmsClient::from_env(&self.sms) else {
            error!("SMS fallback not configured");
            return false;
        };
        match client.send(message).await {
            Ok(()) => {
                info!("SMS sent");
                true
            }
            Err(e) => {
                error!(error = %e, "SMS send failed");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl Channels for Dispatcher {
    /// Bridge text shortcut when the bridge is up, SMS otherwise.
    async fn send_text(&self, message: &str) -> bool {
        if self.bridge.health().await {
            if self.run_shortcut(&self.text_shortcut, message).await {
                return true;
            }
            warn!("bridge text failed, trying SMS fallback");
        }
        self.send_sms(message).await
    }

    async fn send_email(&self, subject: &str, html_body: &str) -> bool {
        let sender = match EmailSender::from_env(&self.email) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "email not configured");
                return false;
            }
        };
        match sender.send_html(subject, html_body).await {
            Ok(()) => {
                info!(subject, "email sent");
                true
            }
            Err(e) => {
                error!(subject, error = %format!("{:#}", e), "email send failed");
                false
            }
        }
    }

    async fn save_draft(&self, filename: &str, content: &str) -> bool {
        match drafts::save_draft(&self.drafts_dir, filename, content).await {
            Ok(path) => {
                info!(path = %path.display(), "draft saved");
                true
            }
            Err(e) => {
                error!(filename, error = %format!("{:#}", e), "failed to save draft");
                false
            }
        }
    }

    async fn send_notification(&self, title: &str, body: &str) -> bool {
        self.run_shortcut(&self.notification_shortcut, &format!("{}\n{}", title, body))
            .await
    }

    async fn create_reminder(&self, title: &str) -> bool {
        self.run_shortcut(&self.reminder_shortcut, title).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts() {
        let mut r = DeliveryReport::default();
        assert!(r.all_ok());
        r.record(DeliveryMethod::Text, true);
        r.record(DeliveryMethod::Email, false);
        r.record(DeliveryMethod::File, true);
        assert_eq!(r.sent(), 2);
        assert_eq!(r.failures(), vec![DeliveryMethod::Email]);
        assert!(!r.all_ok());
    }

    #[tokio::test]
    async fn text_falls_back_to_sms_when_bridge_is_down() {
        let mut bridge = mockito::Server::new_async().await;
        let health = bridge
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let mut twilio = mockito::Server::new_async().await;
        let sms = twilio
            .mock("POST", "/2010-04-01/Accounts/AC123/Messages.json")
            .match_body(mockito::Matcher::UrlEncoded("Body".into(), "hello".into()))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;

        std::env::set_var("BRIEFING_TEST_FALLBACK_SID", "AC123");
        std::env::set_var("BRIEFING_TEST_FALLBACK_TOKEN", "secret");
        std::env::set_var("BRIEFING_TEST_FALLBACK_FROM", "+15550001");
        std::env::set_var("BRIEFING_TEST_FALLBACK_TO", "+15550002");

        let mut cfg = DeliveryConfig::default();
        cfg.bridge.url = bridge.url();
        cfg.sms = common::SmsConfig {
            api_base: twilio.url(),
            account_sid_env: "BRIEFING_TEST_FALLBACK_SID".into(),
            auth_token_env: "BRIEFING_TEST_FALLBACK_TOKEN".into(),
            from_env: "BRIEFING_TEST_FALLBACK_FROM".into(),
            to_env: "BRIEFING_TEST_FALLBACK_TO".into(),
        };

        let dispatcher = Dispatcher::from_config(&cfg);
        assert!(dispatcher.send_text("hello").await);

        health.assert_async().await;
        sms.assert_async().await;
    }

    #[tokio::test]
    async fn email_without_credentials_fails_cleanly() {
        let mut cfg = DeliveryConfig::default();
        cfg.email.sender_env = "BRIEFING_TEST_UNSET_SENDER".into();
        cfg.email.recipient_env = "BRIEFING_TEST_UNSET_RECIPIENT".into();
        cfg.email.password_env = "BRIEFING_TEST_UNSET_PASSWORD".into();
        let dispatcher = Dispatcher::from_config(&cfg);
        assert!(!dispatcher.send_email("subject", "<p>body</p>").await);
    }
}
