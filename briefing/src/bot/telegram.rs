use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const API_URL: &str = "https://api.telegram.org";
/// Per-message character limit of the Bot API
pub const MAX_MESSAGE_LEN: usize = 4096;
pub const POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Serialize)]
struct GetUpdates<'a> {
    timeout: u64,
    allowed_updates: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

#[derive(Serialize)]
struct SendChatAction<'a> {
    chat_id: i64,
    action: &'a str,
}

/// Thin Bot API client. The token is part of every URL, so URLs are never logged.
#[derive(Clone)]
pub struct TelegramClient {
    endpoint: String,
    client: Client,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self::with_api_url(API_URL, token)
    }

    pub fn with_api_url(api_url: &str, token: &str) -> Self {
        Self {
            endpoint: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
            client: Client::new(),
        }
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T> {
        let resp = self
            .client
            .post(format!("{}/{}", self.endpoint, method))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("telegram {} request failed", method))?;
        let envelope: Envelope<T> = resp
            .json()
            .await
            .with_context(|| format!("telegram {} returned non-JSON body", method))?;
        if !envelope.ok {
            anyhow::bail!(
                "telegram {} failed: {}",
                method,
                envelope.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        envelope
            .result
            .with_context(|| format!("telegram {} returned no result", method))
    }

    /// Verify the token; returns the bot's username.
    pub async fn get_me(&self) -> Result<String> {
        let me: User = self
            .call("getMe", &serde_json::json!({}), Duration::from_secs(30))
            .await?;
        Ok(me.username.unwrap_or_default())
    }

    /// Long-poll for new messages.
    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let body = GetUpdates {
            timeout: POLL_TIMEOUT_SECS,
            allowed_updates: &["message"],
            offset,
        };
        self.call("getUpdates", &body, Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .await
    }

    /// Send `text`, split into API-sized chunks. Each chunk goes out as Markdown
    /// first and is resent as plain text when Telegram rejects the markup.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in chunk_text(text, MAX_MESSAGE_LEN) {
            let markdown = SendMessage {
                chat_id,
                text: &chunk,
                parse_mode: Some("Markdown"),
            };
            let sent: Result<serde_json::Value> = self
                .call("sendMessage", &markdown, Duration::from_secs(30))
                .await;
            if let Err(e) = sent {
                debug!(error = %e, "markdown send rejected, retrying as plain text");
                let plain = SendMessage {
                    chat_id,
                    text: &chunk,
                    parse_mode: None,
                };
                let _: serde_json::Value = self
                    .call("sendMessage", &plain, Duration::from_secs(30))
                    .await?;
            }
        }
        Ok(())
    }

    /// Show the "typing..." indicator. Best effort.
    pub async fn send_typing(&self, chat_id: i64) {
        let body = SendChatAction {
            chat_id,
            action: "typing",
        };
        let sent: Result<bool> = self
            .call("sendChatAction", &body, Duration::from_secs(10))
            .await;
        if let Err(e) = sent {
            warn!(error = %e, "typing indicator failed");
        }
    }
}

/// Split on character (not byte) boundaries into pieces of at most `max` chars.
pub fn chunk_text(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(max.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn chunks_respect_char_boundaries() {
        let text = "é".repeat(5000);
        let chunks = chunk_text(&text, MAX_MESSAGE_LEN);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4096);
        assert_eq!(chunks[1].chars().count(), 904);
        assert_eq!(chunk_text("short", 10), vec!["short".to_string()]);
    }

    #[tokio::test]
    async fn markdown_failure_falls_back_to_plain_text() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::PartialJson(
                serde_json::json!({"chat_id": 7, "parse_mode": "Markdown"}),
            ))
            .with_body(r#"{"ok":false,"description":"Bad Request: can't parse entities"}"#)
            .expect(1)
            .create_async()
            .await;
        let plain = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::Json(serde_json::json!({"chat_id": 7, "text": "*broken"})))
            .with_body(r#"{"ok":true,"result":{"message_id":1}}"#)
            .expect(1)
            .create_async()
            .await;

        let client = TelegramClient::with_api_url(&server.url(), "TOKEN");
        client.send_message(7, "*broken").await.unwrap();
        rejected.assert_async().await;
        plain.assert_async().await;
    }

    #[tokio::test]
    async fn polls_with_offset() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/botTOKEN/getUpdates")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "offset": 42,
                "timeout": 30,
                "allowed_updates": ["message"]
            })))
            .with_body(
                r#"{"ok":true,"result":[
                    {"update_id":42,"message":{"chat":{"id":9},"text":"/help"}},
                    {"update_id":43,"edited_message":{}}
                ]}"#,
            )
            .create_async()
            .await;

        let client = TelegramClient::with_api_url(&server.url(), "TOKEN");
        let updates = client.get_updates(Some(42)).await.unwrap();
        assert_eq!(updates.len(), 2);
        let msg = updates[0].message.as_ref().unwrap();
        assert_eq!(msg.chat.id, 9);
        assert_eq!(msg.text.as_deref(), Some("/help"));
        assert!(updates[1].message.is_none());
    }

    #[tokio::test]
    async fn invalid_token_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/botBAD/getMe")
            .with_status(401)
            .with_body(r#"{"ok":false,"description":"Unauthorized"}"#)
            .create_async()
            .await;

        let client = TelegramClient::with_api_url(&server.url(), "BAD");
        let err = client.get_me().await.unwrap_err();
        assert!(err.to_string().contains("Unauthorized"));
    }
}
