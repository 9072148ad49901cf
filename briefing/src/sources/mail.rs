//! Mailbox reader. An external command (an AppleScript wrapper, an IMAP
//! helper, ...) prints the messages of one label as a JSON array.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;

use crate::pipeline::batch::{clip, lenient_string};

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const BODY_MAX_CHARS: usize = 3000;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MailMessage {
    #[serde(default, rename = "from", deserialize_with = "lenient_string")]
    pub from_addr: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub subject: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub date: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub body: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub attachments: String,
}

impl MailMessage {
    /// `from:subject:date`
    pub fn message_id(&self) -> String {
        format!("{}:{}:{}", self.from_addr, self.subject, self.date)
    }
}

pub fn parse_output(stdout: &str) -> Result<Vec<MailMessage>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut messages: Vec<MailMessage> =
        serde_json::from_str(trimmed).context("mail command output is not a JSON array of messages")?;
    for m in &mut messages {
        if m.body.chars().count() > BODY_MAX_CHARS {
            m.body = clip(&m.body, BODY_MAX_CHARS).to_string();
        }
    }
    Ok(messages)
}

/// Run `argv max_items label` and parse its stdout.
pub async fn read_label(argv: &[String], label: &str, max_items: usize, timeout: Duration) -> Result<Vec<MailMessage>> {
    let (program, args) = argv
        .split_first()
        .context("no mail_command configured for email triage")?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .arg(max_items.to_string())
        .arg(label)
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .with_context(|| format!("mail command timed out after {:?}", timeout))?
        .with_context(|| format!("failed to run mail command {}", program))?;

    if !output.status.success() {
        anyhow::bail!(
            "mail command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_output(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_messages() {
        let out = r#"[
            {"from": "dean@uni.test", "subject": "Budget", "date": "2025-01-02", "body": "Need numbers", "attachments": ["a.pdf", "b.xlsx"]},
            {"from": "x@y.test", "subject": "Hi"}
        ]"#;
        let msgs = parse_output(out).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].attachments, "a.pdf, b.xlsx");
        assert_eq!(msgs[0].message_id(), "dean@uni.test:Budget:2025-01-02");
        assert_eq!(msgs[1].body, "");

        assert!(parse_output("  \n").unwrap().is_empty());
        assert!(parse_output("not json").is_err());
    }

    #[test]
    fn long_bodies_are_clipped() {
        let out = format!(r#"[{{"from":"a","subject":"b","date":"c","body":"{}"}}]"#, "y".repeat(4000));
        assert_eq!(parse_output(&out).unwrap()[0].body.len(), BODY_MAX_CHARS);
    }

    #[tokio::test]
    async fn rejects_empty_command() {
        let err = read_label(&[], "AI-REVIEW", 5, COMMAND_TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("no mail_command"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_with_count_and_label() {
        // $1 is max_items, $2 the label
        let argv: Vec<String> = vec![
            "sh".into(),
            "-c".into(),
            r#"printf '[{"from":"a","subject":"%s","date":"%s"}]' "$2" "$1""#.into(),
            "sh".into(),
        ];
        let msgs = read_label(&argv, "AI-REVIEW", 7, COMMAND_TIMEOUT).await.unwrap();
        assert_eq!(msgs[0].subject, "AI-REVIEW");
        assert_eq!(msgs[0].date, "7");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_and_slow_commands_error() {
        let fail: Vec<String> = vec!["sh".into(), "-c".into(), "echo nope >&2; exit 3".into()];
        let err = read_label(&fail, "L", 1, COMMAND_TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("nope"));

        let slow: Vec<String> = vec!["sh".into(), "-c".into(), "sleep 5".into()];
        let err = read_label(&slow, "L", 1, Duration::from_millis(100)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
