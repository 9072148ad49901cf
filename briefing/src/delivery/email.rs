use anyhow::{Context, Result};
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

/// HTML digests over SMTP with STARTTLS
pub struct EmailSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailSender {
    pub fn from_env(cfg: &common::EmailConfig) -> Result<Self> {
        let env = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .with_context(|| format!("{} not set", name))
        };
        let sender = env(&cfg.sender_env)?;
        let recipient = env(&cfg.recipient_env)?;
        let password = env(&cfg.password_env)?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
            .with_context(|| format!("invalid SMTP host {}", cfg.smtp_host))?
            .port(cfg.smtp_port)
            .credentials(Credentials::new(sender.clone(), password))
            .build();

        let from = sender
            .parse()
            .with_context(|| format!("invalid sender address {}", sender))?;
        let to = recipient
            .parse()
            .with_context(|| format!("invalid recipient address {}", recipient))?;

        Ok(Self { mailer, from, to })
    }

    pub async fn send_html(&self, subject: &str, html_body: &str) -> Result<()> {
        let msg = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(header::ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .context("build email")?;

        self.mailer.send(msg).await.context("send email")?;
        Ok(())
    }
}
