//! Outbound alert notifications.
//!
//! Two delivery channels: email over SMTP STARTTLS and Slack incoming
//! webhooks. Both sit behind trait abstractions so tests can capture
//! outbound messages without network calls. A missing channel configuration
//! (no SMTP host, no webhook URL) means "not sent", never an error — alert
//! evaluation must not fail because notification plumbing is absent.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::config::NotifyConfig;

/// Trait for SMTP sending.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()>;
}

/// Trait for webhook posting.
#[async_trait]
pub trait Webhook: Send + Sync {
    async fn post(&self, text: &str) -> Result<()>;
}

/// Real SMTP sender using lettre.
pub struct SmtpMailer {
    host: String,
    port: u16,
    from_address: String,
    username: String,
    password: String,
}

impl SmtpMailer {
    /// Build from config + environment. Returns `None` when the channel is
    /// not configured (missing host, from address, or credentials).
    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        let host = config.smtp_host.clone()?;
        let from_address = config.smtp_from.clone()?;
        let username = std::env::var(&config.smtp_username_env).ok()?;
        let password = std::env::var(&config.smtp_password_env).ok()?;

        Some(Self {
            host,
            port: config.smtp_port,
            from_address,
            username,
            password,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()> {
        let email = lettre::Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| anyhow!("Invalid from address: {}", e))?,
            )
            .to(to.parse().map_err(|e| anyhow!("Invalid to address: {}", e))?)
            .subject(subject)
            .header(lettre::message::header::ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .map_err(|e| anyhow!("Failed to build email: {}", e))?;

        let creds = lettre::transport::smtp::authentication::Credentials::new(
            self.username.clone(),
            self.password.clone(),
        );

        let mailer = lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(
            &self.host,
        )
        .map_err(|e| anyhow!("SMTP relay error: {}", e))?
        .port(self.port)
        .credentials(creds)
        .build();

        use lettre::AsyncTransport;
        mailer
            .send(email)
            .await
            .map_err(|e| anyhow!("SMTP send error: {}", e))?;

        Ok(())
    }
}

/// Slack incoming-webhook sender.
pub struct SlackWebhook {
    client: reqwest::Client,
    url: String,
}

impl SlackWebhook {
    /// Build from environment. Returns `None` when the webhook URL is unset.
    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        let url = std::env::var(&config.webhook_env).ok()?;
        if url.is_empty() {
            return None;
        }
        Some(Self {
            client: reqwest::Client::new(),
            url,
        })
    }
}

#[async_trait]
impl Webhook for SlackWebhook {
    async fn post(&self, text: &str) -> Result<()> {
        let payload = serde_json::json!({
            "text": text,
            "username": "Analytics Alert Bot",
            "icon_emoji": ":warning:",
        });

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Webhook returned {}", response.status());
        }

        Ok(())
    }
}

/// Routes alert messages to whichever channels are configured.
pub struct Notifier {
    mailer: Option<Box<dyn Mailer>>,
    webhook: Option<Box<dyn Webhook>>,
}

impl Notifier {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            mailer: SmtpMailer::from_config(config)
                .map(|m| Box::new(m) as Box<dyn Mailer>),
            webhook: SlackWebhook::from_config(config)
                .map(|w| Box::new(w) as Box<dyn Webhook>),
        }
    }

    /// Construct with explicit channel implementations (tests).
    pub fn new(mailer: Option<Box<dyn Mailer>>, webhook: Option<Box<dyn Webhook>>) -> Self {
        Self { mailer, webhook }
    }

    /// Send an email. Returns whether delivery succeeded; unconfigured or
    /// failing channels report `false`.
    pub async fn send_email(&self, to: &str, subject: &str, html_body: &str) -> bool {
        let mailer = match &self.mailer {
            Some(m) => m,
            None => return false,
        };

        match mailer.send(to, subject, html_body).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, to = %to, "email notification failed");
                false
            }
        }
    }

    /// Post to the webhook. Same contract as [`send_email`](Self::send_email).
    pub async fn send_slack(&self, text: &str) -> bool {
        let webhook = match &self.webhook {
            Some(w) => w,
            None => return false,
        };

        match webhook.post(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "slack notification failed");
                false
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Capturing channel fakes shared by alert tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct CapturingMailer {
        pub sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl Mailer for &'static CapturingMailer {
        async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()> {
            self.sent.lock().unwrap().push((
                to.to_string(),
                subject.to_string(),
                html_body.to_string(),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct CapturingWebhook {
        pub posts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Webhook for &'static CapturingWebhook {
        async fn post(&self, text: &str) -> Result<()> {
            self.posts.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    pub struct FailingMailer;

    #[async_trait]
    impl Mailer for FailingMailer {
        async fn send(&self, _to: &str, _subject: &str, _html_body: &str) -> Result<()> {
            anyhow::bail!("smtp unreachable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_channels_report_not_sent() {
        let notifier = Notifier::new(None, None);
        assert!(!notifier.send_email("a@b.c", "s", "b").await);
        assert!(!notifier.send_slack("hello").await);
    }

    #[tokio::test]
    async fn test_capturing_mailer_receives_message() {
        let mailer: &'static CapturingMailer = Box::leak(Box::default());
        let notifier = Notifier::new(Some(Box::new(mailer)), None);

        assert!(notifier.send_email("ops@example.com", "Alert", "<b>hi</b>").await);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "ops@example.com");
        assert_eq!(sent[0].1, "Alert");
    }

    #[tokio::test]
    async fn test_failing_mailer_reports_not_sent() {
        let notifier = Notifier::new(Some(Box::new(FailingMailer)), None);
        assert!(!notifier.send_email("a@b.c", "s", "b").await);
    }

    #[tokio::test]
    async fn test_webhook_capture() {
        let webhook: &'static CapturingWebhook = Box::leak(Box::default());
        let notifier = Notifier::new(None, Some(Box::new(webhook)));

        assert!(notifier.send_slack("alert fired").await);
        assert_eq!(webhook.posts.lock().unwrap()[0], "alert fired");
    }

    #[test]
    fn test_smtp_mailer_requires_full_config() {
        let config = NotifyConfig::default();
        // No host/from configured
        assert!(SmtpMailer::from_config(&config).is_none());
    }
}
