//! Outbound email: transactional mail to developers and cooldown-gated
//! alert fan-out to the operations team.

use crate::config::EmailConfig;
use async_trait::async_trait;
use lettre::{
    message::header::ContentType,
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mail message: {0}")]
    Message(String),

    #[error("smtp delivery failed: {0}")]
    Delivery(String),
}

/// Who a mail goes to: either the configured alert recipients, or one
/// specific address (activation links, quota warnings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Alerts,
    Address(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Plain,
    Html,
}

/// Outbound mail transport. Trait-object so tests can record what would have
/// been sent.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        to: Recipient,
        subject: &str,
        kind: ContentKind,
        body: String,
    ) -> Result<(), MailError>;
}

/// SMTP mailer over the configured server. The blocking SMTP transport runs
/// on the blocking thread pool so mail delivery never stalls the executor.
pub struct SmtpMailer {
    config: EmailConfig,
}

impl SmtpMailer {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        to: Recipient,
        subject: &str,
        kind: ContentKind,
        body: String,
    ) -> Result<(), MailError> {
        let recipients = match to {
            Recipient::Alerts => self.config.alerts_to.clone(),
            Recipient::Address(address) => vec![address],
        };
        let config = self.config.clone();
        let subject = subject.to_string();

        tokio::task::spawn_blocking(move || deliver(&config, &recipients, &subject, kind, body))
            .await
            .map_err(|e| MailError::Delivery(format!("mail task failed: {e}")))?
    }
}

fn deliver(
    config: &EmailConfig,
    recipients: &[String],
    subject: &str,
    kind: ContentKind,
    body: String,
) -> Result<(), MailError> {
    let mut builder = Message::builder()
        .from(config.from.parse().map_err(|e| MailError::Message(format!("from: {e}")))?)
        .subject(subject);
    for recipient in recipients {
        builder =
            builder.to(recipient.parse().map_err(|e| MailError::Message(format!("to: {e}")))?);
    }
    let content_type = match kind {
        ContentKind::Plain => ContentType::TEXT_PLAIN,
        ContentKind::Html => ContentType::TEXT_HTML,
    };
    let message =
        builder.header(content_type).body(body).map_err(|e| MailError::Message(e.to_string()))?;

    let mut transport = SmtpTransport::builder_dangerous(&config.server).port(config.port);
    if !config.user.is_empty() {
        transport =
            transport.credentials(Credentials::new(config.user.clone(), config.password.clone()));
    }

    transport
        .build()
        .send(&message)
        .map(|_| ())
        .map_err(|e| MailError::Delivery(e.to_string()))
}

/// Recording mailer for tests and local development: keeps every message in
/// memory instead of delivering it.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<SentMail>>,
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: Recipient,
    pub subject: String,
    pub kind: ContentKind,
    pub body: String,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(
        &self,
        to: Recipient,
        subject: &str,
        kind: ContentKind,
        body: String,
    ) -> Result<(), MailError> {
        self.sent.lock().push(SentMail { to, subject: subject.to_string(), kind, body });
        Ok(())
    }
}

/// Closure handed to lifecycle plugins so background work can surface errors
/// into the alert path.
pub type ErrorReporter = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// Alert fan-out with a shared cooldown.
///
/// One `last_alert` timestamp gates every alert mail -- pipeline errors and
/// upstream 5xx reports alike -- so a failing backend cannot cause an alert
/// storm.
pub struct Alerts {
    mailer: Arc<dyn Mailer>,
    cooldown: Duration,
    enabled: bool,
    last_alert: Mutex<Option<Instant>>,
}

impl Alerts {
    pub fn new(mailer: Arc<dyn Mailer>, cooldown_minutes: u64, enabled: bool) -> Self {
        Self {
            mailer,
            cooldown: Duration::from_secs(cooldown_minutes * 60),
            enabled,
            last_alert: Mutex::new(None),
        }
    }

    fn try_begin(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut last = self.last_alert.lock();
        match *last {
            Some(at) if at.elapsed() <= self.cooldown => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Sends an alert mail unless one went out within the cooldown window.
    /// Returns whether a mail was actually sent.
    pub async fn send(&self, subject: &str, kind: ContentKind, body: String) -> bool {
        if !self.try_begin() {
            return false;
        }
        if let Err(e) = self.mailer.send(Recipient::Alerts, subject, kind, body).await {
            tracing::warn!(error = %e, "alert mail delivery failed");
        }
        true
    }

    /// Reports an internal gateway error.
    pub async fn report(&self, error: &str) {
        tracing::error!(error, "gateway error");
        self.send("[API Error] Error on API gateway", ContentKind::Plain, error.to_string()).await;
    }

    /// An [`ErrorReporter`] feeding this alert sink, for lifecycle plugins.
    pub fn reporter(self: Arc<Self>) -> ErrorReporter {
        Arc::new(move |error: anyhow::Error| {
            let alerts = Arc::clone(&self);
            tokio::spawn(async move {
                alerts.report(&format!("{error:#}")).await;
            });
        })
    }
}
