//! Outbound send boundary.
//!
//! The provider behind [`MailTransport`] (SMTP relay, HTTP API) is owned by
//! the surrounding application. Dispatch only needs "send this rendered
//! message from this mailbox" and a provider message id back.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use campaign_core::types::EmailJob;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub from_email: String,
    pub from_name: String,
    pub to_email: String,
    pub subject: String,
    pub body_html: String,
}

impl From<&EmailJob> for OutboundEmail {
    fn from(job: &EmailJob) -> Self {
        Self {
            from_email: job.from_email.clone(),
            from_name: job.from_name.clone(),
            to_email: job.to_email.clone(),
            subject: job.subject.clone(),
            body_html: job.body_html.clone(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("provider rejected message: {0}")]
    Rejected(String),

    #[error("provider connection failed: {0}")]
    Connection(String),

    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Hands one message to the provider and returns its message id.
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError>;
}

/// Transport that only logs. Used for dry runs and local development.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let message_id = format!("log-{}", Uuid::new_v4());
        info!(
            from = %email.from_email,
            to = %email.to_email,
            subject = %email.subject,
            message_id = %message_id,
            "Email handed to log transport"
        );
        Ok(message_id)
    }
}

/// In-memory transport that records sends, for testing.
///
/// Failures queued with [`fail_next`](Self::fail_next) are returned in order
/// before any send succeeds again.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundEmail>>,
    failures: Mutex<VecDeque<TransportError>>,
    latency: Option<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send sleeps for `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = self.failures.lock().pop_front() {
            debug!(to = %email.to_email, error = %error, "Recording transport injected failure");
            return Err(error);
        }
        self.sent.lock().push(email.clone());
        Ok(format!("rec-{}", Uuid::new_v4()))
    }
}
