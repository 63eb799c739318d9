use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use crate::{check_recipient, MailError, Mailer, OutgoingMail};

/// Mailer that only logs messages; used in development without a mail API.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError> {
        check_recipient(to)?;
        info!(stage = "mail", to, subject, body = html_body, "mail delivery skipped (log mailer)");
        Ok(())
    }
}

/// Mailer that keeps every message in memory.
#[derive(Clone, Default)]
pub struct MemoryMailer {
    sent: Arc<Mutex<Vec<OutgoingMail>>>,
    fail_with_status: Arc<Mutex<Option<reqwest::StatusCode>>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far, oldest first.
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes subsequent sends fail with the given status until cleared.
    pub fn fail_with(&self, status: Option<reqwest::StatusCode>) {
        *self
            .fail_with_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError> {
        check_recipient(to)?;
        let failure = *self
            .fail_with_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(status) = failure {
            return Err(MailError::Status {
                status,
                body: String::from("rejected by memory mailer"),
            });
        }

        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(OutgoingMail {
                from: String::from("memory"),
                to: to.trim().to_string(),
                subject: subject.to_string(),
                html: html_body.to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[tokio::test]
    async fn records_messages_in_order() {
        let mailer = MemoryMailer::new();
        mailer.send("a@clinic.test", "one", "1").await.unwrap();
        mailer.send("b@clinic.test", "two", "2").await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].to, "a@clinic.test");
        assert_eq!(sent[1].subject, "two");
    }

    #[tokio::test]
    async fn injected_failures_are_transient_server_errors() {
        let mailer = MemoryMailer::new();
        mailer.fail_with(Some(StatusCode::BAD_GATEWAY));
        let err = mailer.send("a@clinic.test", "one", "1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(mailer.sent().is_empty());

        mailer.fail_with(None);
        mailer.send("a@clinic.test", "one", "1").await.unwrap();
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn log_mailer_validates_recipient() {
        assert!(LogMailer.send("a@clinic.test", "s", "b").await.is_ok());
        assert!(LogMailer.send("", "s", "b").await.is_err());
    }
}
