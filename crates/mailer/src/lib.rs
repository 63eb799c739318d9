pub mod http;
pub mod memory;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

pub use http::HttpMailer;
pub use memory::{LogMailer, MemoryMailer};

/// Outbound email capability.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError>;
}

/// One message as handed to the mail API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Errors that can occur while dispatching email.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl MailError {
    /// Returns `true` when a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::InvalidRecipient(_) | Self::Url(_) => false,
        }
    }
}

fn check_recipient(to: &str) -> Result<(), MailError> {
    let to = to.trim();
    if to.is_empty() || !to.contains('@') {
        return Err(MailError::InvalidRecipient(to.to_string()));
    }
    Ok(())
}
