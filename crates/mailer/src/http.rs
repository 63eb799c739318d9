use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::debug;
use url::Url;

use crate::{check_recipient, MailError, Mailer, OutgoingMail};

/// Client for a JSON mail delivery API (`POST {base}/messages`).
#[derive(Clone)]
pub struct HttpMailer {
    http: Client,
    base_url: Url,
    api_key: String,
    sender: String,
}

impl HttpMailer {
    /// Creates a new client with the provided HTTP instance and configuration.
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        sender: impl Into<String>,
        http: Client,
    ) -> Result<Self, MailError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
            sender: sender.into(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError> {
        check_recipient(to)?;
        let url = self.base_url.join("messages")?;
        let message = OutgoingMail {
            from: self.sender.clone(),
            to: to.trim().to_string(),
            subject: subject.to_string(),
            html: html_body.to_string(),
        };

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&message)
            .send()
            .await?;
        ensure_success(response).await?;

        debug!(stage = "mail", subject, "mail accepted by api");
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<(), MailError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(MailError::Status { status, body });
    }
    Ok(())
}
