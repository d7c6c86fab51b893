//! Mailgun-style HTTP mail API

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error};

use crate::errors::OrchestratorError;
use crate::notify::{DeliveryOutcome, EmailMessage, Mailer};
use crate::storage::kv::{KeyValueStore, MAIL_API_KEY, MAIL_DOMAIN, MAIL_FROM};

/// Sends through `POST {base}/{domain}/messages` with basic auth `api:<key>`.
/// Credentials come from the settings store on each send.
pub struct MailgunMailer {
    client: reqwest::Client,
    base_url: String,
    kv: Arc<dyn KeyValueStore>,
}

/// Send domain: explicit setting, else the domain of the sender address
pub fn resolve_domain(mail_domain: Option<&str>, mail_from: Option<&str>) -> Option<String> {
    if let Some(domain) = mail_domain.map(str::trim).filter(|d| !d.is_empty()) {
        return Some(domain.to_string());
    }
    mail_from
        .and_then(|from| from.rsplit_once('@'))
        .map(|(_, domain)| domain.trim().trim_end_matches('>').to_string())
        .filter(|domain| !domain.is_empty())
}

impl MailgunMailer {
    pub fn new(base_url: &str, kv: Arc<dyn KeyValueStore>) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            kv,
        })
    }
}

#[async_trait]
impl Mailer for MailgunMailer {
    async fn send(&self, message: &EmailMessage) -> Result<DeliveryOutcome, OrchestratorError> {
        let Some(api_key) = self.kv.get(MAIL_API_KEY).await?.map(SecretString::from) else {
            return Ok(DeliveryOutcome::Skipped("no mail API key".to_string()));
        };
        let from = self.kv.get(MAIL_FROM).await?;
        let domain = self.kv.get(MAIL_DOMAIN).await?;
        let Some(domain) = resolve_domain(domain.as_deref(), from.as_deref()) else {
            return Ok(DeliveryOutcome::Skipped("no mail send domain".to_string()));
        };
        let from = from.unwrap_or_else(|| format!("optimizerd@{}", domain));

        let url = format!("{}/{}/messages", self.base_url, domain);
        debug!("POST {} (to {})", url, message.to);

        let response = self
            .client
            .post(&url)
            .basic_auth("api", Some(api_key.expose_secret()))
            .form(&[
                ("from", from.as_str()),
                ("to", message.to.as_str()),
                ("subject", message.subject.as_str()),
                ("text", message.text.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Mail API POST failed: {} - {}", status, body);
            return Err(OrchestratorError::Notification(format!("{}: {}", status, body)));
        }

        Ok(DeliveryOutcome::Sent)
    }
}
