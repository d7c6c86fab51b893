//! Hetzner Cloud REST client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, info};

use crate::cloud::models::{
    CreateServerRequest, DeleteOutcome, ServerEnvelope, ServerId, ServerInfo, ServerLookup,
};
use crate::cloud::CloudProvider;
use crate::errors::OrchestratorError;
use crate::storage::kv::{KeyValueStore, CLOUD_API_TOKEN};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for the Hetzner Cloud API.
///
/// The API token is read from the settings store on every call so a rotated
/// token takes effect without a restart.
pub struct HetznerClient {
    client: Client,
    base_url: String,
    kv: Arc<dyn KeyValueStore>,
}

impl HetznerClient {
    pub fn new(base_url: &str, kv: Arc<dyn KeyValueStore>) -> Result<Self, OrchestratorError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            kv,
        })
    }

    async fn token(&self) -> Result<SecretString, OrchestratorError> {
        self.kv
            .get(CLOUD_API_TOKEN)
            .await?
            .map(SecretString::from)
            .ok_or_else(|| OrchestratorError::Config("cloud API token is not configured".to_string()))
    }

    fn server_url(&self, id: ServerId) -> String {
        format!("{}/servers/{}", self.base_url, id)
    }

    async fn provisioning_error(method: &str, url: &str, response: Response) -> OrchestratorError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!("Cloud API {} {} failed: {} - {}", method, url, status, body);
        OrchestratorError::Provisioning {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl CloudProvider for HetznerClient {
    async fn create_server(
        &self,
        request: &CreateServerRequest,
    ) -> Result<ServerInfo, OrchestratorError> {
        let url = format!("{}/servers", self.base_url);
        debug!("POST {} ({})", url, request.name);

        let token = self.token().await?;
        let response = self
            .client
            .post(&url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            )
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provisioning_error("POST", &url, response).await);
        }

        let envelope: ServerEnvelope = response.json().await?;
        let info = ServerInfo::from(envelope.server);
        info!("Created server {} ({})", info.id, request.name);
        Ok(info)
    }

    async fn get_server(&self, id: ServerId) -> Result<ServerLookup, OrchestratorError> {
        let url = self.server_url(id);
        debug!("GET {}", url);

        let token = self.token().await?;
        let response = self
            .client
            .get(&url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            )
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ServerLookup::Missing);
        }
        if !response.status().is_success() {
            return Err(Self::provisioning_error("GET", &url, response).await);
        }

        let envelope: ServerEnvelope = response.json().await?;
        Ok(ServerLookup::Found(envelope.server.into()))
    }

    async fn delete_server(&self, id: ServerId) -> Result<DeleteOutcome, OrchestratorError> {
        let url = self.server_url(id);
        debug!("DELETE {}", url);

        let token = self.token().await?;
        let response = self
            .client
            .delete(&url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            )
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Server {} already gone", id);
            return Ok(DeleteOutcome::Missing);
        }
        if !response.status().is_success() {
            return Err(Self::provisioning_error("DELETE", &url, response).await);
        }

        info!("Deleted server {}", id);
        Ok(DeleteOutcome::Deleted)
    }
}
