//! REST backend connector
//!
//! Talks to the backend management API over HTTPS with the admin token as
//! bearer credential. HTTP 404 on lookups is reported as `Ok(None)`.

use crate::domain::ports::{
    BackendConnector, BackendInfo, NewCredential, PolicyRequest, RemoteCredential, RemotePolicy,
    RemoteProject,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the REST connector
#[derive(Clone)]
pub struct RestConfig {
    /// Management endpoint, `host:port`
    pub endpoint: String,
    /// Admin bearer token
    pub token: String,
    /// CA bundle for the management endpoint (PEM)
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate and key (PEM, concatenated)
    pub identity_pem: Option<Vec<u8>>,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:443".to_string(),
            token: String::new(),
            ca_pem: None,
            identity_pem: None,
            request_timeout: Duration::from_secs(30),
            user_agent: crate::config::FIELD_MANAGER.to_string(),
        }
    }
}

impl std::fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestConfig")
            .field("endpoint", &self.endpoint)
            .field("client_cert", &self.identity_pem.is_some())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Serialize)]
struct CreateProjectBody<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct PolicyList {
    #[serde(default)]
    policies: Vec<RemotePolicy>,
}

// =============================================================================
// REST Connector
// =============================================================================

/// Backend connector for the JSON management API
pub struct RestConnector {
    client: Client,
    base_url: String,
    token: String,
}

impl RestConnector {
    /// Build a connector; does not contact the backend
    pub fn new(config: RestConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone());

        if let Some(ca) = &config.ca_pem {
            builder = builder.add_root_certificate(Certificate::from_pem(ca)?);
        }
        if let Some(identity) = &config.identity_pem {
            info!(endpoint = %config.endpoint, "connecting to backend with client certificate");
            builder = builder.identity(Identity::from_pem(identity)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: format!("https://{}/api/v2", config.endpoint),
            token: config.token,
        })
    }

    fn url(&self, segments: &[&str]) -> String {
        let path = segments
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.base_url, path)
    }

    /// Turn a non-success response into an error
    async fn check(operation: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(operation, %status, body = %body, "backend request failed");

        match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                Err(Error::BackendUnavailable {
                    backend: format!("rest ({})", status),
                })
            }
            _ => Err(Error::backend(operation, format!("{}: {}", status, body.trim()))),
        }
    }

    async fn read<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T> {
        Ok(Self::check(operation, response).await?.json().await?)
    }

    async fn read_optional<T: DeserializeOwned>(
        operation: &str,
        response: Response,
    ) -> Result<Option<T>> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read(operation, response).await.map(Some)
    }
}

#[async_trait]
impl BackendConnector for RestConnector {
    async fn get_project(&self, name: &str) -> Result<Option<RemoteProject>> {
        let response = self
            .client
            .get(self.url(&["projects", name]))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read_optional("GetProject", response).await
    }

    async fn create_project(&self, name: &str) -> Result<RemoteProject> {
        let response = self
            .client
            .post(self.url(&["projects"]))
            .bearer_auth(&self.token)
            .json(&CreateProjectBody { name })
            .send()
            .await?;
        Self::read("CreateProject", response).await
    }

    async fn get_credential(&self, project: &str, id: &str) -> Result<Option<RemoteCredential>> {
        let response = self
            .client
            .get(self.url(&["projects", project, "credentials", id]))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read_optional("GetCredential", response).await
    }

    async fn create_credential(&self, request: NewCredential) -> Result<RemoteCredential> {
        let response = self
            .client
            .post(self.url(&["projects", &request.project_name, "credentials"]))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;
        Self::read("CreateCredential", response).await
    }

    async fn list_policies(&self) -> Result<Vec<RemotePolicy>> {
        let response = self
            .client
            .get(self.url(&["qos", "policies"]))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let list: PolicyList = Self::read("ListPolicies", response).await?;
        Ok(list.policies)
    }

    async fn create_policy(&self, request: &PolicyRequest) -> Result<RemotePolicy> {
        let response = self
            .client
            .post(self.url(&["qos", "policies"]))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        Self::read("CreatePolicy", response).await
    }

    async fn update_policy(&self, id: &str, request: &PolicyRequest) -> Result<()> {
        let response = self
            .client
            .put(self.url(&["qos", "policies", id]))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        Self::check("UpdatePolicy", response).await?;
        Ok(())
    }

    async fn delete_policy(&self, id: &str, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&["qos", "policies", id]))
            .query(&[("name", name)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check("DeletePolicy", response).await?;
        Ok(())
    }

    async fn info(&self) -> Result<BackendInfo> {
        let response = self
            .client
            .get(self.url(&["cluster"]))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read("GetClusterInfo", response).await
    }

    fn backend_name(&self) -> &str {
        "rest"
    }
}
