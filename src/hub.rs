//! Gated model hub access (Hugging Face compatible)

use crate::config::HubConfig;
use crate::error::LoadError;
use crate::registry::download_atomically;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
struct WhoAmI {
    name: String,
}

pub struct HubClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HubClient {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            client: Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Check the configured token and return the account it belongs to.
    pub async fn authenticate(&self) -> Result<String, LoadError> {
        if self.token.is_none() {
            return Err(LoadError::artifact("no hub token configured"));
        }
        let request = self.client.get(format!("{}/api/whoami-v2", self.endpoint));
        let who: WhoAmI = self
            .authorized(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(who.name)
    }

    /// Download one file of a repository revision to `dest`.
    pub async fn download(
        &self,
        repo: &str,
        revision: &str,
        file: &str,
        dest: &Path,
    ) -> Result<(), LoadError> {
        let url = format!("{}/{}/resolve/{}/{}", self.endpoint, repo, revision, file);
        info!(url = %url, "Downloading model from hub");

        let response = self.authorized(self.client.get(&url)).send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(LoadError::artifact(format!(
                    "access to gated repository '{}' denied (status {}); check the hub token",
                    repo,
                    response.status()
                )));
            }
            StatusCode::NOT_FOUND => {
                return Err(LoadError::artifact(format!(
                    "'{}' not found in repository '{}' at revision '{}'",
                    file, repo, revision
                )));
            }
            _ => {}
        }

        let bytes = download_atomically(response.error_for_status()?, dest).await?;
        info!(repo = %repo, file = %file, bytes = bytes, "Hub download complete");
        Ok(())
    }
}
