use crate::util::errors::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

pub const DOCKER_HUB_URL: &str = "https://hub.docker.com";

/// Answers whether an image tag has been published.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn image_exists(&self, repository: &str, tag: &str) -> Result<bool>;
}

/// Looks tags up through the Docker Hub repository API.
#[derive(Clone)]
pub struct DockerHub {
    http: reqwest::Client,
    base_url: String,
}

impl Default for DockerHub {
    fn default() -> Self {
        Self::new(DOCKER_HUB_URL)
    }
}

impl DockerHub {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn tag_url(&self, repository: &str, tag: &str) -> String {
        format!("{}/v2/repositories/{}/tags/{}", self.base_url, repository, tag)
    }
}

#[async_trait]
impl ImageRegistry for DockerHub {
    async fn image_exists(&self, repository: &str, tag: &str) -> Result<bool> {
        let response = self
            .http
            .get(self.tag_url(repository, tag))
            .send()
            .await
            .map_err(|e| Error::HttpError(e.to_string()))?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::HttpError(format!(
                "registry answered {s} for {repository}:{tag}"
            ))),
        }
    }
}
