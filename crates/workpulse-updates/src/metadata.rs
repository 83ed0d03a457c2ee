//! Update metadata endpoint client

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;
use workpulse_http::{HttpClientTrait, StatusCode};

use crate::error::{Result, UpdateError};
use crate::models::UpdateArtifactDescriptor;
use crate::version::VersionIdentifier;

/// Source of update descriptors
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Latest published update for an agent at `current`; `None` when the
    /// server has nothing to offer.
    async fn latest(&self, current: &VersionIdentifier) -> Result<Option<UpdateArtifactDescriptor>>;
}

/// `GET {endpoint}/updates/latest` over HTTP
pub struct HttpMetadataSource {
    client: Arc<dyn HttpClientTrait>,
    endpoint: Url,
    platform: String,
    architecture: String,
}

impl HttpMetadataSource {
    /// Create a client for `endpoint`, reporting this host's platform
    pub fn new(client: Arc<dyn HttpClientTrait>, endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| UpdateError::config(format!("invalid update endpoint '{endpoint}': {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(UpdateError::config(format!(
                "update endpoint '{endpoint}' cannot carry a path"
            )));
        }

        Ok(Self {
            client,
            endpoint,
            platform: current_platform().to_string(),
            architecture: current_architecture().to_string(),
        })
    }

    /// Override the reported platform and architecture
    pub fn with_platform(mut self, platform: impl Into<String>, architecture: impl Into<String>) -> Self {
        self.platform = platform.into();
        self.architecture = architecture.into();
        self
    }

    /// Request URL for a given installed version
    pub fn latest_url(&self, current: &VersionIdentifier) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["updates", "latest"]);
        }
        url.query_pairs_mut()
            .append_pair("currentVersion", &current.to_string())
            .append_pair("platform", &self.platform)
            .append_pair("architecture", &self.architecture);
        url
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn latest(&self, current: &VersionIdentifier) -> Result<Option<UpdateArtifactDescriptor>> {
        let url = self.latest_url(current);
        debug!(%url, "Checking for updates");

        let response = self
            .client
            .get(url.as_str())
            .await
            .map_err(UpdateError::metadata_from_http)?;

        if response.status() == StatusCode::NO_CONTENT {
            debug!("No update published");
            return Ok(None);
        }
        if response.status() != StatusCode::OK {
            return Err(UpdateError::metadata(
                format!("unexpected status {}", response.status()),
                false,
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| UpdateError::metadata(format!("failed to read response: {e}"), true))?;
        let descriptor: UpdateArtifactDescriptor = serde_json::from_str(&body)
            .map_err(|e| UpdateError::metadata(format!("malformed update descriptor: {e}"), true))?;

        info!(
            version = %descriptor.version,
            required = descriptor.is_required,
            pre_release = descriptor.is_pre_release,
            "Received update descriptor"
        );
        Ok(Some(descriptor))
    }
}

/// Platform name sent to the update server
pub fn current_platform() -> &'static str {
    std::env::consts::OS
}

/// Architecture name sent to the update server
pub fn current_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "x86" => "x86",
        "aarch64" => "arm64",
        other => other,
    }
}
