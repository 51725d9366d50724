//! HTTP client for the host application's internal API.
//!
//! The host application owns the analytics datastore, the organization and project records,
//! feature flags and subscription quotas. [`UpstreamClient`] exposes all of them through the
//! backend traits.

use std::time::Duration;

use async_trait::async_trait;
use rebalancer_common::{OrganizationId, ProjectId};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backends::{
    BlendedRates, EntityLookup, Feature, FeatureGates, FetchError, LookupError, Organization,
    Project, ProjectVolumeRow, TransactionVolumeRow, VolumeQuery, VolumeRequest,
};

/// An error sending a request to the upstream.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The upstream URL or a path could not be resolved.
    #[error("invalid upstream url")]
    InvalidUrl(#[from] url::ParseError),

    /// As opposed to the response variant, this contains all network errors.
    #[error("could not send request to upstream")]
    SendFailed(#[source] reqwest::Error),

    /// The upstream answered with an error status code.
    #[error("upstream request returned error {0}")]
    ResponseError(StatusCode),

    /// The response body could not be parsed.
    #[error("invalid upstream response")]
    InvalidResponse(#[source] reqwest::Error),
}

impl UpstreamError {
    /// Returns `true` if the request may succeed when sent again.
    ///
    /// Network errors, rate limits and server errors are transient. Client errors and malformed
    /// responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SendFailed(_) => true,
            Self::ResponseError(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::InvalidUrl(_) | Self::InvalidResponse(_) => false,
        }
    }
}

#[derive(Serialize)]
struct ProjectsRequest<'a> {
    project_ids: &'a [ProjectId],
}

#[derive(Deserialize)]
struct ProjectsResponse {
    projects: Vec<Project>,
}

#[derive(Deserialize)]
struct FeatureResponse {
    enabled: bool,
}

#[derive(Deserialize)]
struct BlendedRateResponse {
    blended_sample_rate: Option<f64>,
}

#[derive(Deserialize)]
struct RowsResponse<T> {
    data: Vec<T>,
}

/// Client for the internal API of the host application.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: Url,
}

impl UpstreamClient {
    /// Creates a client sending requests to `base_url` with the given timeout per request.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .build()
            .map_err(UpstreamError::SendFailed)?;

        // Paths are joined relative to the base, which drops a last segment without a slash.
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { client, base_url })
    }

    async fn request<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, UpstreamError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.base_url.join(path)?;
        let mut builder = self.client.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(UpstreamError::SendFailed)?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::ResponseError(status));
        }

        response.json().await.map_err(UpstreamError::InvalidResponse)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, UpstreamError> {
        self.request::<(), T>(Method::GET, path, None).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, UpstreamError> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Like [`get`](Self::get), but maps a 404 response to `None`.
    async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, UpstreamError> {
        match self.get(path).await {
            Ok(value) => Ok(Some(value)),
            Err(UpstreamError::ResponseError(StatusCode::NOT_FOUND)) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl VolumeQuery for UpstreamClient {
    async fn query_project_volumes(
        &self,
        request: &VolumeRequest,
    ) -> Result<Vec<ProjectVolumeRow>, FetchError> {
        let response: RowsResponse<_> = self
            .post("api/0/internal/ds/project-volumes/", request)
            .await?;
        Ok(response.data)
    }

    async fn query_transaction_volumes(
        &self,
        request: &VolumeRequest,
    ) -> Result<Vec<TransactionVolumeRow>, FetchError> {
        let response: RowsResponse<_> = self
            .post("api/0/internal/ds/transaction-volumes/", request)
            .await?;
        Ok(response.data)
    }
}

#[async_trait]
impl FeatureGates for UpstreamClient {
    async fn has(&self, feature: Feature, org_id: OrganizationId) -> Result<bool, LookupError> {
        let path = format!("api/0/internal/ds/features/{}/{org_id}/", feature.as_str());
        let response: FeatureResponse = self.get(&path).await?;
        Ok(response.enabled)
    }
}

#[async_trait]
impl EntityLookup for UpstreamClient {
    async fn get_organization(
        &self,
        org_id: OrganizationId,
    ) -> Result<Option<Organization>, LookupError> {
        let path = format!("api/0/internal/ds/organizations/{org_id}/");
        Ok(self.get_optional(&path).await?)
    }

    async fn get_project(&self, project_id: ProjectId) -> Result<Option<Project>, LookupError> {
        let projects = self.get_many_projects(&[project_id]).await?;
        Ok(projects.into_iter().find(|project| project.id == project_id))
    }

    async fn get_many_projects(
        &self,
        project_ids: &[ProjectId],
    ) -> Result<Vec<Project>, LookupError> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }

        let request = ProjectsRequest { project_ids };
        let response: ProjectsResponse = self.post("api/0/internal/ds/projects/", &request).await?;
        Ok(response.projects)
    }
}

#[async_trait]
impl BlendedRates for UpstreamClient {
    async fn get_blended_sample_rate(&self, project: &Project) -> Result<Option<f64>, LookupError> {
        let path = format!("api/0/internal/ds/projects/{}/blended-rate/", project.id);
        let response: Option<BlendedRateResponse> = self.get_optional(&path).await?;
        Ok(response.and_then(|response| response.blended_sample_rate))
    }
}
