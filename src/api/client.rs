//! Client side of the apply endpoint, for coordinators running outside the
//! server process.

use std::time::Duration;

use crate::api::handlers::ErrorResponse;
use crate::api::user_extractor::USER_ID_HEADER;
use crate::error::{SyncError, SyncResult};
use crate::logic::ApplyEndpoint;
use crate::model::{ApplyRequest, ApplyResponse, Id, SchemaDocument};

pub struct HttpApplyEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApplyEndpoint {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn project_url(&self, tenant_id: &Id, project_id: &Id, leaf: &str) -> String {
        format!(
            "{}/tenants/{}/projects/{}/{}",
            self.base_url, tenant_id, project_id, leaf
        )
    }
}

/// Timeouts and refused connections use up one retry attempt like any other
/// connectivity failure.
fn transport_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        SyncError::Connectivity(e.to_string())
    } else {
        SyncError::Internal(anyhow::Error::new(e))
    }
}

#[async_trait::async_trait]
impl ApplyEndpoint for HttpApplyEndpoint {
    async fn submit(&self, request: &ApplyRequest) -> SyncResult<i64> {
        let response = self
            .client
            .post(self.project_url(&request.tenant_id, &request.project_id, "apply"))
            .header(USER_ID_HEADER, &request.user_id)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let body: ApplyResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => return Err(SyncError::from_status(status, e.to_string())),
        };

        match (body.success, body.new_version) {
            (true, Some(version)) => Ok(version),
            (true, None) => Err(SyncError::Internal(anyhow::anyhow!(
                "apply succeeded without a new version"
            ))),
            (false, _) => Err(SyncError::from_status(
                body.status_hint.unwrap_or(status),
                body.error.unwrap_or_else(|| format!("apply failed with status {}", status)),
            )),
        }
    }

    async fn fetch_document(&self, tenant_id: &Id, project_id: &Id) -> SyncResult<SchemaDocument> {
        let response = self
            .client
            .get(self.project_url(tenant_id, project_id, "document"))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(SyncError::from_status(status.as_u16(), message));
        }

        response.json().await.map_err(transport_error)
    }
}

