//! HTTP code-host dispatcher.

use std::time::Duration;

use async_trait::async_trait;
use deliberation::{DispatchError, DispatchReceipt, DispatchRequest, Dispatcher};
use tracing::debug;

/// Posts change proposals to `{url}/dispatch`.
pub struct HttpDispatcher {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(url: &str, token: String, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::RequestFailed(e.to_string()))?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let response = self
            .client
            .post(format!("{}/dispatch", self.url))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(|e| DispatchError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DispatchError::Status(response.status().as_u16()));
        }

        let receipt: DispatchReceipt = response
            .json()
            .await
            .map_err(|e| DispatchError::ParseError(e.to_string()))?;
        debug!(repo = %request.repo, branch = %request.branch, pr = %receipt.pr_url, "Dispatched change");
        Ok(receipt)
    }
}
