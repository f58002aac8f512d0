//! HTTP ledger attestor.

use std::time::Duration;

use async_trait::async_trait;
use deliberation::{AttestError, AttestationPayload, LedgerAttestor};
use tracing::debug;

/// Posts deliberation proofs to `{base}/ledger/attest`.
pub struct HttpLedgerAttestor {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpLedgerAttestor {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, AttestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AttestError::RequestFailed(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/ledger/attest", self.base_url)
    }
}

#[async_trait]
impl LedgerAttestor for HttpLedgerAttestor {
    async fn attest(&self, payload: &AttestationPayload) -> Result<String, AttestError> {
        let mut request = self.client.post(self.endpoint()).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AttestError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AttestError::Status(response.status().as_u16()));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|_| AttestError::MissingReference)?;

        let reference = json["id"]
            .as_str()
            .or_else(|| json["tx"].as_str())
            .filter(|r| !r.trim().is_empty())
            .ok_or(AttestError::MissingReference)?;

        debug!(loop_id = %payload.loop_id, reference, "Ledger attestation recorded");
        Ok(reference.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let ledger =
            HttpLedgerAttestor::new("http://ledger.local:4000/", None, Duration::from_secs(1))
                .unwrap();
        assert_eq!(ledger.endpoint(), "http://ledger.local:4000/ledger/attest");
    }
}
