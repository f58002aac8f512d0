//! Broker client used by `thought-broker submit`.
//!
//! Starts a loop on a running broker, waits for it to finish, fetches the
//! consensus and writes the change artifacts to an output directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use deliberation::{Citation, Consensus, HaltReason, LoopStatus, VoiceId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

pub const SPEC_FILE: &str = "change.spec.md";
pub const TESTS_FILE: &str = "change.tests.json";
pub const ATTESTATION_FILE: &str = "attestation.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReply {
    pub loop_id: String,
    pub status: LoopStatus,
    pub step: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub status: LoopStatus,
    pub step: u32,
    pub score: Option<f64>,
    #[serde(default)]
    pub halt_reason: Option<HaltReason>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusReply {
    pub consensus: Consensus,
    pub attest_ref: Option<String>,
}

/// What gets recorded next to the artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationRecord {
    pub loop_id: String,
    pub attest_ref: Option<String>,
    pub score: f64,
    pub citations: Vec<Citation>,
    pub digest: String,
}

/// A loop to start.
#[derive(Debug, Clone)]
pub struct Submission {
    pub cycle: String,
    pub proposal_ref: String,
    pub spec_ref: Option<String>,
    pub tests_ref: Option<String>,
    pub goal: String,
    pub voices: Vec<VoiceId>,
}

impl Submission {
    fn body(&self) -> serde_json::Value {
        let models: Vec<_> = self.voices.iter().map(|v| json!({ "id": v })).collect();
        let mut body = json!({
            "cycle": self.cycle,
            "proposalRef": self.proposal_ref,
            "goal": self.goal,
            "models": models,
        });
        if let Some(spec_ref) = &self.spec_ref {
            body["specRef"] = json!(spec_ref);
        }
        if let Some(tests_ref) = &self.tests_ref {
            body["testsRef"] = json!(tests_ref);
        }
        body
    }
}

/// Result of a submit run.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub loop_id: String,
    pub attest_ref: Option<String>,
    pub files: Vec<PathBuf>,
}

pub struct BrokerClient {
    base_url: String,
    client: reqwest::Client,
}

impl BrokerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn start(&self, submission: &Submission) -> Result<StartReply> {
        let response = self
            .client
            .post(format!("{}/v1/loop/start", self.base_url))
            .json(&submission.body())
            .send()
            .await
            .context("Broker unreachable")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Broker rejected start ({}): {}", status, body);
        }
        response.json().await.context("Malformed start reply")
    }

    pub async fn status(&self, loop_id: &str) -> Result<StatusReply> {
        let response = self
            .client
            .get(format!("{}/v1/loop/{}/status", self.base_url, loop_id))
            .send()
            .await
            .context("Broker unreachable")?;
        if !response.status().is_success() {
            bail!("Status request failed ({})", response.status());
        }
        response.json().await.context("Malformed status reply")
    }

    pub async fn consensus(&self, loop_id: &str) -> Result<ConsensusReply> {
        let response = self
            .client
            .get(format!("{}/v1/loop/{}/consensus", self.base_url, loop_id))
            .send()
            .await
            .context("Broker unreachable")?;
        if !response.status().is_success() {
            bail!("Consensus request failed ({})", response.status());
        }
        response.json().await.context("Malformed consensus reply")
    }

    /// Poll status until the loop leaves `running`, at most `attempts` times.
    pub async fn wait_for_terminal(
        &self,
        loop_id: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<StatusReply> {
        for attempt in 1..=attempts {
            let status = self.status(loop_id).await?;
            if status.status.is_terminal() {
                return Ok(status);
            }
            info!(loop_id, attempt, step = status.step, "Loop still running");
            tokio::time::sleep(interval).await;
        }
        bail!("Loop {} still running after {} polls", loop_id, attempts)
    }
}

/// Start a loop, wait for it, and write its artifacts under `out_dir`.
pub async fn submit(
    client: &BrokerClient,
    submission: &Submission,
    out_dir: &Path,
) -> Result<SubmitOutcome> {
    let started = client.start(submission).await?;
    info!(loop_id = %started.loop_id, status = %started.status, step = started.step, "Loop started");

    let status = client
        .wait_for_terminal(&started.loop_id, 30, Duration::from_secs(1))
        .await?;
    if status.status != LoopStatus::Halted {
        let reason = status
            .halt_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        bail!("Loop {} ended {} ({})", started.loop_id, status.status, reason);
    }

    let reply = client.consensus(&started.loop_id).await?;
    if reply.attest_ref.is_none() {
        warn!(loop_id = %started.loop_id, "Consensus was not attested");
    }
    let files = write_artifacts(out_dir, &started.loop_id, &reply)?;
    Ok(SubmitOutcome {
        loop_id: started.loop_id,
        attest_ref: reply.attest_ref,
        files,
    })
}

/// Write spec delta, tests delta and attestation record into `out_dir`.
pub fn write_artifacts(out_dir: &Path, loop_id: &str, reply: &ConsensusReply) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let consensus = &reply.consensus;
    let record = AttestationRecord {
        loop_id: loop_id.to_string(),
        attest_ref: reply.attest_ref.clone(),
        score: consensus.score,
        citations: consensus.citations.clone(),
        digest: consensus.digest(),
    };

    let outputs = [
        (SPEC_FILE, consensus.spec_delta.clone()),
        (TESTS_FILE, serde_json::to_string_pretty(&consensus.tests_delta)?),
        (ATTESTATION_FILE, serde_json::to_string_pretty(&record)?),
    ];

    let mut written = Vec::with_capacity(outputs.len());
    for (name, content) in outputs {
        let path = out_dir.join(name);
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
