//! Thought Broker service.
//!
//! Wires the `deliberation` engine to the outside world:
//!
//! - [`api`]: axum HTTP surface under `/v1/loop`
//! - [`config`]: layered configuration (defaults, TOML, env, CLI)
//! - [`models`]: OpenAI-compatible model voices and offline scripted voices
//! - [`ledger`]: HTTP ledger attestor
//! - [`dispatch`]: HTTP code-host dispatcher
//! - [`client`]: client side of the API, used by `thought-broker submit`

pub mod api;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod ledger;
pub mod models;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use deliberation::{
    AuditLogger, DispatchTarget, Integrations, LoopManager, LoopRegistry, ModelClient, VoiceId,
};
use tracing::{info, warn};

use config::BrokerConfig;
use dispatch::HttpDispatcher;
use ledger::HttpLedgerAttestor;
use models::{HttpModelClient, ScriptedVoices};

/// Build the collaborator set described by `config`.
pub fn build_integrations(config: &BrokerConfig) -> Result<Integrations> {
    let timeout = config.policy().call_timeout();

    let model: Arc<dyn ModelClient> = match &config.model.url {
        Some(url) => {
            let models: HashMap<VoiceId, String> = VoiceId::ALL
                .into_iter()
                .filter_map(|v| config.model.model_for(v).map(|m| (v, m.to_string())))
                .collect();
            if models.len() < VoiceId::ALL.len() {
                warn!(configured = models.len(), "Not every voice has a model; unconfigured voices will fail");
            }
            info!(url = %url, "Using HTTP model voices");
            Arc::new(
                HttpModelClient::new(url, config.model.api_key.clone(), models, timeout)
                    .context("Failed to build model client")?,
            )
        }
        None => {
            info!("No model URL configured, using scripted voices");
            Arc::new(ScriptedVoices)
        }
    };

    let ledger = HttpLedgerAttestor::new(&config.ledger.base_url, config.ledger.token.clone(), timeout)
        .context("Failed to build ledger client")?;
    let mut integrations = Integrations::new(model).with_ledger(Arc::new(ledger));

    if let Some((url, token, repo)) = config.dispatch_target() {
        let dispatcher = HttpDispatcher::new(url, token.to_string(), timeout)
            .context("Failed to build dispatch client")?;
        integrations = integrations.with_dispatcher(
            Arc::new(dispatcher),
            DispatchTarget {
                repo: repo.to_string(),
            },
        );
    } else if config.policy.allow_dispatch {
        warn!("allowDispatch is set but no dispatcher is configured; dispatch will be skipped");
    }

    Ok(integrations)
}

/// Build the loop manager for `config`.
pub fn build_manager(config: &BrokerConfig) -> Result<LoopManager> {
    let integrations = build_integrations(config)?;
    let audit = AuditLogger::new(config.audit_level).shared();
    LoopManager::with_parts(
        config.policy(),
        integrations,
        Arc::new(LoopRegistry::new()),
        audit,
    )
    .context("Failed to build loop manager")
}

/// Serve the API until the process is stopped.
pub async fn serve(config: BrokerConfig) -> Result<()> {
    config.validate()?;
    let manager = Arc::new(build_manager(&config)?);
    let router = api::build_router(manager);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(
        bind = %config.bind,
        max_loops = config.policy.max_loops,
        tau = config.policy.tau,
        allow_dispatch = config.policy.allow_dispatch,
        "thought-broker listening"
    );
    axum::serve(listener, router).await.context("Server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_config_builds() {
        let manager = build_manager(&BrokerConfig::default()).unwrap();
        assert_eq!(manager.policy().max_loops, 3);
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut config = BrokerConfig::default();
        config.policy.max_loops = 0;
        assert!(build_manager(&config).is_err());
    }
}
