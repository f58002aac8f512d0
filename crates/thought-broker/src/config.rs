//! Broker configuration.
//!
//! Resolved in layers, later layers winning: built-in defaults, an optional
//! TOML file, environment variables, then CLI flags (applied by `main`).

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use deliberation::{AuditLevel, Policy, VoiceId};
use serde::{Deserialize, Serialize};

/// Loop policy as written in the TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    pub max_loops: u32,
    pub tau: f64,
    pub max_seconds: u64,
    pub allow_dispatch: bool,
    pub call_timeout_secs: u64,
}

impl Default for PolicySection {
    fn default() -> Self {
        Policy::default().into()
    }
}

impl From<Policy> for PolicySection {
    fn from(p: Policy) -> Self {
        Self {
            max_loops: p.max_loops,
            tau: p.tau,
            max_seconds: p.max_seconds,
            allow_dispatch: p.allow_dispatch,
            call_timeout_secs: p.call_timeout_secs,
        }
    }
}

impl From<&PolicySection> for Policy {
    fn from(s: &PolicySection) -> Self {
        Self {
            max_loops: s.max_loops,
            tau: s.tau,
            max_seconds: s.max_seconds,
            allow_dispatch: s.allow_dispatch,
            call_timeout_secs: s.call_timeout_secs,
        }
    }
}

/// Ledger attestation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerSection {
    pub base_url: String,
    pub token: Option<String>,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_string(),
            token: None,
        }
    }
}

/// Code-host dispatch endpoint. Unavailable unless a token is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSection {
    pub url: Option<String>,
    pub token: Option<String>,
    pub repo: Option<String>,
}

/// OpenAI-compatible model endpoint. Without a URL the offline scripted
/// voices are used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSection {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub voice_a: Option<String>,
    pub voice_b: Option<String>,
    pub voice_c: Option<String>,
}

impl ModelSection {
    /// Upstream model name configured for a voice.
    pub fn model_for(&self, voice: VoiceId) -> Option<&str> {
        match voice {
            VoiceId::OaaLlmA => self.voice_a.as_deref(),
            VoiceId::OaaLlmB => self.voice_b.as_deref(),
            VoiceId::OaaLlmC => self.voice_c.as_deref(),
        }
    }
}

/// Complete broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub bind: String,
    pub audit_level: AuditLevel,
    pub policy: PolicySection,
    pub ledger: LedgerSection,
    pub dispatch: DispatchSection,
    pub model: ModelSection,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            audit_level: AuditLevel::Info,
            policy: PolicySection::default(),
            ledger: LedgerSection::default(),
            dispatch: DispatchSection::default(),
            model: ModelSection::default(),
        }
    }
}

impl BrokerConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = parsed(&get, "BROKER_MAX_LOOPS")? {
            self.policy.max_loops = v;
        }
        if let Some(v) = parsed(&get, "BROKER_SCORE_TAU")? {
            self.policy.tau = v;
        }
        if let Some(v) = parsed(&get, "BROKER_MAX_SECONDS")? {
            self.policy.max_seconds = v;
        }
        if let Some(v) = parsed(&get, "BROKER_CALL_TIMEOUT_SECS")? {
            self.policy.call_timeout_secs = v;
        }
        if let Some(v) = get("ALLOW_DISPATCH") {
            self.policy.allow_dispatch = parse_flag("ALLOW_DISPATCH", &v)?;
        }
        if let Some(v) = get("BROKER_AUDIT_LEVEL") {
            self.audit_level = v
                .parse()
                .map_err(|e: String| anyhow::anyhow!("BROKER_AUDIT_LEVEL: {}", e))?;
        }

        if let Some(bind) = get("BROKER_BIND") {
            self.bind = bind;
        } else if let Some(port) = parsed::<u16, _>(&get, "PORT")? {
            self.bind = format!("0.0.0.0:{}", port);
        }

        if let Some(v) = get("LEDGER_BASE_URL") {
            self.ledger.base_url = v;
        }
        set_opt(&mut self.ledger.token, get("LEDGER_ADMIN_TOKEN"));
        set_opt(&mut self.dispatch.url, get("DISPATCH_API_URL"));
        set_opt(&mut self.dispatch.token, get("DISPATCH_API_TOKEN"));
        set_opt(&mut self.dispatch.repo, get("DISPATCH_REPO"));
        set_opt(&mut self.model.url, get("BROKER_MODEL_URL"));
        set_opt(&mut self.model.api_key, get("BROKER_MODEL_API_KEY"));
        set_opt(&mut self.model.voice_a, get("BROKER_MODEL_A"));
        set_opt(&mut self.model.voice_b, get("BROKER_MODEL_B"));
        set_opt(&mut self.model.voice_c, get("BROKER_MODEL_C"));
        Ok(())
    }

    pub fn policy(&self) -> Policy {
        Policy::from(&self.policy)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.policy().validate().context("Invalid loop policy")?;
        if self.bind.parse::<std::net::SocketAddr>().is_err() {
            bail!("Invalid bind address '{}'", self.bind);
        }
        if self.dispatch.token.is_some() && self.dispatch.url.is_none() {
            bail!("DISPATCH_API_TOKEN is set but DISPATCH_API_URL is not");
        }
        Ok(())
    }

    /// `(url, token, repo)` when all three dispatch settings are present.
    pub fn dispatch_target(&self) -> Option<(&str, &str, &str)> {
        match (&self.dispatch.url, &self.dispatch.token, &self.dispatch.repo) {
            (Some(url), Some(token), Some(repo)) => Some((url, token, repo)),
            _ => None,
        }
    }
}

fn set_opt(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}

fn parsed<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}={:?}: {}", key, raw, e)),
        None => Ok(None),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("{}={:?} is not a boolean", key, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.policy(), Policy::default());
        assert_eq!(config.ledger.base_url, "http://localhost:4000");
        assert!(config.dispatch_target().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BrokerConfig::default();
        config
            .apply_env(env(&[
                ("BROKER_MAX_LOOPS", "5"),
                ("BROKER_SCORE_TAU", "0.95"),
                ("ALLOW_DISPATCH", "true"),
                ("BROKER_AUDIT_LEVEL", "debug"),
                ("PORT", "9090"),
                ("LEDGER_ADMIN_TOKEN", "ledger-admin"),
                ("BROKER_MODEL_B", "qwen"),
            ]))
            .unwrap();
        assert_eq!(config.policy.max_loops, 5);
        assert!((config.policy.tau - 0.95).abs() < f64::EPSILON);
        assert!(config.policy.allow_dispatch);
        assert_eq!(config.audit_level, AuditLevel::Debug);
        assert_eq!(config.bind, "0.0.0.0:9090");
        assert_eq!(config.ledger.token.as_deref(), Some("ledger-admin"));
        assert_eq!(config.model.model_for(VoiceId::OaaLlmB), Some("qwen"));
        assert_eq!(config.model.model_for(VoiceId::OaaLlmA), None);
    }

    #[test]
    fn test_bind_beats_port() {
        let mut config = BrokerConfig::default();
        config
            .apply_env(env(&[("BROKER_BIND", "127.0.0.1:7000"), ("PORT", "9090")]))
            .unwrap();
        assert_eq!(config.bind, "127.0.0.1:7000");
    }

    #[test]
    fn test_bad_env_values_rejected() {
        let mut config = BrokerConfig::default();
        assert!(config.apply_env(env(&[("BROKER_MAX_LOOPS", "many")])).is_err());
        assert!(config.apply_env(env(&[("ALLOW_DISPATCH", "maybe")])).is_err());
        assert!(config.apply_env(env(&[("BROKER_AUDIT_LEVEL", "loud")])).is_err());
    }

    #[test]
    fn test_empty_env_values_ignored() {
        let mut config = BrokerConfig::default();
        config
            .apply_env(env(&[("BROKER_MAX_LOOPS", ""), ("LEDGER_BASE_URL", "  ")]))
            .unwrap();
        assert_eq!(config.policy.max_loops, 3);
        assert_eq!(config.ledger.base_url, "http://localhost:4000");
    }

    #[test]
    fn test_toml_then_env() {
        let mut config = BrokerConfig::from_toml(
            r#"
            bind = "127.0.0.1:8181"
            audit_level = "warn"

            [policy]
            max_loops = 4
            max_seconds = 10

            [dispatch]
            url = "https://dispatch.example"
            token = "t"
            repo = "org/api-library"
            "#,
        )
        .unwrap();
        assert_eq!(config.policy.max_loops, 4);
        assert!((config.policy.tau - 0.92).abs() < f64::EPSILON);
        assert_eq!(config.audit_level, AuditLevel::Warn);
        assert_eq!(
            config.dispatch_target(),
            Some(("https://dispatch.example", "t", "org/api-library"))
        );

        config.apply_env(env(&[("BROKER_MAX_LOOPS", "2")])).unwrap();
        assert_eq!(config.policy.max_loops, 2);
        assert_eq!(config.policy.max_seconds, 10);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(BrokerConfig::from_toml("max_loops = 3").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = BrokerConfig::default();
        config.policy.tau = 0.4;
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.bind = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.dispatch.token = Some("t".to_string());
        assert!(config.validate().is_err());
    }
}
