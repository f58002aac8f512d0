//! thought-broker: bounded multi-voice deliberation service.
//!
//! ```bash
//! # Serve the API (default subcommand)
//! thought-broker serve --config broker.toml
//!
//! # Run one deliberation against a running broker and write .civic/ artifacts
//! thought-broker submit --cycle C-109 --proposal-ref /proposals/ubi.md --goal "Expose UBI summary"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use deliberation::{AuditLevel, VoiceId};
use thought_broker::client::{self, BrokerClient, Submission};
use thought_broker::config::BrokerConfig;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API
    Serve(ServeArgs),
    /// Start a loop on a running broker and write its artifacts
    Submit(SubmitArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (overrides BROKER_BIND / PORT)
    #[arg(long)]
    bind: Option<String>,

    /// Round cap (overrides BROKER_MAX_LOOPS)
    #[arg(long)]
    max_loops: Option<u32>,

    /// Halt score threshold (overrides BROKER_SCORE_TAU)
    #[arg(long)]
    tau: Option<f64>,

    /// Wall-clock budget per loop in seconds (overrides BROKER_MAX_SECONDS)
    #[arg(long)]
    max_seconds: Option<u64>,

    /// Forward reached consensus to the dispatcher (overrides ALLOW_DISPATCH)
    #[arg(long)]
    allow_dispatch: Option<bool>,

    /// Audit log floor: debug, info, warn or error (overrides BROKER_AUDIT_LEVEL)
    #[arg(long)]
    audit_level: Option<AuditLevel>,
}

impl ServeArgs {
    fn apply(&self, config: &mut BrokerConfig) {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(v) = self.max_loops {
            config.policy.max_loops = v;
        }
        if let Some(v) = self.tau {
            config.policy.tau = v;
        }
        if let Some(v) = self.max_seconds {
            config.policy.max_seconds = v;
        }
        if let Some(v) = self.allow_dispatch {
            config.policy.allow_dispatch = v;
        }
        if let Some(v) = self.audit_level {
            config.audit_level = v;
        }
    }
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Broker base URL
    #[arg(long, env = "BROKER_URL", default_value = "http://localhost:8080")]
    broker_url: String,

    #[arg(long)]
    cycle: String,

    #[arg(long)]
    proposal_ref: String,

    #[arg(long)]
    spec_ref: Option<String>,

    #[arg(long)]
    tests_ref: Option<String>,

    #[arg(long)]
    goal: String,

    /// Comma-separated voices, in role order
    #[arg(long, value_delimiter = ',', default_value = "oaa-llm-a,oaa-llm-b,oaa-llm-c")]
    models: Vec<String>,

    /// Artifact output directory
    #[arg(long, default_value = ".civic")]
    out: PathBuf,

    /// HTTP timeout in seconds; a start call lasts as long as the loop
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => {
            let mut config = BrokerConfig::load(args.config.as_deref())?;
            args.apply(&mut config);
            thought_broker::serve(config).await
        }
        Command::Submit(args) => run_submit(args).await,
    }
}

async fn run_submit(args: SubmitArgs) -> Result<()> {
    let mut voices = Vec::with_capacity(args.models.len());
    for id in &args.models {
        match VoiceId::parse(id.trim()) {
            Some(v) => voices.push(v),
            None => bail!("Unknown voice '{}'", id),
        }
    }

    let broker = BrokerClient::new(&args.broker_url, Duration::from_secs(args.timeout_secs))?;
    let submission = Submission {
        cycle: args.cycle,
        proposal_ref: args.proposal_ref,
        spec_ref: args.spec_ref,
        tests_ref: args.tests_ref,
        goal: args.goal,
        voices,
    };

    let outcome = client::submit(&broker, &submission, &args.out).await?;
    info!(
        loop_id = %outcome.loop_id,
        attest_ref = outcome.attest_ref.as_deref().unwrap_or("none"),
        files = outcome.files.len(),
        out = %args.out.display(),
        "Consensus artifacts written"
    );
    Ok(())
}
