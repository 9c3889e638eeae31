//! SOS alert agent binary.
//!
//! ```bash
//! # Poll forever (default)
//! sos-agent --config sos-agent.toml
//!
//! # One poll cycle through the engine, then wait for any scheduled call
//! sos-agent --config sos-agent.toml check
//!
//! # Direct channel sends, bypassing the episode caps
//! sos-agent test-text --to +15550000001
//! sos-agent test-call --to +15550000001
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sos_agent::channels::{TextChannel, TwilioClient, VoiceChannel};
use sos_agent::config::AgentConfig;
use sos_agent::contacts::Contact;
use sos_agent::dispatcher::AlertDispatcher;
use sos_agent::engine::SosEngine;
use sos_agent::feed::ChannelFeed;
use sos_agent::messages::{render_text, VoiceScript};
use sos_agent::poller::{PollOutcome, Poller};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file. Environment variables override it.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the telemetry channel until Ctrl-C
    Run,
    /// Run a single poll cycle and wait for any scheduled call
    Check,
    /// Send one text alert directly to a number
    TestText {
        #[arg(long)]
        to: String,
    },
    /// Place one voice call directly to a number
    TestCall {
        #[arg(long)]
        to: String,
    },
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
    let config = AgentConfig::load(cli.config.as_deref()).context("Invalid configuration")?;
    info!(
        feed = %config.telemetry.base_url,
        channel = %config.telemetry.channel_id,
        contacts = config.alerts.contacts.len(),
        period_secs = config.telemetry.poll_interval_secs,
        "SOS agent starting"
    );

    let provider = Arc::new(TwilioClient::new(&config.provider).context("Building provider client")?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config, provider).await,
        Command::Check => check(&config, provider).await,
        Command::TestText { to } => test_text(&config, provider.as_ref(), &to).await,
        Command::TestCall { to } => test_call(&config, provider.as_ref(), &to).await,
    }
}

fn build_poller(config: &AgentConfig, provider: Arc<TwilioClient>) -> Result<Poller> {
    let feed = ChannelFeed::new(&config.telemetry).context("Building telemetry client")?;
    let contacts = config.contact_list()?;
    let dispatcher = AlertDispatcher::new(provider.clone(), provider, config.dispatch_settings());
    let engine = SosEngine::new(dispatcher, contacts, config.engine_options());
    Ok(Poller::new(
        Arc::new(feed),
        Arc::new(engine),
        config.telemetry.feed_fields(),
        config.telemetry.poll_interval(),
    ))
}

async fn run(config: &AgentConfig, provider: Arc<TwilioClient>) -> Result<()> {
    let poller = build_poller(config, provider)?;
    let shutdown = CancellationToken::new();

    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received; stopping after the current cycle"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C; stopping"),
            }
            shutdown.cancel();
        })
    };

    poller.run(shutdown).await;
    ctrl_c.abort();

    let pending = poller.engine().pending_calls().await;
    if pending > 0 {
        info!(pending, "Waiting for scheduled voice calls to finish");
    }
    poller.engine().drain_pending_calls().await;
    info!("SOS agent stopped");
    Ok(())
}

async fn check(config: &AgentConfig, provider: Arc<TwilioClient>) -> Result<()> {
    let poller = build_poller(config, provider)?;

    match poller.poll_once().await {
        PollOutcome::Observed(outcome) => {
            info!(
                edge = %outcome.decision.edge,
                dispatched = outcome.decision.dispatch,
                texts = outcome.texts.len(),
                call_scheduled = outcome.call_scheduled,
                "Check cycle complete"
            );
        }
        PollOutcome::FetchFailed(e) => {
            return Err(e).context("Telemetry fetch failed");
        }
        PollOutcome::Busy => warn!("Another cycle was running; nothing checked"),
    }

    for attempt in poller.engine().drain_pending_calls().await {
        info!(
            contact = %attempt.contact,
            success = attempt.success,
            error = ?attempt.error,
            "Scheduled voice call finished"
        );
    }
    Ok(())
}

async fn test_text(config: &AgentConfig, channel: &dyn TextChannel, to: &str) -> Result<()> {
    let contact = Contact::parse(to)?;
    let body = render_text(config.alerts.fallback_location.as_ref(), Utc::now());
    let id = channel
        .send_text(&contact, &body)
        .await
        .with_context(|| format!("Test text to {contact} failed"))?;
    info!(contact = %contact, provider_id = %id, "Test text accepted");
    Ok(())
}

async fn test_call(config: &AgentConfig, channel: &dyn VoiceChannel, to: &str) -> Result<()> {
    let contact = Contact::parse(to)?;
    let script = VoiceScript::for_alert(
        config.alerts.fallback_location.as_ref(),
        &config.provider.voice,
    );
    let id = channel
        .place_voice_call(&contact, &script)
        .await
        .with_context(|| format!("Test call to {contact} failed"))?;
    info!(contact = %contact, provider_id = %id, "Test call accepted");
    Ok(())
}
