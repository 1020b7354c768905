use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

use voice_relay::voice::{LinkEvent, RemoteLink};
use voice_relay::RelayConfig;

#[derive(Debug, Parser)]
#[command(name = "voice-relay")]
#[command(about = "Operator tools for the call-to-agent voice relay")]
struct Cli {
    /// Config file (default: ~/.voice-relay/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Handshake with the agent, print the conversation id and disconnect.
    Probe {
        /// Keep the link open this long, answering keep-alives, before
        /// disconnecting.
        #[arg(long, default_value_t = 0)]
        hold_secs: u64,
    },
    /// Print the effective configuration with the credential masked.
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::load(cli.config.as_deref())?;
    init_tracing(&config.log_filter);

    match cli.command {
        Command::Config => {
            let rendered = toml::to_string_pretty(&config.masked())
                .context("Failed to render config")?;
            print!("{rendered}");
            Ok(())
        }
        Command::Probe { hold_secs } => probe(&config, Duration::from_secs(hold_secs)).await,
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339())
        .with_target(true)
        .try_init()
        .ok();
}

async fn probe(config: &RelayConfig, hold: Duration) -> Result<()> {
    config.validate()?;
    let link = RemoteLink::new(config.link_settings(), config.http_client()?);
    let mut events = link
        .connect()
        .await
        .context("Failed to connect to the agent")?;

    let timeout = Duration::from_secs(config.handshake_timeout_secs);
    let mut open = true;
    match await_conversation(&mut events, timeout).await {
        Handshake::Announced(id) => println!("conversation_id: {id}"),
        Handshake::TimedOut => {
            println!("conversation_id: <not announced within {}s>", timeout.as_secs())
        }
        Handshake::Closed(reason) => {
            println!("link closed by agent: {reason}");
            open = false;
        }
    }

    if open {
        let deadline = tokio::time::sleep(hold);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Some(LinkEvent::Closed { reason }) => {
                        println!("link closed by agent: {reason}");
                        break;
                    }
                    Some(event) => print_event(event),
                    None => break,
                },
            }
        }
    }

    link.disconnect().await;
    let stats = link.stats();
    println!(
        "audio_received: {}  pongs_sent: {}  malformed: {}",
        stats.audio_received, stats.pongs_sent, stats.malformed
    );
    Ok(())
}

/// How the wait for the conversation id ended.
#[derive(Debug, PartialEq, Eq)]
enum Handshake {
    Announced(String),
    TimedOut,
    Closed(String),
}

/// Wait for the conversation id while draining every other event, so agent
/// audio arriving first never fills the event buffer.
async fn await_conversation(
    events: &mut mpsc::Receiver<LinkEvent>,
    timeout: Duration,
) -> Handshake {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return Handshake::TimedOut,
            event = events.recv() => match event {
                Some(LinkEvent::ConversationStarted(id)) => return Handshake::Announced(id),
                Some(LinkEvent::Closed { reason }) => return Handshake::Closed(reason),
                Some(event) => print_event(event),
                None => return Handshake::Closed("event stream ended".into()),
            },
        }
    }
}

fn print_event(event: LinkEvent) {
    if let LinkEvent::AgentResponse(text) = event {
        println!("agent: {text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn conversation_id_behind_a_full_buffer_is_seen() {
        let (tx, mut rx) = mpsc::channel(4);
        let producer = tokio::spawn(async move {
            for _ in 0..32 {
                tx.send(LinkEvent::Audio(vec![0; 8])).await.unwrap();
            }
            tx.send(LinkEvent::ConversationStarted("conv-7".into()))
                .await
                .unwrap();
        });

        let outcome = await_conversation(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(outcome, Handshake::Announced("conv-7".into()));
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out() {
        let (_tx, mut rx) = mpsc::channel::<LinkEvent>(4);
        let outcome = await_conversation(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(outcome, Handshake::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_during_handshake_is_reported() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(LinkEvent::Closed {
            reason: "reset".into(),
        })
        .await
        .unwrap();
        let outcome = await_conversation(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(outcome, Handshake::Closed("reset".into()));
    }
}
