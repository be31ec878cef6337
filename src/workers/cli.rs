//! Subcommand runners: relay service, one-shot sender and receive daemon.
//!
//! Client runners connect to the relay, hand the link to an [`Engine`]
//! task and then react to its [`EngineNotice`]s. Progress lines are printed
//! from the transfer's watch channel at most every
//! [`PROGRESS_PRINT_INTERVAL`].

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::config::{PROGRESS_PRINT_INTERVAL, RELAY_RECONNECT_DELAY};
use crate::core::engine::{Engine, EngineCommand, EngineConfig, EngineExit, EngineNotice};
use crate::core::pipeline::sink::DirectorySinkFactory;
use crate::core::pipeline::source::{ChunkSource, FileChunkSource};
use crate::core::protocol::signaling::{FileDescriptor, PresenceRecord, RelayMessage};
use crate::core::relay::client::{self, RelayLink};
use crate::core::relay::server;
use crate::core::transfer::{TransferDirection, TransferState, TransferStatus};
use crate::core::transport::webrtc::WebRtcProvider;
use crate::utils::format::{format_eta, format_file_size, format_rate, short_peer_id};
use crate::utils::sos::SignalOfStop;
use crate::workers::args::{Args, ClientArgs, Command, ReceiveArgs, SendArgs};

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    match &args.command {
        Command::Relay(relay) => server::run(relay.bind(), sos).await,
        Command::Send(send) => run_send(&args, send, sos).await,
        Command::Receive(receive) => run_receive(&args, receive, sos).await,
    }
}

// ── Shared ───────────────────────────────────────────────────────────────────

struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    notices: mpsc::UnboundedReceiver<EngineNotice>,
    task: JoinHandle<Result<EngineExit>>,
}

impl EngineHandle {
    fn command(&self, cmd: EngineCommand) {
        let _ = self.commands.send(cmd);
    }

    /// Ask for shutdown, drain the remaining notices and collect the exit.
    async fn stop(mut self) -> Result<EngineExit> {
        self.command(EngineCommand::Shutdown);
        while self.notices.recv().await.is_some() {}
        self.task.await.context("engine task panicked")?
    }
}

async fn connect(client: &ClientArgs) -> Result<RelayLink> {
    ensure_relay_url(client.relay_url())?;
    let link = client::connect(client.relay_url()).await?;
    if let Some(nickname) = &client.nickname {
        let _ = link.outgoing.send(RelayMessage::NicknameUpdate {
            nickname: nickname.clone(),
        });
    }
    let name = client.nickname.as_deref().unwrap_or(&link.nickname);
    println!("Connected as {name} ({})", short_peer_id(&link.id));
    Ok(link)
}

fn start_engine(
    config: EngineConfig,
    link: RelayLink,
    out_dir: &Path,
) -> Result<EngineHandle> {
    let provider = Arc::new(WebRtcProvider::new().context("initializing WebRTC")?);
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (notice_tx, notices) = mpsc::unbounded_channel();
    let engine = Engine::new(
        config,
        link.id,
        provider,
        Arc::new(DirectorySinkFactory::new(out_dir)),
        link.outgoing,
        notice_tx,
    );
    let task = tokio::spawn(engine.run(link.incoming, command_rx));
    Ok(EngineHandle {
        commands,
        notices,
        task,
    })
}

/// Find a peer by exact identity, nickname, or identity prefix.
pub(crate) fn resolve_peer<'a>(peers: &'a [PresenceRecord], to: &str) -> Option<&'a PresenceRecord> {
    peers
        .iter()
        .find(|p| p.id == to)
        .or_else(|| peers.iter().find(|p| p.nickname == to))
        .or_else(|| {
            let mut prefixed = peers.iter().filter(|p| p.id.starts_with(to));
            match (prefixed.next(), prefixed.next()) {
                (Some(p), None) if !to.is_empty() => Some(p),
                _ => None,
            }
        })
}

pub(crate) fn progress_line(state: &TransferState) -> String {
    let arrow = match state.direction {
        TransferDirection::Outbound => "->",
        TransferDirection::Inbound => "<-",
    };
    format!(
        "{arrow} {} {:5.1}% {} / {} {} eta {}",
        state.file_name,
        state.percent(),
        format_file_size(state.bytes_moved),
        format_file_size(state.total_size),
        format_rate(state.throughput),
        format_eta(state.eta),
    )
}

pub(crate) fn status_text(status: &TransferStatus) -> String {
    match status {
        TransferStatus::InProgress => "in progress".into(),
        TransferStatus::Completed => "completed".into(),
        TransferStatus::Cancelled => "cancelled".into(),
        TransferStatus::Rejected => "rejected by peer".into(),
        TransferStatus::Failed(reason) => format!("failed: {reason}"),
    }
}

fn spawn_progress(mut progress: watch::Receiver<TransferState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_print: Option<Instant> = None;
        while progress.changed().await.is_ok() {
            let state = progress.borrow_and_update().clone();
            if state.status.is_terminal() {
                break;
            }
            if last_print.map_or(true, |t| t.elapsed() >= PROGRESS_PRINT_INTERVAL) {
                println!("{}", progress_line(&state));
                last_print = Some(Instant::now());
            }
        }
    })
}

// ── Send ─────────────────────────────────────────────────────────────────────

async fn run_send(args: &Args, send: &SendArgs, sos: SignalOfStop) -> Result<()> {
    let source = FileChunkSource::open(&send.file)
        .await
        .with_context(|| format!("opening {}", send.file.display()))?;
    let file_name = send
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("{} has no usable file name", send.file.display()))?;
    let source: Arc<dyn ChunkSource> = Arc::new(source);

    let link = connect(&send.client).await?;
    let config = EngineConfig {
        channels: send.channels(),
        ice_servers: args.ice_servers.clone(),
        ..Default::default()
    };
    let mut engine = start_engine(config, link, Path::new("."))?;

    println!("Waiting for {} ...", send.to);
    let mut target: Option<String> = None;
    let mut progress: Option<JoinHandle<()>> = None;
    let mut outcome: Result<()> = Err(anyhow!("engine stopped before the transfer ended"));

    loop {
        let notice = tokio::select! {
            _ = sos.wait() => {
                println!("Cancelling ...");
                engine.command(EngineCommand::Cancel);
                outcome = Err(anyhow!("transfer cancelled"));
                break;
            }
            notice = engine.notices.recv() => notice,
        };
        let Some(notice) = notice else {
            break;
        };
        match notice {
            EngineNotice::Peers(peers) => {
                if target.is_none() {
                    if let Some(peer) = resolve_peer(&peers, &send.to) {
                        println!(
                            "Offering {} ({}) to {}",
                            file_name,
                            format_file_size(source.size()),
                            peer.nickname
                        );
                        target = Some(peer.id.clone());
                        engine.command(EngineCommand::SendFile {
                            peer: peer.id.clone(),
                            file_name: file_name.clone(),
                            mime: String::new(),
                            source: source.clone(),
                        });
                    }
                } else if let Some(id) = &target {
                    if !peers.iter().any(|p| &p.id == id) {
                        outcome = Err(anyhow!("{} left the relay", send.to));
                        break;
                    }
                }
            }
            EngineNotice::IncomingRequest { peer, .. } => {
                engine.command(EngineCommand::Respond {
                    peer,
                    accept: false,
                });
            }
            EngineNotice::TransferStarted { progress: rx, .. } => {
                progress = Some(spawn_progress(rx));
            }
            EngineNotice::TransferFinished { state, .. } => {
                if let Some(task) = progress.take() {
                    task.abort();
                }
                println!("{}", progress_line(&state));
                match state.status {
                    TransferStatus::Completed => {
                        println!("Sent, waiting for confirmation ...");
                    }
                    status => {
                        outcome = Err(anyhow!("transfer {}", status_text(&status)));
                        break;
                    }
                }
            }
            EngineNotice::Acknowledged { .. } => {
                println!("Delivered {file_name}");
                outcome = Ok(());
                break;
            }
            EngineNotice::SessionClosed { failed, .. } => {
                outcome = Err(if failed {
                    anyhow!("connection to peer failed")
                } else {
                    anyhow!("connection closed before the file was confirmed")
                });
                break;
            }
        }
    }

    if let Some(task) = progress.take() {
        task.abort();
    }
    engine.stop().await?;
    outcome
}

// ── Receive ──────────────────────────────────────────────────────────────────

async fn run_receive(args: &Args, receive: &ReceiveArgs, sos: SignalOfStop) -> Result<()> {
    let out_dir = receive.out_dir();
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let exit = match connect(&receive.client).await {
            Ok(link) => {
                let config = EngineConfig {
                    auto_accept: receive.yes,
                    ice_servers: args.ice_servers.clone(),
                    ..Default::default()
                };
                let engine = start_engine(config, link, &out_dir)?;
                receive_loop(engine, &mut input, &sos).await?
            }
            Err(e) => {
                warn!(event = "relay_connect_failure", error = %e);
                EngineExit::RelayLost
            }
        };
        if exit == EngineExit::Shutdown || sos.cancelled() {
            return Ok(());
        }

        println!("Relay unavailable, retrying in {}s", RELAY_RECONNECT_DELAY.as_secs());
        tokio::select! {
            _ = sos.wait() => return Ok(()),
            _ = tokio::time::sleep(RELAY_RECONNECT_DELAY) => {}
        }
    }
}

async fn receive_loop(
    mut engine: EngineHandle,
    input: &mut Lines<BufReader<Stdin>>,
    sos: &SignalOfStop,
) -> Result<EngineExit> {
    println!("Waiting for files (Ctrl-C to stop) ...");
    let mut names: HashMap<String, String> = HashMap::new();
    let mut progress: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        let notice = tokio::select! {
            _ = sos.wait() => break,
            notice = engine.notices.recv() => notice,
        };
        let Some(notice) = notice else {
            break;
        };
        match notice {
            EngineNotice::Peers(peers) => {
                names = peers.into_iter().map(|p| (p.id, p.nickname)).collect();
            }
            EngineNotice::IncomingRequest { peer, file } => {
                let who = names
                    .get(&peer)
                    .cloned()
                    .unwrap_or_else(|| short_peer_id(&peer).to_string());
                let accept = prompt(input, &who, &file, sos).await;
                engine.command(EngineCommand::Respond { peer, accept });
            }
            EngineNotice::TransferStarted { peer, progress: rx } => {
                progress.insert(peer, spawn_progress(rx));
            }
            EngineNotice::TransferFinished { peer, state } => {
                if let Some(task) = progress.remove(&peer) {
                    task.abort();
                }
                println!("{}", progress_line(&state));
                println!("{}: {}", state.file_name, status_text(&state.status));
            }
            EngineNotice::SessionClosed { peer, failed } => {
                info!(event = "peer_session_closed", peer = %peer, failed);
            }
            EngineNotice::Acknowledged { .. } => {}
        }
    }

    for (_, task) in progress {
        task.abort();
    }
    engine.stop().await
}

async fn prompt(
    input: &mut Lines<BufReader<Stdin>>,
    who: &str,
    file: &FileDescriptor,
    sos: &SignalOfStop,
) -> bool {
    println!(
        "{who} wants to send {} ({}). Accept? [y/N]",
        file.name,
        format_file_size(file.size)
    );
    tokio::select! {
        _ = sos.wait() => false,
        line = input.next_line() => match line {
            Ok(Some(answer)) => is_yes(&answer),
            Ok(None) => false,
            Err(e) => {
                warn!(event = "stdin_read_failure", error = %e);
                false
            }
        },
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn ensure_relay_url(url: &str) -> Result<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        bail!("relay URL must start with ws:// or wss://, got {url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(id: &str, nickname: &str) -> PresenceRecord {
        PresenceRecord {
            id: id.into(),
            nickname: nickname.into(),
        }
    }

    #[test]
    fn resolves_by_id_nickname_then_unique_prefix() {
        let peers = vec![
            record("3f2a-1111", "otterpapaya"),
            record("3f2b-2222", "koalamango"),
            record("9c00-3333", "3f2a-1111x"),
        ];
        assert_eq!(resolve_peer(&peers, "3f2a-1111").unwrap().nickname, "otterpapaya");
        assert_eq!(resolve_peer(&peers, "koalamango").unwrap().id, "3f2b-2222");
        assert_eq!(resolve_peer(&peers, "9c").unwrap().nickname, "3f2a-1111x");
        // Ambiguous prefix.
        assert!(resolve_peer(&peers, "3f2").is_none());
        assert!(resolve_peer(&peers, "").is_none());
    }

    #[test]
    fn progress_line_shows_percent_sizes_and_eta() {
        let tracker = crate::core::transfer::TransferTracker::new(
            TransferDirection::Inbound,
            "photo.jpg",
            2048,
        );
        tracker.advance(1024);
        let mut state = tracker.snapshot();
        state.eta = Some(Duration::from_secs(125));
        let line = progress_line(&state);
        assert!(line.starts_with("<- photo.jpg  50.0%"));
        assert!(line.contains("1.00 KB / 2.00 KB"));
        assert!(line.ends_with("eta 2m05s"));
    }

    #[test]
    fn answers_and_statuses() {
        assert!(is_yes(" Y "));
        assert!(is_yes("yes"));
        assert!(!is_yes(""));
        assert!(!is_yes("nope"));
        assert!(ensure_relay_url("wss://relay.example.org").is_ok());
        assert!(ensure_relay_url("http://relay.example.org").is_err());
        assert_eq!(status_text(&TransferStatus::Rejected), "rejected by peer");
        assert_eq!(
            status_text(&TransferStatus::Failed("disk full".into())),
            "failed: disk full"
        );
    }
}
