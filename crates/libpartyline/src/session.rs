//! The party session: one hosted agent process shared by many peers.
//!
//! A session owns the TCP accept loop, the per-connection handshake and
//! dispatch, the hosted process channel, and the ordered teardown. Frames
//! are one JSON message per line in both directions.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use partyline_protocol::{ClientMessage, Invite, MAX_LINE_BYTES, ServerMessage};
use sha2::{Digest, Sha256};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use crate::config::{PartyConfig, SessionMode};
use crate::credentials::CredentialStore;
use crate::dedupe::DedupePipeline;
use crate::error::PartyError;
use crate::merge::{GeminiMerger, PromptMerger};
use crate::process::AgentChannel;
use crate::registry::{OUTBOUND_QUEUE, PeerRegistry};
use crate::summary;

/// Per-session invite secret: 8 random bytes, hex encoded.
fn generate_secret() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

/// Compare a presented secret against the session secret through
/// fixed-width digests instead of the variable-length strings.
fn secrets_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

async fn send_direct(writer: &mut FramedWrite<OwnedWriteHalf, LinesCodec>, msg: &ServerMessage) {
    if let Ok(line) = serde_json::to_string(msg) {
        let _ = writer.send(line).await;
    }
}

/// One hosted party. Created by the host, then driven by [`PartySession::run`]
/// until the hosted process exits or a shutdown is triggered.
pub struct PartySession {
    config: PartyConfig,
    invite: Invite,
    registry: Arc<PeerRegistry>,
    credentials: Arc<CredentialStore>,
    merger: Arc<dyn PromptMerger>,
    hosted: Mutex<Option<AgentChannel>>,
    pipeline: Mutex<Option<Arc<DedupePipeline>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl PartySession {
    pub fn new(config: PartyConfig) -> Self {
        let (host, port) = config.invite_addr();
        let invite = Invite::new(host, port, generate_secret());
        let registry = Arc::new(PeerRegistry::new(config.user.clone()));
        let credentials = Arc::new(CredentialStore::from_env(config.gemini_api_key.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            invite,
            registry,
            credentials,
            merger: Arc::new(GeminiMerger::new()),
            hosted: Mutex::new(None),
            pipeline: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the merge collaborator. For embedding and tests.
    pub fn with_merger(mut self, merger: Arc<dyn PromptMerger>) -> Self {
        self.merger = merger;
        self
    }

    /// Replace the credential store built from the environment.
    pub fn with_credentials(mut self, credentials: Arc<CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn invite(&self) -> &Invite {
        &self.invite
    }

    /// Ask the session to wind down. Safe from any task, any number of times.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Serve the party on `listener` until the hosted process exits or a
    /// shutdown is triggered, then run the full teardown before returning.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("party listening on {addr}");
        }
        info!("invite code: {}", self.invite.encode());
        tokio::spawn(self.clone().accept_loop(listener));

        if let Ok(exit_rx) = self.start_hosted().await {
            let mut shutdown_rx = self.shutdown_rx.clone();
            match exit_rx {
                Some(mut exit_rx) => {
                    tokio::select! {
                        _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => {}
                        _ = async { let _ = exit_rx.wait_for(|exited| *exited).await; } => {
                            info!("hosted process exited");
                            self.registry
                                .broadcast(&ServerMessage::System {
                                    message: "agent process exited".to_string(),
                                })
                                .await;
                        }
                    }
                }
                // per-prompt batch channels have no long-lived child to watch
                None => {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                }
            }
        }
        self.shutdown().await;
    }

    /// Start the hosted process for the configured mode. On failure every
    /// connected peer hears about it before the error is returned.
    async fn start_hosted(&self) -> Result<Option<watch::Receiver<bool>>, PartyError> {
        match AgentChannel::start(&self.config, self.registry.clone()) {
            Ok(channel) => {
                let mode_label = match self.config.mode {
                    SessionMode::Interactive => "interactive",
                    SessionMode::Batch => "batch",
                };
                info!("agent started ({mode_label} mode)");
                self.registry
                    .broadcast(&ServerMessage::System {
                        message: format!("agent started ({mode_label} mode)"),
                    })
                    .await;
                let exit_rx = channel.exit_signal();
                if let AgentChannel::Line(line) = &channel {
                    let pipeline = Arc::new(DedupePipeline::new(
                        self.registry.clone(),
                        line.clone(),
                        self.merger.clone(),
                        self.credentials.clone(),
                        self.config.dedupe_window(),
                        self.config.min_prompts,
                    ));
                    tokio::spawn(pipeline.clone().run(self.shutdown_rx.clone()));
                    *self.pipeline.lock().await = Some(pipeline);
                }
                *self.hosted.lock().await = Some(channel);
                Ok(exit_rx)
            }
            Err(err) => {
                warn!("{err}");
                self.registry
                    .broadcast(&ServerMessage::Error {
                        message: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        debug!("accept loop stopping");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("connection from {addr}");
                            let session = self.clone();
                            tokio::spawn(async move {
                                session.handle_connection(stream).await;
                            });
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                        }
                    }
                }
            }
        }
    }

    /// Drive one client connection: handshake, then dispatch until the peer
    /// hangs up or the session shuts down.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader =
            FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut writer =
            FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut shutdown_rx = self.shutdown_rx.clone();

        // First frame must be a hello carrying the invite secret.
        let first = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => return,
            frame = reader.next() => frame,
        };
        let Some(Ok(first)) = first else { return };
        let requested = match serde_json::from_str::<ClientMessage>(&first) {
            Ok(ClientMessage::Hello { user, token }) => {
                if !secrets_match(&token, &self.invite.secret) {
                    debug!("rejected connection: bad token");
                    send_direct(
                        &mut writer,
                        &ServerMessage::Error {
                            message: "invalid invite".to_string(),
                        },
                    )
                    .await;
                    return;
                }
                user
            }
            _ => {
                send_direct(
                    &mut writer,
                    &ServerMessage::Error {
                        message: "missing hello".to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let writer_task = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if writer.send(line).await.is_err() {
                    break;
                }
            }
        });

        let wanted = {
            let trimmed = requested.trim();
            if trimmed.is_empty() {
                "user".to_string()
            } else {
                trimmed.to_string()
            }
        };
        let name = self.registry.register(&requested, out_tx).await;
        if name != wanted {
            self.registry
                .send_to(
                    &name,
                    &ServerMessage::System {
                        message: format!("name '{wanted}' already in use; joined as '{name}'"),
                    },
                )
                .await;
        }
        self.registry
            .send_to(
                &name,
                &ServerMessage::Invite {
                    code: self.invite.encode(),
                },
            )
            .await;
        self.registry
            .broadcast(&ServerMessage::System {
                message: format!("{name} joined"),
            })
            .await;
        let roster = self.registry.participants().await;
        self.registry.broadcast(&roster).await;

        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                frame = reader.next() => {
                    let Some(frame) = frame else { break };
                    let Ok(line) = frame else { break };
                    match serde_json::from_str::<ClientMessage>(&line) {
                        Ok(msg) => self.dispatch(&name, msg).await,
                        Err(err) => {
                            debug!("bad frame from {name}: {err}");
                            self.registry
                                .send_to(
                                    &name,
                                    &ServerMessage::Error {
                                        message: format!("invalid message: {err}"),
                                    },
                                )
                                .await;
                        }
                    }
                }
            }
        }

        // Unregister before announcing so the departed peer gets neither.
        if self.registry.unregister(&name).await {
            self.registry
                .broadcast(&ServerMessage::System {
                    message: format!("{name} left"),
                })
                .await;
            let roster = self.registry.participants().await;
            self.registry.broadcast(&roster).await;
        }
        // Registry dropped the only sender; the writer drains and exits.
        let _ = writer_task.await;
    }

    async fn dispatch(&self, name: &str, msg: ClientMessage) {
        match msg {
            ClientMessage::Hello { .. } => {
                self.registry
                    .send_to(
                        name,
                        &ServerMessage::Error {
                            message: "already joined".to_string(),
                        },
                    )
                    .await;
            }
            ClientMessage::Ping => {
                self.registry.send_to(name, &ServerMessage::Pong).await;
            }
            ClientMessage::Prompt { text } => {
                let pipeline = self.pipeline.lock().await.clone();
                match pipeline {
                    Some(pipeline) => pipeline.submit(name, &text).await,
                    None => {
                        self.registry
                            .send_to(
                                name,
                                &ServerMessage::Error {
                                    message: "prompts are not accepted in interactive mode"
                                        .to_string(),
                                },
                            )
                            .await;
                    }
                }
            }
            ClientMessage::InputBytes { data } => {
                if data.is_empty() {
                    return;
                }
                let raw = match self.hosted.lock().await.as_ref() {
                    Some(AgentChannel::Raw(raw)) => Ok(raw.clone()),
                    Some(AgentChannel::Line(_)) => Err("raw input is not accepted in batch mode"),
                    None => Err("agent process is not running"),
                };
                match raw {
                    Ok(raw) => {
                        // Write failures concern everyone, not just the sender.
                        if let Err(err) = raw.write_bytes(&data) {
                            self.registry
                                .broadcast(&ServerMessage::Error {
                                    message: err.to_string(),
                                })
                                .await;
                        }
                    }
                    Err(reason) => {
                        self.registry
                            .send_to(
                                name,
                                &ServerMessage::Error {
                                    message: reason.to_string(),
                                },
                            )
                            .await;
                    }
                }
            }
        }
    }

    /// Ordered teardown: stop accepting and debouncing, terminate the hosted
    /// process, write the summary artifact, close every connection. Runs
    /// once; later calls return immediately.
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down party session");
        let _ = self.shutdown_tx.send(true);

        let hosted = self.hosted.lock().await.take();
        if let Some(channel) = hosted {
            channel.shutdown().await;
        }

        let pipeline = self.pipeline.lock().await.clone();
        let merged = match pipeline {
            Some(pipeline) => pipeline.merged_history().await,
            None => Vec::new(),
        };
        let dir = self
            .config
            .project_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        summary::write_session_summary(&dir, &merged, self.merger.as_ref(), &self.credentials)
            .await;

        self.registry.close_all().await;
        info!("party session closed");
    }
}
