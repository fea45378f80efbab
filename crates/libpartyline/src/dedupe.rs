use std::sync::Arc;
use std::time::{Duration, Instant};

use partyline_protocol::ServerMessage;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::merge::{self, PromptMerger};
use crate::process::LineChannel;
use crate::registry::PeerRegistry;

/// One prompt waiting in the debounce queue.
#[derive(Debug, Clone)]
pub struct PendingPrompt {
    pub user: String,
    pub text: String,
    pub at: Instant,
}

const POLL_INTERVAL: Duration = Duration::from_millis(500);

struct QueueState {
    pending: Vec<PendingPrompt>,
    last_submit: Option<Instant>,
}

/// Batch-mode prompt pipeline. Submissions accumulate until the party has
/// been quiet for the debounce window and the agent is ready; the cut batch
/// is merged (collaborator or local fallback) and forwarded as one prompt.
pub struct DedupePipeline {
    registry: Arc<PeerRegistry>,
    channel: Arc<LineChannel>,
    merger: Arc<dyn PromptMerger>,
    credentials: Arc<CredentialStore>,
    window: Duration,
    min_prompts: usize,
    poll_interval: Duration,
    queue: Mutex<QueueState>,
    history: Mutex<Vec<String>>,
}

impl DedupePipeline {
    pub fn new(
        registry: Arc<PeerRegistry>,
        channel: Arc<LineChannel>,
        merger: Arc<dyn PromptMerger>,
        credentials: Arc<CredentialStore>,
        window: Duration,
        min_prompts: usize,
    ) -> Self {
        Self {
            registry,
            channel,
            merger,
            credentials,
            window,
            min_prompts,
            poll_interval: POLL_INTERVAL,
            queue: Mutex::new(QueueState {
                pending: Vec::new(),
                last_submit: None,
            }),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Shorten the poll tick, mainly for tests with sub-second windows.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Queue one prompt and restart the quiet-period clock. Blank text is
    /// dropped without side effects.
    pub async fn submit(&self, user: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        {
            let mut queue = self.queue.lock().await;
            queue.pending.push(PendingPrompt {
                user: user.to_string(),
                text: text.to_string(),
                at: Instant::now(),
            });
            queue.last_submit = Some(Instant::now());
        }
        self.registry
            .broadcast(&ServerMessage::System {
                message: format!("received prompt from {user}"),
            })
            .await;
    }

    /// Everything the pipeline has merged so far, oldest first.
    pub async fn merged_history(&self) -> Vec<String> {
        self.history.lock().await.clone()
    }

    /// Poll loop: cut a batch whenever the queue is non-empty, the window
    /// has elapsed since the last submission, and the agent is ready.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                // cancelled wholesale on shutdown, including a merge that
                // is still in flight
                _ = async {
                    interval.tick().await;
                    self.maybe_cut().await;
                } => {}
            }
        }
        debug!("debounce loop stopped");
    }

    async fn maybe_cut(&self) {
        if !self.channel.is_ready() {
            return;
        }
        let batch = {
            let mut queue = self.queue.lock().await;
            let due = match queue.last_submit {
                Some(at) => at.elapsed() >= self.window,
                None => false,
            };
            if queue.pending.is_empty() || !due {
                return;
            }
            // atomic swap: a concurrent submit lands in the next batch
            queue.last_submit = None;
            std::mem::take(&mut queue.pending)
        };
        if batch.len() < self.min_prompts {
            debug!(
                "discarding batch of {} below minimum {}",
                batch.len(),
                self.min_prompts
            );
            return;
        }
        self.merge_and_forward(batch).await;
    }

    async fn merge_and_forward(&self, batch: Vec<PendingPrompt>) {
        let merged = match self.credentials.get() {
            Some(key) => match self.merger.merge(&key, &batch).await {
                Ok(text) => text,
                Err(err) => {
                    if err.is_auth_rejection() {
                        self.credentials.invalidate();
                        warn!("collaborator credential invalidated: {err}");
                    }
                    self.registry
                        .broadcast(&ServerMessage::Error {
                            message: format!("prompt merge failed: {err}"),
                        })
                        .await;
                    return;
                }
            },
            None => merge::merge_fallback(&batch),
        };
        if merged.trim().is_empty() {
            return;
        }

        info!("forwarding merged prompt from {} submission(s)", batch.len());
        self.history.lock().await.push(merged.clone());
        self.registry
            .broadcast(&ServerMessage::DedupedPrompt {
                text: merged.clone(),
            })
            .await;
        if let Err(err) = self.channel.submit(&merged).await {
            self.registry
                .broadcast(&ServerMessage::Error {
                    message: format!("failed to run merged prompt: {err}"),
                })
                .await;
        }
    }
}
