use std::collections::HashMap;
use std::time::SystemTime;

use partyline_protocol::ServerMessage;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Capacity of each peer's outbound queue. A peer that stops draining gets
/// its sends rejected and is pruned on the next sweep, same as a closed one.
pub const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug)]
struct Peer {
    tx: mpsc::Sender<String>,
    joined_at: SystemTime,
}

/// Owns every connected peer. All other components address peers by name;
/// nothing outside this module touches a peer's outbound channel.
#[derive(Debug)]
pub struct PeerRegistry {
    main_user: String,
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new(main_user: impl Into<String>) -> Self {
        Self {
            main_user: main_user.into(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn main_user(&self) -> &str {
        &self.main_user
    }

    /// Reserve a unique name for a new peer and store its outbound sender.
    /// A blank request becomes `user`; collisions get `-2`, `-3`, ...
    /// suffixes. Returns the name actually assigned.
    pub async fn register(&self, requested: &str, tx: mpsc::Sender<String>) -> String {
        let base = requested.trim();
        let base = if base.is_empty() { "user" } else { base };
        let mut peers = self.peers.lock().await;
        let mut name = base.to_string();
        let mut n = 2;
        while peers.contains_key(&name) {
            name = format!("{base}-{n}");
            n += 1;
        }
        peers.insert(
            name.clone(),
            Peer {
                tx,
                joined_at: SystemTime::now(),
            },
        );
        name
    }

    /// Remove a peer. Safe to call for names that are already gone.
    /// Returns true if the peer was present.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.peers.lock().await.remove(name);
        if let Some(peer) = &removed
            && let Ok(elapsed) = peer.joined_at.elapsed()
        {
            debug!("peer {name} unregistered after {elapsed:?}");
        }
        removed.is_some()
    }

    /// Fan one message out to every peer. The message is serialized once;
    /// peers whose queue is closed or full are collected during the sweep
    /// and removed after it, so one dead peer never stalls the rest.
    pub async fn broadcast(&self, msg: &ServerMessage) {
        let line = match serde_json::to_string(msg) {
            Ok(line) => line,
            Err(err) => {
                warn!("dropping unserializable broadcast: {err}");
                return;
            }
        };
        log_session_event(msg);

        let mut peers = self.peers.lock().await;
        let mut dead = Vec::new();
        for (name, peer) in peers.iter() {
            if peer.tx.try_send(line.clone()).is_err() {
                dead.push(name.clone());
            }
        }
        for name in dead {
            peers.remove(&name);
            info!("pruned unreachable peer {name}");
        }
    }

    /// Send one message to a single peer by name. An unreachable peer is
    /// pruned just like in `broadcast`.
    pub async fn send_to(&self, name: &str, msg: &ServerMessage) {
        let line = match serde_json::to_string(msg) {
            Ok(line) => line,
            Err(err) => {
                warn!("dropping unserializable message for {name}: {err}");
                return;
            }
        };
        let mut peers = self.peers.lock().await;
        let dead = match peers.get(name) {
            Some(peer) => peer.tx.try_send(line).is_err(),
            None => false,
        };
        if dead {
            peers.remove(name);
            info!("pruned unreachable peer {name}");
        }
    }

    /// Roster snapshot: creator plus the sorted list of connected names.
    pub async fn participants(&self) -> ServerMessage {
        let peers = self.peers.lock().await;
        let mut users: Vec<String> = peers.keys().cloned().collect();
        users.sort();
        ServerMessage::Participants {
            main_user: self.main_user.clone(),
            users,
        }
    }

    /// Drop every outbound sender so writer tasks drain and sockets close.
    pub async fn close_all(&self) {
        self.peers.lock().await.clear();
    }
}

/// Operator-side trace of session events; peers see them as messages.
fn log_session_event(msg: &ServerMessage) {
    match msg {
        ServerMessage::System { message } => info!("[system] {message}"),
        ServerMessage::Error { message } => warn!("[error] {message}"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_chan() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(OUTBOUND_QUEUE)
    }

    #[tokio::test]
    async fn register_suffixes_collisions() {
        let registry = PeerRegistry::new("sam");
        let (tx, _rx1) = peer_chan();
        assert_eq!(registry.register("sam", tx).await, "sam");
        let (tx, _rx2) = peer_chan();
        assert_eq!(registry.register("sam", tx).await, "sam-2");
        let (tx, _rx3) = peer_chan();
        assert_eq!(registry.register("sam", tx).await, "sam-3");
    }

    #[tokio::test]
    async fn register_defaults_blank_names() {
        let registry = PeerRegistry::new("host");
        let (tx, _rx1) = peer_chan();
        assert_eq!(registry.register("   ", tx).await, "user");
        let (tx, _rx2) = peer_chan();
        assert_eq!(registry.register("", tx).await, "user-2");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() {
        let registry = PeerRegistry::new("host");
        let (tx_a, mut rx_a) = peer_chan();
        let (tx_b, mut rx_b) = peer_chan();
        registry.register("a", tx_a).await;
        registry.register("b", tx_b).await;

        registry
            .broadcast(&ServerMessage::System {
                message: "hello party".to_string(),
            })
            .await;

        let line_a = rx_a.recv().await.unwrap();
        let line_b = rx_b.recv().await.unwrap();
        assert!(line_a.contains("hello party"));
        assert_eq!(line_a, line_b);
    }

    #[tokio::test]
    async fn dead_peer_dropped_after_sweep() {
        let registry = PeerRegistry::new("host");
        let (tx_a, mut rx_a) = peer_chan();
        let (tx_b, rx_b) = peer_chan();
        registry.register("alive", tx_a).await;
        registry.register("gone", tx_b).await;
        drop(rx_b);

        registry
            .broadcast(&ServerMessage::System {
                message: "sweep".to_string(),
            })
            .await;

        assert!(rx_a.recv().await.unwrap().contains("sweep"));
        match registry.participants().await {
            ServerMessage::Participants { users, .. } => {
                assert_eq!(users, vec!["alive"]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn full_queue_counts_as_dead() {
        let registry = PeerRegistry::new("host");
        let (tx, _rx) = mpsc::channel(1);
        registry.register("slow", tx).await;

        let msg = ServerMessage::System {
            message: "tick".to_string(),
        };
        registry.broadcast(&msg).await;
        // queue now full and never drained
        registry.broadcast(&msg).await;

        match registry.participants().await {
            ServerMessage::Participants { users, .. } => assert!(users.is_empty()),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn participants_sorted_with_main_user() {
        let registry = PeerRegistry::new("sam");
        let mut rxs = Vec::new();
        for name in ["zoe", "kai", "ana"] {
            let (tx, rx) = peer_chan();
            rxs.push(rx);
            registry.register(name, tx).await;
        }
        match registry.participants().await {
            ServerMessage::Participants { main_user, users } => {
                assert_eq!(main_user, "sam");
                assert_eq!(users, vec!["ana", "kai", "zoe"]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn unregister_absent_is_harmless() {
        let registry = PeerRegistry::new("host");
        assert!(!registry.unregister("ghost").await);
        let (tx, _rx) = peer_chan();
        let name = registry.register("kai", tx).await;
        assert!(registry.unregister(&name).await);
        assert!(!registry.unregister(&name).await);
    }

    #[tokio::test]
    async fn send_to_targets_one_peer() {
        let registry = PeerRegistry::new("host");
        let (tx_a, mut rx_a) = peer_chan();
        let (tx_b, mut rx_b) = peer_chan();
        registry.register("a", tx_a).await;
        registry.register("b", tx_b).await;

        registry.send_to("a", &ServerMessage::Pong).await;

        assert!(rx_a.recv().await.unwrap().contains("pong"));
        assert!(rx_b.try_recv().is_err());
    }
}
