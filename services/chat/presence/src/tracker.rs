//! Presence tracker with liveness sweep.

use crate::PresenceConfig;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Observed status of one peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerStatus {
    /// Whether the peer is currently considered online
    pub online: bool,
    /// Wall clock of the last heartbeat received (ms since epoch).
    /// Frozen at the final heartbeat when the peer goes offline.
    pub last_seen_at: i64,
}

/// A presence transition, emitted once per edge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// Peer that transitioned
    pub user_id: String,
    /// New online state
    pub online: bool,
    /// Last heartbeat wall clock (ms since epoch)
    pub last_seen_at: i64,
}

#[derive(Debug)]
struct PeerState {
    online: bool,
    last_seen_at: i64,
    last_beat: Instant,
    /// When the peer went offline, for pruning
    offline_since: Option<Instant>,
}

/// Tracks peer liveness from heartbeats.
///
/// `start` spawns the sweep task; the handle aborts it on drop.
pub struct PresenceTracker {
    config: PresenceConfig,
    peers: Arc<DashMap<String, PeerState>>,
    update_tx: broadcast::Sender<PresenceUpdate>,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    /// Create a tracker with the given timing configuration
    pub fn new(config: PresenceConfig) -> Self {
        let (update_tx, _) = broadcast::channel(64);
        Self {
            config,
            peers: Arc::new(DashMap::new()),
            update_tx,
            sweep_task: std::sync::Mutex::new(None),
        }
    }

    /// Subscribe to presence transitions
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.update_tx.subscribe()
    }

    /// Record a heartbeat from `user_id`. An offline or unknown peer
    /// transitions to online and notifies subscribers once.
    pub fn record_heartbeat(&self, user_id: &str) {
        let now_ms = chat_wire::now_millis();
        let mut came_online = false;

        {
            let mut entry = self.peers.entry(user_id.to_string()).or_insert_with(|| {
                came_online = true;
                PeerState {
                    online: true,
                    last_seen_at: now_ms,
                    last_beat: Instant::now(),
                    offline_since: None,
                }
            });
            if !entry.online {
                entry.online = true;
                entry.offline_since = None;
                came_online = true;
            }
            entry.last_seen_at = now_ms;
            entry.last_beat = Instant::now();
        }

        if came_online {
            info!("Peer {} is online", user_id);
            let _ = self.update_tx.send(PresenceUpdate {
                user_id: user_id.to_string(),
                online: true,
                last_seen_at: now_ms,
            });
        }
    }

    /// Mark a peer offline immediately (graceful disconnect). No-op if
    /// already offline.
    pub fn mark_offline(&self, user_id: &str) {
        let mut went_offline = None;
        if let Some(mut entry) = self.peers.get_mut(user_id) {
            if entry.online {
                entry.online = false;
                entry.offline_since = Some(Instant::now());
                went_offline = Some(entry.last_seen_at);
            }
        }
        if let Some(last_seen_at) = went_offline {
            info!("Peer {} is offline (explicit)", user_id);
            let _ = self.update_tx.send(PresenceUpdate {
                user_id: user_id.to_string(),
                online: false,
                last_seen_at,
            });
        }
    }

    /// Current status of a peer, if known
    pub fn status(&self, user_id: &str) -> Option<PeerStatus> {
        self.peers.get(user_id).map(|e| PeerStatus {
            online: e.online,
            last_seen_at: e.last_seen_at,
        })
    }

    /// Whether a peer is currently online
    pub fn is_online(&self, user_id: &str) -> bool {
        self.peers.get(user_id).map(|e| e.online).unwrap_or(false)
    }

    /// All known peers and their status
    pub fn snapshot(&self) -> Vec<(String, PeerStatus)> {
        self.peers
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    PeerStatus {
                        online: e.value().online,
                        last_seen_at: e.value().last_seen_at,
                    },
                )
            })
            .collect()
    }

    /// Start the liveness sweep. Idempotent.
    pub fn start(&self) {
        let mut guard = match self.sweep_task.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }

        let config = self.config.clone();
        let peers = self.peers.clone();
        let update_tx = self.update_tx.clone();

        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                Self::sweep(&config, &peers, &update_tx);
            }
        }));
    }

    /// One sweep pass: expire silent peers, prune long-offline ones
    fn sweep(
        config: &PresenceConfig,
        peers: &DashMap<String, PeerState>,
        update_tx: &broadcast::Sender<PresenceUpdate>,
    ) {
        let offline_after = config.offline_after();
        let mut expired = Vec::new();
        let mut pruned = Vec::new();

        for mut entry in peers.iter_mut() {
            if entry.online && entry.last_beat.elapsed() >= offline_after {
                entry.online = false;
                entry.offline_since = Some(Instant::now());
                expired.push((entry.key().clone(), entry.last_seen_at));
            } else if !entry.online {
                if let Some(since) = entry.offline_since {
                    if since.elapsed() >= config.prune_after {
                        pruned.push(entry.key().clone());
                    }
                }
            }
        }

        for (user_id, last_seen_at) in expired {
            info!("Peer {} is offline (heartbeat silence)", user_id);
            let _ = update_tx.send(PresenceUpdate {
                user_id,
                online: false,
                last_seen_at,
            });
        }

        for user_id in pruned {
            debug!("Pruning long-offline peer {}", user_id);
            peers.remove(&user_id);
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sweep_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}
