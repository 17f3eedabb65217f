//! Peer table maintenance: heartbeating out, serving heartbeats in, and
//! deadline-based eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Heartbeat, HeartbeatHandler, HeartbeatTransport};
use crate::config::LeaderElectionConfig;

#[derive(Debug, Clone)]
struct PeerState {
    heartbeat: Heartbeat,
    last_seen: Instant,
}

/// Tracks the live peers of this member.
pub struct ServiceDiscovery {
    config: LeaderElectionConfig,
    transport: Arc<dyn HeartbeatTransport>,
    /// Join timestamp of this process; fixed so leader ordering is stable.
    joined_at_ms: i64,
    peers: Arc<Mutex<HashMap<String, PeerState>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ServiceDiscovery {
    /// Creates a discovery with its join timestamp taken now.
    #[must_use]
    pub fn new(config: LeaderElectionConfig, transport: Arc<dyn HeartbeatTransport>) -> Self {
        Self {
            config,
            transport,
            joined_at_ms: chrono::Utc::now().timestamp_millis(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            cancel: Mutex::new(None),
        }
    }

    /// This member's heartbeat, stamped now.
    fn local_heartbeat(member_id: &str, joined_at_ms: i64) -> Heartbeat {
        Heartbeat {
            member_id: member_id.to_string(),
            joined_at_ms,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn record_peer(
        peers: &Mutex<HashMap<String, PeerState>>,
        local_member_id: &str,
        heartbeat: Heartbeat,
    ) {
        if heartbeat.member_id == local_member_id {
            return;
        }
        let mut peers = peers.lock();
        peers.insert(
            heartbeat.member_id.clone(),
            PeerState {
                heartbeat,
                last_seen: Instant::now(),
            },
        );
    }

    /// Starts the heartbeat listener and the periodic sender.
    pub fn start_heartbeat(&self) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let member_id = self.config.member_id.clone();
        let joined_at_ms = self.joined_at_ms;

        // Listener: record the sender, answer with the local heartbeat.
        let handler: HeartbeatHandler = {
            let peers = Arc::clone(&self.peers);
            let member_id = member_id.clone();
            Arc::new(move |incoming: Heartbeat| {
                Self::record_peer(&peers, &member_id, incoming);
                Self::local_heartbeat(&member_id, joined_at_ms)
            })
        };
        let transport = Arc::clone(&self.transport);
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.serve(handler, serve_cancel).await {
                warn!(error = %e, "heartbeat listener stopped");
            }
        });

        // Sender: exchange with every configured peer each interval.
        let transport = Arc::clone(&self.transport);
        let peers = Arc::clone(&self.peers);
        let addresses = self.config.peers.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for address in &addresses {
                            let heartbeat = Self::local_heartbeat(&member_id, joined_at_ms);
                            match transport.exchange(address, heartbeat).await {
                                Ok(response) => {
                                    Self::record_peer(&peers, &member_id, response);
                                }
                                Err(e) => {
                                    warn!(peer = %address, error = %e, "heartbeat failed");
                                }
                            }
                        }
                    }
                }
            }
        });

        info!(peers = self.config.peers.len(), "heartbeat started");
    }

    /// Stops heartbeating. Idempotent.
    pub fn stop_heartbeat(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
            info!("heartbeat stopped");
        }
    }

    /// Live members including this one: peers silent longer than the
    /// configured deadline are evicted first.
    #[must_use]
    pub fn members(&self) -> Vec<Heartbeat> {
        let deadline = self.config.heartbeat_deadline;
        let mut peers = self.peers.lock();
        peers.retain(|member_id, state| {
            let live = state.last_seen.elapsed() <= deadline;
            if !live {
                warn!(member_id = %member_id, "peer evicted, heartbeat deadline exceeded");
            }
            live
        });

        let mut members: Vec<Heartbeat> = peers.values().map(|p| p.heartbeat.clone()).collect();
        members.push(Self::local_heartbeat(&self.config.member_id, self.joined_at_ms));
        members
    }
}
