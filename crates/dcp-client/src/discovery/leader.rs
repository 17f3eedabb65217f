//! Monotonic leader selection and membership assignment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Heartbeat, ServiceDiscovery};
use crate::bus::{BusEvent, EventBus, MEMBERSHIP_CHANGED};
use crate::config::LeaderElectionConfig;
use crate::membership::Membership;

/// Orders live members by join time and publishes this member's
/// `(member_number, total_members)` assignment whenever it changes.
///
/// The member with the earliest live join timestamp is the leader. Every
/// member observes the same heartbeats, so the ordering and the derived
/// assignment are the same everywhere without an extra broadcast.
pub struct LeaderElection {
    config: LeaderElectionConfig,
    discovery: Arc<ServiceDiscovery>,
    bus: Arc<EventBus>,
    leader: Arc<AtomicBool>,
    last_published: Arc<Mutex<Option<Membership>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl LeaderElection {
    /// Creates a stopped election.
    #[must_use]
    pub fn new(
        config: LeaderElectionConfig,
        discovery: Arc<ServiceDiscovery>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            discovery,
            bus,
            leader: Arc::new(AtomicBool::new(false)),
            last_published: Arc::new(Mutex::new(None)),
            cancel: Mutex::new(None),
        }
    }

    /// Computes `(membership, is_leader)` for `member_id` from the live
    /// member list, ordering by `(joined_at_ms, member_id)`.
    fn assign(member_id: &str, mut members: Vec<Heartbeat>) -> Option<(Membership, bool)> {
        members.sort_by(|a, b| {
            a.joined_at_ms
                .cmp(&b.joined_at_ms)
                .then_with(|| a.member_id.cmp(&b.member_id))
        });

        let position = members.iter().position(|m| m.member_id == member_id)?;
        #[allow(clippy::cast_possible_truncation)]
        let membership = Membership {
            member_number: position as u32 + 1,
            total_members: members.len() as u32,
        };
        Some((membership, position == 0))
    }

    /// Starts the election loop; each tick reads the live member list and
    /// publishes `membership.changed` when the assignment moved.
    pub fn start(&self) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let member_id = self.config.member_id.clone();
        let interval = self.config.heartbeat_interval;
        let discovery = Arc::clone(&self.discovery);
        let bus = Arc::clone(&self.bus);
        let leader = Arc::clone(&self.leader);
        let last_published = Arc::clone(&self.last_published);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let members = discovery.members();
                        let Some((membership, is_leader)) =
                            Self::assign(&member_id, members)
                        else {
                            debug!("local member missing from live set");
                            continue;
                        };

                        let was_leader = leader.swap(is_leader, Ordering::SeqCst);
                        if is_leader && !was_leader {
                            info!("elected as leader");
                        }

                        let mut last = last_published.lock();
                        if *last != Some(membership) {
                            info!(membership = %membership, "publishing membership");
                            *last = Some(membership);
                            drop(last);
                            bus.publish(
                                MEMBERSHIP_CHANGED,
                                &BusEvent::MembershipChanged(membership),
                            );
                        }
                    }
                }
            }
        });

        info!("leader election started");
    }

    /// Stops the election loop. Idempotent.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
            info!("leader election stopped");
        }
    }

    /// `true` while this member holds the earliest live join timestamp.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(member_id: &str, joined_at_ms: i64) -> Heartbeat {
        Heartbeat {
            member_id: member_id.into(),
            joined_at_ms,
            sent_at_ms: joined_at_ms,
        }
    }

    #[test]
    fn test_assign_orders_by_join_time() {
        let members = vec![
            heartbeat("c", 300),
            heartbeat("a", 100),
            heartbeat("b", 200),
        ];

        let (membership, is_leader) = LeaderElection::assign("a", members.clone()).unwrap();
        assert_eq!(membership, Membership { member_number: 1, total_members: 3 });
        assert!(is_leader);

        let (membership, is_leader) = LeaderElection::assign("c", members).unwrap();
        assert_eq!(membership, Membership { member_number: 3, total_members: 3 });
        assert!(!is_leader);
    }

    #[test]
    fn test_assign_ties_break_on_member_id() {
        let members = vec![heartbeat("b", 100), heartbeat("a", 100)];
        let (membership, is_leader) = LeaderElection::assign("a", members).unwrap();
        assert_eq!(membership.member_number, 1);
        assert!(is_leader);
    }

    #[test]
    fn test_assign_unknown_member() {
        let members = vec![heartbeat("a", 100)];
        assert!(LeaderElection::assign("z", members).is_none());
    }

    #[test]
    fn test_assign_single_member() {
        let members = vec![heartbeat("only", 42)];
        let (membership, is_leader) = LeaderElection::assign("only", members).unwrap();
        assert_eq!(membership, Membership::SINGLE);
        assert!(is_leader);
    }
}
