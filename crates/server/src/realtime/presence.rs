//! Presence Tracker
//!
//! A user is online while at least one live connection belongs to them.
//! The first connection flips the durable flag on and the last one flips it
//! off; both transitions are announced to the user's conversation rooms
//! (`user-presence-updated`) and to every direct-conversation counterpart
//! (`user_online` / `user_offline`).
//!
//! Liveness is kept fresh by one process-wide heartbeat tick that refreshes
//! `last_seen` for every user in the heartbeat set, and a slower sweep that
//! force-offlines users the store still believes online but who have no
//! live connection here and no recent heartbeat.
//!
//! Each user's transitions are serialized by a per-user async lock that is
//! held across the durable write and the announcement, so the stored flag
//! and the events always follow the order of the in-memory changes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::error::Result;
use crate::core::store::ChatStore;
use crate::realtime::events::ServerEvent;
use crate::realtime::rooms::{ConnectionId, RoomKey, RoomRegistry};

/// Derived, in-memory view of one user's presence.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub connection_count: usize,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Outcome of attaching or detaching a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// First live connection: the user transitioned to online.
    CameOnline,
    /// Another device of an already-online user.
    AlreadyOnline,
    /// Last live connection closed: the user transitioned to offline.
    WentOffline,
    /// Other connections remain.
    StillOnline,
    /// The connection was not tracked (double disconnect).
    Untracked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub forced_offline: usize,
    pub failures: usize,
}

struct PresenceEntry {
    connections: HashSet<ConnectionId>,
    last_seen: DateTime<Utc>,
}

/// The set of users whose `last_seen` the heartbeat tick refreshes.
#[derive(Default)]
pub struct HeartbeatScheduler {
    beating: Mutex<HashSet<String>>,
}

impl HeartbeatScheduler {
    pub fn start(&self, user_id: &str) -> bool {
        self.beating.lock().insert(user_id.to_string())
    }

    /// Idempotent; stopping an unknown user is a no-op.
    pub fn stop(&self, user_id: &str) -> bool {
        self.beating.lock().remove(user_id)
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.beating.lock().contains(user_id)
    }

    pub fn users(&self) -> Vec<String> {
        self.beating.lock().iter().cloned().collect()
    }
}

pub struct PresenceTracker {
    store: Arc<ChatStore>,
    rooms: Arc<RoomRegistry>,
    entries: Mutex<HashMap<String, PresenceEntry>>,
    transitions: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    heartbeats: HeartbeatScheduler,
    stale_after: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<ChatStore>, rooms: Arc<RoomRegistry>, stale_after: Duration) -> Self {
        Self {
            store,
            rooms,
            entries: Mutex::new(HashMap::new()),
            transitions: Mutex::new(HashMap::new()),
            heartbeats: HeartbeatScheduler::default(),
            stale_after,
        }
    }

    pub fn heartbeats(&self) -> &HeartbeatScheduler {
        &self.heartbeats
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.entries
            .lock()
            .get(user_id)
            .is_some_and(|e| !e.connections.is_empty())
    }

    pub fn online_count<'a>(&self, user_ids: impl IntoIterator<Item = &'a String>) -> usize {
        let entries = self.entries.lock();
        user_ids
            .into_iter()
            .filter(|id| entries.get(*id).is_some_and(|e| !e.connections.is_empty()))
            .count()
    }

    pub fn record(&self, user_id: &str) -> Option<PresenceRecord> {
        self.entries.lock().get(user_id).map(|e| PresenceRecord {
            user_id: user_id.to_string(),
            connection_count: e.connections.len(),
            is_online: !e.connections.is_empty(),
            last_seen: e.last_seen,
        })
    }

    fn transition_lock(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        self.transitions
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Attaches a live connection. On the first one the user goes online
    /// and the heartbeat starts.
    pub async fn connect(
        &self,
        user_id: &str,
        display_name: &str,
        conn: ConnectionId,
    ) -> PresenceChange {
        let lock = self.transition_lock(user_id);
        let _transition = lock.lock().await;

        let now = Utc::now();
        let first = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(user_id.to_string())
                .or_insert_with(|| PresenceEntry {
                    connections: HashSet::new(),
                    last_seen: now,
                });
            entry.last_seen = entry.last_seen.max(now);
            entry.connections.insert(conn) && entry.connections.len() == 1
        };

        if !first {
            return PresenceChange::AlreadyOnline;
        }

        self.heartbeats.start(user_id);
        if let Err(e) = self.store.set_presence(user_id, true, now).await {
            warn!("[Presence] Failed to persist online state for {}: {}", user_id, e);
        }
        self.announce(user_id, display_name, true, now).await;
        info!("[Presence] {} is online", user_id);
        PresenceChange::CameOnline
    }

    /// Detaches a connection. When it was the last one the user goes
    /// offline and the heartbeat stops.
    pub async fn disconnect(
        &self,
        user_id: &str,
        display_name: &str,
        conn: ConnectionId,
    ) -> PresenceChange {
        let lock = self.transition_lock(user_id);
        let _transition = lock.lock().await;

        let now = Utc::now();
        let change = {
            let mut entries = self.entries.lock();
            let removed = entries
                .get_mut(user_id)
                .map(|e| (e.connections.remove(&conn), e.connections.is_empty()));
            match removed {
                Some((true, true)) => {
                    entries.remove(user_id);
                    PresenceChange::WentOffline
                }
                Some((true, false)) => PresenceChange::StillOnline,
                _ => PresenceChange::Untracked,
            }
        };

        if change != PresenceChange::WentOffline {
            return change;
        }

        self.heartbeats.stop(user_id);
        if let Err(e) = self.store.set_presence(user_id, false, now).await {
            warn!("[Presence] Failed to persist offline state for {}: {}", user_id, e);
        }
        self.announce(user_id, display_name, false, now).await;
        info!("[Presence] {} is offline", user_id);
        change
    }

    /// Client-initiated liveness ping.
    pub async fn touch(&self, user_id: &str) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        if let Some(entry) = self.entries.lock().get_mut(user_id) {
            entry.last_seen = entry.last_seen.max(now);
        }
        self.store.touch_last_seen(&[user_id.to_string()], now).await?;
        Ok(now)
    }

    /// One heartbeat tick: refresh `last_seen` for every beating user.
    pub async fn heartbeat_tick(&self) -> Result<u64> {
        let users = self.heartbeats.users();
        if users.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        {
            let mut entries = self.entries.lock();
            for user_id in &users {
                if let Some(entry) = entries.get_mut(user_id) {
                    entry.last_seen = entry.last_seen.max(now);
                }
            }
        }
        let touched = self.store.touch_last_seen(&users, now).await?;
        debug!("[Presence] Heartbeat refreshed {} user(s)", touched);
        Ok(touched)
    }

    /// Force-offlines users the store marks online without a recent
    /// heartbeat and without any live connection in this process. Liveness
    /// is re-checked under the user's transition lock. One user's failure
    /// does not stop the others.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = Utc::now() - stale_after;
        let candidates = self.store.stale_online_users(cutoff).await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for user in candidates {
            let lock = self.transition_lock(&user.id);
            let _transition = lock.lock().await;
            if self.is_online(&user.id) {
                continue;
            }
            self.heartbeats.stop(&user.id);
            match self.store.set_presence(&user.id, false, user.last_seen).await {
                Ok(()) => {
                    self.announce(&user.id, &user.display_name, false, user.last_seen)
                        .await;
                    report.forced_offline += 1;
                }
                Err(e) => {
                    warn!("[Presence] Sweep failed for {}: {}", user.id, e);
                    report.failures += 1;
                }
            }
        }

        if report.forced_offline > 0 || report.failures > 0 {
            info!(
                "[Presence] Sweep: {} examined, {} forced offline, {} failed",
                report.examined, report.forced_offline, report.failures
            );
        }
        Ok(report)
    }

    /// Best-effort fan-out of a presence transition.
    async fn announce(
        &self,
        user_id: &str,
        display_name: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) {
        match self.store.conversation_ids_for_user(user_id).await {
            Ok(conversation_ids) => {
                for conversation_id in conversation_ids {
                    let room = RoomKey::conversation(conversation_id.clone());
                    let event = ServerEvent::UserPresenceUpdated {
                        user_id: user_id.to_string(),
                        display_name: display_name.to_string(),
                        is_online,
                        last_seen,
                        conversation_id,
                    };
                    self.rooms.broadcast(&room, &event, None);
                }
            }
            Err(e) => warn!("[Presence] Could not load conversations of {}: {}", user_id, e),
        }

        match self.store.direct_contact_ids(user_id).await {
            Ok(contacts) => {
                let event = if is_online {
                    ServerEvent::UserOnline {
                        user_id: user_id.to_string(),
                        display_name: display_name.to_string(),
                        last_seen,
                    }
                } else {
                    ServerEvent::UserOffline {
                        user_id: user_id.to_string(),
                        display_name: display_name.to_string(),
                        last_seen,
                    }
                };
                let rooms: Vec<RoomKey> = contacts.into_iter().map(RoomKey::user).collect();
                self.rooms.broadcast_to_rooms(&rooms, &event, None);
            }
            Err(e) => warn!("[Presence] Could not load contacts of {}: {}", user_id, e),
        }
    }
}

/// Heartbeat and sweep loops. Aborted when dropped.
pub struct PresenceTasks {
    handles: Vec<JoinHandle<()>>,
}

impl PresenceTasks {
    pub fn spawn(
        tracker: Arc<PresenceTracker>,
        heartbeat_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let heartbeat = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(heartbeat_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = tracker.heartbeat_tick().await {
                        warn!("[Presence] Heartbeat tick failed: {}", e);
                    }
                }
            })
        };

        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = tracker.sweep().await {
                    warn!("[Presence] Sweep aborted: {}", e);
                }
            }
        });

        Self {
            handles: vec![heartbeat, sweep],
        }
    }

    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for PresenceTasks {
    fn drop(&mut self) {
        self.stop();
    }
}
