use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_types::models::{PresenceState, PresenceStatus};

/// Delay between "all connections for an identity closed" and "marked
/// offline", absorbing quick reconnects (tab refresh) without flapping.
pub const OFFLINE_GRACE: Duration = Duration::from_secs(30);

struct Entry {
    status: PresenceStatus,
    status_text: Option<String>,
    last_seen: Option<DateTime<Utc>>,
    /// Server receipt time of the last status write; manual writes are
    /// last-write-wins against this.
    set_at: DateTime<Utc>,
    manual: bool,
    /// Bumped on every connect/disconnect edge. A grace timer only fires
    /// if its generation is still current.
    offline_gen: u64,
}

impl Entry {
    fn new() -> Self {
        Self {
            status: PresenceStatus::Offline,
            status_text: None,
            last_seen: None,
            set_at: DateTime::<Utc>::MIN_UTC,
            manual: false,
            offline_gen: 0,
        }
    }

    fn state(&self) -> PresenceState {
        PresenceState {
            status: self.status,
            status_text: self.status_text.clone(),
            last_seen: self.last_seen,
        }
    }
}

/// In-memory presence cache keyed by identity. The durable `last_seen`
/// stamp is written to the store by the hub when the offline transition
/// actually fires.
#[derive(Default)]
pub struct PresenceTracker {
    states: Mutex<HashMap<Uuid, Entry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// First connection for an identity. Returns the new state if an
    /// offline→online transition happened and should be broadcast. A
    /// manual `away` is not downgraded by merely connecting.
    pub fn mark_online(&self, user_id: Uuid, now: DateTime<Utc>) -> Option<PresenceState> {
        let mut states = self.states.lock().expect("presence lock poisoned");
        let entry = states.entry(user_id).or_insert_with(Entry::new);
        entry.offline_gen += 1;

        if entry.status == PresenceStatus::Offline {
            entry.status = PresenceStatus::Online;
            entry.status_text = None;
            entry.manual = false;
            entry.set_at = now;
            Some(entry.state())
        } else {
            None
        }
    }

    /// Last connection closed; arm the grace timer. Returns the generation
    /// the timer must present to `expire_offline`.
    pub fn schedule_offline(&self, user_id: Uuid) -> u64 {
        let mut states = self.states.lock().expect("presence lock poisoned");
        let entry = states.entry(user_id).or_insert_with(Entry::new);
        entry.offline_gen += 1;
        entry.offline_gen
    }

    /// Invalidate a pending offline transition without going online
    /// (e.g. a reconnect that is still mid-handshake).
    pub fn cancel_offline(&self, user_id: Uuid) {
        let mut states = self.states.lock().expect("presence lock poisoned");
        if let Some(entry) = states.get_mut(&user_id) {
            entry.offline_gen += 1;
        }
    }

    /// Grace timer expiry. Transitions to offline and stamps `last_seen`
    /// only if no connect edge superseded the timer's generation.
    pub fn expire_offline(
        &self,
        user_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Option<PresenceState> {
        let mut states = self.states.lock().expect("presence lock poisoned");
        let entry = states.get_mut(&user_id)?;
        if entry.offline_gen != generation || entry.status == PresenceStatus::Offline {
            return None;
        }
        entry.status = PresenceStatus::Offline;
        entry.status_text = None;
        entry.manual = false;
        entry.last_seen = Some(now);
        entry.set_at = now;
        Some(entry.state())
    }

    /// Manual status (`away`, custom text) bypasses the grace logic.
    /// Last-write-wins by wall-clock when devices race; an older write is
    /// dropped and nothing is broadcast for it.
    pub fn set_manual(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        status_text: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<PresenceState> {
        let mut states = self.states.lock().expect("presence lock poisoned");
        let entry = states.entry(user_id).or_insert_with(Entry::new);
        if now < entry.set_at {
            return None;
        }
        entry.status = status;
        entry.status_text = status_text;
        entry.manual = true;
        entry.set_at = now;
        Some(entry.state())
    }

    pub fn status(&self, user_id: Uuid) -> PresenceState {
        let states = self.states.lock().expect("presence lock poisoned");
        states
            .get(&user_id)
            .map(|e| e.state())
            .unwrap_or_else(|| Entry::new().state())
    }
}
