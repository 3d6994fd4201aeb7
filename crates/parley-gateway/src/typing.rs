use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use uuid::Uuid;

/// Server-side auto-expiry for typing entries. Clients throttle
/// `typing_start` to once per second of active input, so a live typist
/// refreshes well inside this window.
pub const TYPING_TTL: Duration = Duration::from_secs(2);

/// Ephemeral per-chat set of currently-typing identities. Nothing here is
/// persisted; entries expire on their own if the client goes silent.
///
/// Each entry carries a generation number. `start` hands the generation to
/// an expiry timer; the timer's later `expire` call only removes the entry
/// if no newer `start` refreshed it in the meantime.
#[derive(Default)]
pub struct TypingCoordinator {
    typing: Mutex<HashMap<(Uuid, Uuid), u64>>,
    next_gen: AtomicU64,
}

impl TypingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a typing entry. Returns `(fresh, generation)`;
    /// `fresh` is true only when the identity was not already typing, so
    /// the caller broadcasts one `user_typing` per burst.
    pub fn start(&self, chat_id: Uuid, user_id: Uuid) -> (bool, u64) {
        let generation = self.next_gen.fetch_add(1, Ordering::Relaxed);
        let mut typing = self.typing.lock().expect("typing lock poisoned");
        let fresh = typing.insert((chat_id, user_id), generation).is_none();
        (fresh, generation)
    }

    /// Explicit stop. Returns whether an entry was actually removed.
    pub fn stop(&self, chat_id: Uuid, user_id: Uuid) -> bool {
        let mut typing = self.typing.lock().expect("typing lock poisoned");
        typing.remove(&(chat_id, user_id)).is_some()
    }

    /// Timer-driven removal. A stale generation means the entry was
    /// refreshed or stopped since the timer was armed; nothing happens.
    pub fn expire(&self, chat_id: Uuid, user_id: Uuid, generation: u64) -> bool {
        let mut typing = self.typing.lock().expect("typing lock poisoned");
        match typing.get(&(chat_id, user_id)) {
            Some(current) if *current == generation => {
                typing.remove(&(chat_id, user_id));
                true
            }
            _ => false,
        }
    }

    /// Currently-typing identities for a chat.
    pub fn typists(&self, chat_id: Uuid) -> Vec<Uuid> {
        let typing = self.typing.lock().expect("typing lock poisoned");
        typing
            .keys()
            .filter(|(c, _)| *c == chat_id)
            .map(|(_, u)| *u)
            .collect()
    }
}
