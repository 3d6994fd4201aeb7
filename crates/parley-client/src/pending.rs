use std::collections::HashMap;

use uuid::Uuid;

/// An optimistically rendered send awaiting its server acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub chat_id: Uuid,
    pub content: String,
}

/// Pending-operations table keyed by `temp_id`. Each entry is resolved by
/// the matching `message_sent` ack or failed when the connection is
/// terminally lost — the optimistic copy is never also rendered from the
/// broadcast path, because the server suppresses that copy for the
/// sending connection.
#[derive(Default)]
pub struct PendingSends {
    entries: HashMap<String, PendingSend>,
}

impl PendingSends {
    pub fn track(&mut self, temp_id: String, chat_id: Uuid, content: String) {
        self.entries.insert(temp_id, PendingSend { chat_id, content });
    }

    pub fn resolve(&mut self, temp_id: &str) -> Option<PendingSend> {
        self.entries.remove(temp_id)
    }

    /// Drain everything on terminal disconnect, so the app can mark its
    /// optimistic copies as failed.
    pub fn fail_all(&mut self) -> Vec<(String, PendingSend)> {
        self.entries.drain().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_consumes_the_entry() {
        let mut pending = PendingSends::default();
        let chat = Uuid::new_v4();
        pending.track("abc".into(), chat, "hello".into());

        let entry = pending.resolve("abc").expect("tracked entry");
        assert_eq!(entry.chat_id, chat);
        assert!(pending.resolve("abc").is_none(), "acks are one-shot");
    }

    #[test]
    fn fail_all_drains_outstanding_sends() {
        let mut pending = PendingSends::default();
        let chat = Uuid::new_v4();
        pending.track("a".into(), chat, "one".into());
        pending.track("b".into(), chat, "two".into());

        let failed = pending.fail_all();
        assert_eq!(failed.len(), 2);
        assert!(pending.is_empty());
    }
}
