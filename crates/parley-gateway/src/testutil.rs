use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::ServerEvent;

use crate::hub::Hub;

pub(crate) const CHAT: Uuid = Uuid::from_u128(1);

/// Hub over an in-memory store seeded with two participants of one chat.
pub(crate) fn seeded_hub() -> (Hub, Uuid, Uuid) {
    let db = Database::open_in_memory().unwrap();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    db.create_user(&alice.to_string(), "alice").unwrap();
    db.create_user(&bob.to_string(), "bob").unwrap();
    db.create_chat(&CHAT.to_string(), "general").unwrap();
    db.add_participant(&CHAT.to_string(), &alice.to_string(), "member")
        .unwrap();
    db.add_participant(&CHAT.to_string(), &bob.to_string(), "member")
        .unwrap();
    (Hub::new(Arc::new(db)), alice, bob)
}

pub(crate) fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
