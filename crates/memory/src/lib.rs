//! Conversation memory and turn-record persistence for ClawLink.

pub mod conversation;
pub mod persistence;
pub mod store;

pub use conversation::ConversationMemory;
pub use persistence::{PersistenceFlusher, PersistenceWriter};
pub use store::{InMemoryTurnStore, JsonlTurnStore, NoopTurnStore, StoreError, TurnStore};
