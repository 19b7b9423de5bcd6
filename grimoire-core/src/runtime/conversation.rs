//! In-memory conversation store.

use crate::clock::Clock;
use crate::error::GrimoireError;
use crate::types::{ChatMessage, Metadata, Role};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// One recorded turn. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Message {
    /// Whether this is a failure record rather than a turn.
    pub fn is_error(&self) -> bool {
        self.metadata
            .get("is_error")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// A conversation and its full history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub model_id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// The history as backend input, failure records left out.
    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .filter(|message| !message.is_error())
            .map(|message| ChatMessage::new(message.role, message.content.clone()))
            .collect()
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            model_id: self.model_id.clone(),
            message_count: self.messages.len(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Conversation without its messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub model_id: String,
    pub message_count: usize,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store entry: the conversation plus the lock that orders its turns.
#[derive(Debug)]
pub(crate) struct ConversationSlot {
    turn: Mutex<()>,
    state: RwLock<Conversation>,
}

impl ConversationSlot {
    /// Held for a whole generation turn so appends never interleave.
    pub(crate) async fn lock_turn(&self) -> MutexGuard<'_, ()> {
        self.turn.lock().await
    }

    pub(crate) fn snapshot(&self) -> Conversation {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn append(&self, message: Message) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.updated_at = message.timestamp;
        state.messages.push(message);
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).updated_at
    }
}

/// Conversations keyed by id, living for the lifetime of the process.
#[derive(Debug)]
pub struct ConversationStore {
    conversations: DashMap<String, Arc<ConversationSlot>>,
    clock: Arc<dyn Clock>,
}

impl ConversationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            conversations: DashMap::new(),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Start an empty conversation bound to `model_id`.
    pub fn create(&self, model_id: impl Into<String>, metadata: Metadata) -> Conversation {
        let now = self.clock.now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            model_id: model_id.into(),
            messages: Vec::new(),
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.conversations.insert(
            conversation.id.clone(),
            Arc::new(ConversationSlot {
                turn: Mutex::new(()),
                state: RwLock::new(conversation.clone()),
            }),
        );
        conversation
    }

    pub fn get(&self, id: &str) -> Result<Conversation, GrimoireError> {
        Ok(self.slot(id)?.snapshot())
    }

    pub(crate) fn slot(&self, id: &str) -> Result<Arc<ConversationSlot>, GrimoireError> {
        self.conversations
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GrimoireError::ConversationNotFound(id.to_string()))
    }

    /// Whether `slot` is still the live entry for `id`.
    pub(crate) fn is_current(&self, id: &str, slot: &Arc<ConversationSlot>) -> bool {
        self.conversations
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), slot))
    }

    /// Build a message stamped with the store's clock.
    pub fn message(&self, role: Role, content: impl Into<String>, metadata: Metadata) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: self.clock.now(),
            metadata,
        }
    }

    /// Most recently updated first, at most `limit`.
    pub fn list(&self, limit: usize) -> Vec<ConversationSummary> {
        let mut summaries: Vec<_> = self
            .conversations
            .iter()
            .map(|entry| entry.value().snapshot().summary())
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit);
        summaries
    }

    pub fn delete(&self, id: &str) -> bool {
        self.conversations.remove(id).is_some()
    }

    /// Remove conversations idle longer than `max_age`. A conversation in
    /// the middle of a turn is kept.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let before = self.conversations.len();
        self.conversations.retain(|_, slot| {
            slot.updated_at() >= cutoff || slot.turn.try_lock().is_err()
        });
        before.saturating_sub(self.conversations.len())
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, ConversationStore) {
        let clock = Arc::new(ManualClock::default());
        let store = ConversationStore::new(clock.clone());
        (clock, store)
    }

    #[test]
    fn create_and_append() {
        let (_, store) = store();
        let conversation = store.create("default", Metadata::new());
        assert!(conversation.messages.is_empty());

        let slot = store.slot(&conversation.id).unwrap();
        slot.append(store.message(Role::User, "Hello", Metadata::new()));
        slot.append(store.message(Role::Assistant, "Hi", Metadata::new()));

        let stored = store.get(&conversation.id).unwrap();
        let roles: Vec<_> = stored.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert!(matches!(
            store.get("nope"),
            Err(GrimoireError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn transcript_skips_error_records() {
        let (_, store) = store();
        let conversation = store.create("default", Metadata::new());
        let slot = store.slot(&conversation.id).unwrap();

        let mut failure = Metadata::new();
        failure.insert("is_error".into(), true.into());
        slot.append(store.message(Role::User, "first", Metadata::new()));
        slot.append(store.message(Role::System, "boom", failure));
        slot.append(store.message(Role::User, "second", Metadata::new()));

        let transcript = slot.snapshot().transcript();
        let contents: Vec<_> = transcript.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[test]
    fn list_orders_by_last_update() {
        let (clock, store) = store();
        let older = store.create("default", Metadata::new());
        clock.advance(chrono::Duration::seconds(1));
        let newer = store.create("default", Metadata::new());
        clock.advance(chrono::Duration::seconds(1));
        store
            .slot(&older.id)
            .unwrap()
            .append(store.message(Role::User, "bump", Metadata::new()));

        let ids: Vec<_> = store.list(10).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![older.id.clone(), newer.id.clone()]);
        assert_eq!(store.list(1).len(), 1);
        assert_eq!(store.list(10)[0].message_count, 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_idle_conversations() {
        let (clock, store) = store();
        let stale = store.create("default", Metadata::new());
        let busy = store.create("default", Metadata::new());
        clock.advance(chrono::Duration::hours(25));
        let fresh = store.create("default", Metadata::new());

        let busy_slot = store.slot(&busy.id).unwrap();
        let _turn = busy_slot.lock_turn().await;

        let removed = store.cleanup_older_than(Duration::from_secs(24 * 3600));
        assert_eq!(removed, 1);
        assert!(store.get(&stale.id).is_err());
        assert!(store.get(&busy.id).is_ok());
        assert!(store.get(&fresh.id).is_ok());
    }

    #[test]
    fn delete() {
        let (_, store) = store();
        let conversation = store.create("default", Metadata::new());
        assert!(store.delete(&conversation.id));
        assert!(!store.delete(&conversation.id));
        assert!(store.is_empty());
    }

    #[test]
    fn swept_slot_is_no_longer_current() {
        let (clock, store) = store();
        let conversation = store.create("default", Metadata::new());
        let slot = store.slot(&conversation.id).unwrap();
        assert!(store.is_current(&conversation.id, &slot));

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(store.cleanup_older_than(Duration::from_secs(1)), 1);
        assert!(!store.is_current(&conversation.id, &slot));
    }
}
