use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{ChatStore, StoredChat};
use crate::errors::AppError;
use crate::models::{ChatSummary, UpdateKind, WsEvent};
use crate::tree::{ConversationTree, NodeId};

const EVENT_BUFFER: usize = 256;
const PREVIEW_CHARS: usize = 60;
const DEFAULT_CHAT_NAME: &str = "New Chat";

/// The generation currently streaming into a session, if any.
#[derive(Debug)]
pub struct ActiveGeneration {
    pub node: NodeId,
    pub cancel: CancellationToken,
}

/// One chat: its tree plus bookkeeping. Only reachable through
/// [`SessionHandle::lock`], so every mutation and every event published for
/// the chat happens under the same lock and in the same order.
pub struct Session {
    id: String,
    pub name: Option<String>,
    pub tree: ConversationTree,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    revision: u64,
    saved_revision: Option<u64>,
    generation: Option<ActiveGeneration>,
    deleted: bool,
    events: broadcast::Sender<WsEvent>,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: None,
            tree: ConversationTree::new(),
            created_at: now,
            last_modified: now,
            revision: 0,
            saved_revision: None,
            generation: None,
            deleted: false,
            events: broadcast::channel(EVENT_BUFFER).0,
        }
    }

    fn from_stored(chat: StoredChat) -> Self {
        Self {
            id: chat.id,
            name: chat.name,
            tree: chat.tree,
            created_at: chat.created_at,
            last_modified: chat.updated_at,
            revision: 0,
            saved_revision: Some(0),
            generation: None,
            deleted: false,
            events: broadcast::channel(EVENT_BUFFER).0,
        }
    }

    /// Explicit name, else a preview of the first user message.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match self.tree.preview().map(str::trim) {
            Some(text) if text.chars().count() > PREVIEW_CHARS => {
                format!("{}…", text.chars().take(PREVIEW_CHARS).collect::<String>())
            }
            Some(text) if !text.is_empty() => text.to_string(),
            _ => DEFAULT_CHAT_NAME.to_string(),
        }
    }

    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            id: self.id.clone(),
            name: self.display_name(),
            last_modified: self.last_modified,
        }
    }

    /// Records a mutation: bumps the revision and the modification time.
    pub fn touch(&mut self) {
        self.revision += 1;
        self.last_modified = Utc::now();
    }

    /// Whether the tree matches the last persisted snapshot.
    pub fn saved_state(&self) -> bool {
        self.saved_revision == Some(self.revision)
    }

    pub fn is_persisted(&self) -> bool {
        self.saved_revision.is_some()
    }

    fn is_listable(&self) -> bool {
        !self.deleted && (self.is_persisted() || self.name.is_some() || !self.tree.is_empty())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_generating(&self) -> bool {
        self.generation.is_some()
    }

    /// Structural commands are refused while a generation streams into the tree.
    pub fn ensure_idle(&self) -> Result<(), AppError> {
        if self.deleted {
            return Err(AppError::chat_not_found(&self.id));
        }
        if self.is_generating() {
            return Err(AppError::invalid_state("a reply is still being generated for this chat"));
        }
        Ok(())
    }

    pub fn start_generation(&mut self, node: NodeId) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.generation = Some(ActiveGeneration { node, cancel: cancel.clone() });
        cancel
    }

    /// Clears the generation slot. Whoever takes it is responsible for the
    /// terminal `stop` push.
    pub fn take_generation(&mut self) -> Option<ActiveGeneration> {
        self.generation.take()
    }

    pub fn to_stored(&self) -> StoredChat {
        StoredChat {
            id: self.id.clone(),
            name: self.name.clone(),
            title: self.display_name(),
            tree: self.tree.clone(),
            created_at: self.created_at,
            updated_at: self.last_modified,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.events.subscribe()
    }

    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn publish(&self, event: WsEvent) {
        // No receivers is fine: nobody is watching this chat right now.
        let _ = self.events.send(event);
    }

    pub fn publish_update(&self, kind: UpdateKind) {
        self.publish(WsEvent::ChatUpdate {
            chat_id: self.id.clone(),
            messages: self.tree.projection(),
            kind,
        });
    }

    /// Full snapshot sent on attach and after a lagged receiver.
    pub fn history_event(&self) -> WsEvent {
        WsEvent::ChatHistory { chat_id: self.id.clone(), messages: self.tree.projection() }
    }
}

pub struct SessionHandle {
    id: String,
    state: Mutex<Session>,
    save_lock: Mutex<()>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        Self { id: session.id.clone(), state: Mutex::new(session), save_lock: Mutex::new(()) }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.state.lock().await
    }
}

/// Owns the live sessions and mediates creation, loading, saving and deletion
/// against the persistence collaborator.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    store: Arc<dyn ChatStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), store }
    }

    pub async fn create(&self) -> Arc<SessionHandle> {
        let id = Uuid::new_v4().to_string();
        let handle = Arc::new(SessionHandle::new(Session::new(id.clone())));
        self.sessions.lock().await.insert(id.clone(), handle.clone());
        debug!("Created chat {id}");
        handle
    }

    /// Returns the live session, loading it from persistence if needed.
    pub async fn get(&self, id: &str) -> Result<Arc<SessionHandle>, AppError> {
        if let Some(handle) = self.sessions.lock().await.get(id) {
            return Ok(handle.clone());
        }

        let stored = self.store.load(id).await?.ok_or_else(|| AppError::chat_not_found(id))?;
        info!("Loaded chat {id} from storage");
        let mut sessions = self.sessions.lock().await;
        let handle = sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(SessionHandle::new(Session::from_stored(stored))));
        Ok(handle.clone())
    }

    /// Deletes a chat from memory and persistence. Watchers receive
    /// `chat_deleted`; an in-flight generation is cancelled.
    pub async fn remove(&self, id: &str) -> Result<(), AppError> {
        let handle = self.sessions.lock().await.remove(id);

        let in_memory = match &handle {
            Some(handle) => {
                let mut session = handle.lock().await;
                session.deleted = true;
                if let Some(generation) = session.take_generation() {
                    generation.cancel.cancel();
                }
                session.publish(WsEvent::ChatDeleted { success: true, chat_id: id.to_string() });
                true
            }
            None => false,
        };

        // Let a save already in progress finish before deleting its row.
        let _save_guard = match &handle {
            Some(handle) => Some(handle.save_lock.lock().await),
            None => None,
        };
        let persisted = self.store.delete(id).await?;

        if in_memory || persisted {
            info!("Deleted chat {id}");
            Ok(())
        } else {
            Err(AppError::chat_not_found(id))
        }
    }

    /// Persisted chats merged with unsaved live ones, newest first.
    pub async fn list(&self) -> Result<Vec<ChatSummary>, AppError> {
        let mut by_id: HashMap<String, ChatSummary> =
            self.store.list().await?.into_iter().map(|c| (c.id.clone(), c)).collect();

        let handles: Vec<Arc<SessionHandle>> = self.sessions.lock().await.values().cloned().collect();
        for handle in handles {
            let session = handle.lock().await;
            if session.is_listable() {
                by_id.insert(session.id.clone(), session.summary());
            }
        }

        let mut chats: Vec<ChatSummary> = by_id.into_values().collect();
        chats.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(chats)
    }

    /// Writes the latest snapshot of the session. Saves of one session are
    /// serialised; returns `false` when the session was deleted meanwhile.
    pub async fn persist(&self, handle: &SessionHandle) -> Result<bool, AppError> {
        let _save_guard = handle.save_lock.lock().await;
        let (snapshot, revision) = {
            let session = handle.lock().await;
            if session.deleted {
                return Ok(false);
            }
            (session.to_stored(), session.revision)
        };

        debug!("Saving chat {} ({} nodes)", snapshot.id, snapshot.tree.node_count());
        self.store.save(&snapshot).await?;

        let mut session = handle.lock().await;
        if session.saved_revision.map_or(true, |saved| saved < revision) {
            session.saved_revision = Some(revision);
        }
        Ok(true)
    }

    /// Drops a session from memory once nobody watches it and nothing would
    /// be lost: it is saved, or it never held anything.
    pub async fn release(&self, id: &str) {
        self.evict(id, false).await
    }

    /// Like [`release`](Self::release), but unsaved changes are given up.
    pub async fn discard(&self, id: &str) {
        self.evict(id, true).await
    }

    async fn evict(&self, id: &str, drop_unsaved: bool) {
        let mut sessions = self.sessions.lock().await;
        let Some(handle) = sessions.get(id) else {
            return;
        };
        // Anyone still holding the handle may be about to subscribe or mutate.
        if Arc::strong_count(handle) > 1 {
            return;
        }
        let idle = {
            let session = handle.lock().await;
            session.watcher_count() == 0
                && !session.is_generating()
                && (drop_unsaved || session.saved_state() || !session.is_listable())
        };
        if idle {
            sessions.remove(id);
            debug!("Released chat {id} from memory");
        }
    }

    #[cfg(test)]
    pub async fn is_live(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }
}
