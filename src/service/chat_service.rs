use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{GenerationRequest, Generator};
use crate::errors::AppError;
use crate::models::{
    validate_message, ChatSummary, Direction, MessageRole, MessageView, ModelConfig, UpdateKind,
    WsEvent, MAX_CHAT_NAME_LENGTH,
};
use crate::service::session_store::{Session, SessionHandle, SessionStore};
use crate::tree::{ConversationTree, NodeId};

const STREAM_BUFFER: usize = 64;

/// Applies chat commands to session trees and drives streamed generation.
///
/// Every mutation runs under the session lock and publishes the resulting
/// projection before the lock is released, so watchers see updates in the
/// order they were applied.
#[derive(Clone)]
pub struct ChatService {
    sessions: Arc<SessionStore>,
    generator: Arc<dyn Generator>,
}

impl ChatService {
    pub fn new(sessions: Arc<SessionStore>, generator: Arc<dyn Generator>) -> Self {
        Self { sessions, generator }
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    pub async fn new_chat(&self) -> Arc<SessionHandle> {
        self.sessions.create().await
    }

    pub async fn load_chat(&self, chat_id: &str) -> Result<Arc<SessionHandle>, AppError> {
        self.sessions.get(chat_id).await
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<(), AppError> {
        self.sessions.remove(chat_id).await
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, AppError> {
        self.sessions.list().await
    }

    /// Called when a client detaches from a chat.
    pub async fn release(&self, chat_id: &str) {
        self.sessions.release(chat_id).await
    }

    /// Called when a client abandons a chat for a new one; unsaved changes
    /// are lost unless someone else still watches it.
    pub async fn discard(&self, chat_id: &str) {
        self.sessions.discard(chat_id).await
    }

    pub async fn projection(&self, chat_id: &str) -> Result<Vec<MessageView>, AppError> {
        let handle = self.sessions.get(chat_id).await?;
        let messages = handle.lock().await.tree.projection();
        drop(handle);
        self.sessions.release(chat_id).await;
        Ok(messages)
    }

    pub async fn rename(&self, handle: &Arc<SessionHandle>, name: &str) -> Result<(), AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::EmptyField { field_name: "name".to_string() });
        }
        if name.chars().count() > MAX_CHAT_NAME_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "name".to_string(),
                max_length: MAX_CHAT_NAME_LENGTH,
                actual_length: name.chars().count(),
            });
        }
        {
            let mut session = handle.lock().await;
            if session.is_deleted() {
                return Err(AppError::chat_not_found(handle.id()));
            }
            session.name = Some(name.to_string());
            session.touch();
        }
        info!("Renamed chat {} to {name:?}", handle.id());
        self.schedule_save(handle.clone());
        Ok(())
    }

    // ── Tree mutations ────────────────────────────────────────────────────────

    pub async fn chat(&self, handle: &Arc<SessionHandle>, text: &str) -> Result<(), AppError> {
        validate_message("message", text)?;
        let mut session = handle.lock().await;
        session.ensure_idle()?;

        session.tree.append_to_active_path(MessageRole::User, text);
        let reply = session.tree.append_to_active_path(MessageRole::Assistant, "");
        self.begin_generation(&mut session, handle, reply);
        Ok(())
    }

    /// Forks a sibling of the user message at `level` and answers it afresh.
    pub async fn edit(
        &self,
        handle: &Arc<SessionHandle>,
        level: usize,
        text: &str,
    ) -> Result<(), AppError> {
        validate_message("message", text)?;
        let mut session = handle.lock().await;
        session.ensure_idle()?;

        let (_, parent) = resolve_with_role(&session.tree, level, MessageRole::User, "edited")?;
        session.tree.fork_at(parent, MessageRole::User, text)?;
        let reply = session.tree.append_to_active_path(MessageRole::Assistant, "");
        self.begin_generation(&mut session, handle, reply);
        Ok(())
    }

    /// Without a level, extends the active leaf (answering it first if it is a
    /// user turn). With a level, extends that assistant turn: in place for the
    /// leaf, through a forked copy for anything earlier.
    pub async fn continue_reply(
        &self,
        handle: &Arc<SessionHandle>,
        level: Option<usize>,
    ) -> Result<(), AppError> {
        let mut session = handle.lock().await;
        session.ensure_idle()?;
        if session.tree.is_empty() {
            return Err(AppError::invalid_state("there is nothing to continue"));
        }

        let target = match level {
            None => {
                let leaf = session.tree.leaf();
                let leaf_role = session.tree.node(leaf).map(|n| n.role);
                if leaf_role == Some(MessageRole::Assistant) {
                    leaf
                } else {
                    session.tree.append_to_active_path(MessageRole::Assistant, "")
                }
            }
            Some(0) => {
                resolve_with_role(&session.tree, 0, MessageRole::Assistant, "continued")?.0
            }
            Some(level) => {
                let (node, parent) =
                    resolve_with_role(&session.tree, level, MessageRole::Assistant, "continued")?;
                let content = session.tree.node(node).map(|n| n.content.clone()).unwrap_or_default();
                session.tree.fork_at(parent, MessageRole::Assistant, content)?
            }
        };
        self.begin_generation(&mut session, handle, target);
        Ok(())
    }

    /// Streams a new sibling for the assistant message at `level` (default 0).
    pub async fn regenerate(
        &self,
        handle: &Arc<SessionHandle>,
        level: Option<usize>,
    ) -> Result<(), AppError> {
        let mut session = handle.lock().await;
        session.ensure_idle()?;

        let (_, parent) = resolve_with_role(
            &session.tree,
            level.unwrap_or(0),
            MessageRole::Assistant,
            "regenerated",
        )?;
        let target = session.tree.fork_at(parent, MessageRole::Assistant, "")?;
        self.begin_generation(&mut session, handle, target);
        Ok(())
    }

    pub async fn change_active_child(
        &self,
        handle: &Arc<SessionHandle>,
        level: usize,
        direction: Direction,
    ) -> Result<(), AppError> {
        let moved = {
            let mut session = handle.lock().await;
            session.ensure_idle()?;

            let node = session.tree.resolve_level(level)?;
            let moved = session.tree.set_active_sibling(node, direction)?.is_some();
            if moved {
                session.touch();
            }
            session.publish_update(UpdateKind::Navigation);
            moved
        };
        if moved {
            self.schedule_save(handle.clone());
        }
        Ok(())
    }

    /// Finalizes the in-flight generation with whatever content it produced.
    /// Returns whether anything was running.
    pub async fn stop_generation(&self, handle: &Arc<SessionHandle>) -> bool {
        let node = {
            let mut session = handle.lock().await;
            let Some(generation) = session.take_generation() else {
                return false;
            };
            generation.cancel.cancel();
            session.publish_update(UpdateKind::Stop);
            generation.node
        };
        info!("Stopped generation of node {node} in chat {}", handle.id());
        self.schedule_save(handle.clone());
        true
    }

    // ── Model configuration ───────────────────────────────────────────────────

    pub async fn model_config(&self) -> ModelConfig {
        self.generator.config().await
    }

    pub async fn update_model_config(&self, config: ModelConfig) -> Result<ModelConfig, AppError> {
        self.generator.update_config(config).await
    }

    // ── Generation ────────────────────────────────────────────────────────────

    fn begin_generation(&self, session: &mut Session, handle: &Arc<SessionHandle>, node: NodeId) {
        session.touch();
        session.publish_update(UpdateKind::Message);
        let cancel = session.start_generation(node);
        let request = GenerationRequest::for_node(&session.tree, node);
        debug!(
            "Starting {} for chat {} ({} prompt messages)",
            if request.is_continuation() { "continuation" } else { "generation" },
            handle.id(),
            request.messages.len()
        );

        let svc = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move { svc.run_generation(handle, node, request, cancel).await });
    }

    async fn run_generation(
        self,
        handle: Arc<SessionHandle>,
        node: NodeId,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) {
        let (tx, mut rx) = mpsc::channel::<String>(STREAM_BUFFER);
        let generator = self.generator.clone();
        let upstream = tokio::spawn(async move { generator.stream(request, tx).await });

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => None,
                chunk = rx.recv() => chunk,
            };
            let Some(text) = chunk else {
                break;
            };

            let mut session = handle.lock().await;
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = session.tree.append_content(node, &text) {
                error!("Dropping generation for chat {}: {e}", handle.id());
                break;
            }
            session.touch();
            session.publish_update(UpdateKind::Message);
        }

        if cancel.is_cancelled() {
            // Whoever cancelled already finalized the node.
            upstream.abort();
            debug!("Generation for chat {} cancelled", handle.id());
            return;
        }

        drop(rx);
        let outcome = match upstream.await {
            Ok(result) => result,
            Err(e) => Err(AppError::Unexpected(format!("generation task failed: {e}"))),
        };

        {
            let mut session = handle.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            session.take_generation();
            session.publish_update(UpdateKind::Stop);
            if let Err(err) = &outcome {
                warn!("Generation for chat {} ended with an error: {err}", handle.id());
                session.publish(WsEvent::from(err));
            }
        }

        self.save_and_release(handle).await;
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    fn schedule_save(&self, handle: Arc<SessionHandle>) {
        let svc = self.clone();
        tokio::spawn(async move { svc.save_and_release(handle).await });
    }

    /// Saves, then lets go of the session so it can leave memory if every
    /// client has moved on meanwhile.
    async fn save_and_release(&self, handle: Arc<SessionHandle>) {
        self.save(&handle).await;
        let chat_id = handle.id().to_string();
        drop(handle);
        self.sessions.release(&chat_id).await;
    }

    /// Saves the latest snapshot; failures are reported to watchers but never
    /// touch the in-memory tree.
    async fn save(&self, handle: &SessionHandle) {
        match self.sessions.persist(handle).await {
            Ok(true) => {
                debug!("Saved chat {}", handle.id());
                let session = handle.lock().await;
                session.publish(WsEvent::ChatSaved { chat_id: handle.id().to_string() });
            }
            Ok(false) => {}
            Err(err) => {
                error!("Failed to save chat {}: {err}", handle.id());
                let session = handle.lock().await;
                session.publish(WsEvent::from(&err));
            }
        }
    }
}

/// Resolves `level` and checks the node's role. Returns the node and its
/// parent (the root for first turns).
fn resolve_with_role(
    tree: &ConversationTree,
    level: usize,
    role: MessageRole,
    action: &str,
) -> Result<(NodeId, NodeId), AppError> {
    let id = tree.resolve_level(level)?;
    let node = tree
        .node(id)
        .ok_or_else(|| AppError::Unexpected(format!("active path references missing node {id}")))?;
    if node.role != role {
        return Err(AppError::invalid_state(format!(
            "only {role} messages can be {action}; level {level} is a {} message",
            node.role
        )));
    }
    Ok((id, node.parent.unwrap_or(NodeId::ROOT)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{ChatStore, MemoryChatStore, StoredChat};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::{broadcast, Notify};
    use tokio::time::timeout;

    /// Replies "reply N" for the N-th call, sent as "reply " then "N".
    /// With a gate, waits between the two chunks; with `fail`, errors instead
    /// of sending the second chunk.
    pub(crate) struct ScriptedGenerator {
        calls: AtomicUsize,
        pub(crate) requests: Mutex<Vec<GenerationRequest>>,
        gate: Option<Arc<Notify>>,
        fail: bool,
        config: Mutex<ModelConfig>,
    }

    impl ScriptedGenerator {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                gate: None,
                fail: false,
                config: Mutex::new(ModelConfig {
                    model_name: "scripted".into(),
                    generation_length: 64,
                    temperature: 0.7,
                    top_p: 0.9,
                }),
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self { gate: Some(gate), ..Self::new() }
        }

        fn failing() -> Self {
            Self { fail: true, ..Self::new() }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn stream(
            &self,
            request: GenerationRequest,
            tx: mpsc::Sender<String>,
        ) -> Result<(), AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.requests.lock().unwrap().push(request);
            if tx.send("reply ".to_string()).await.is_err() {
                return Ok(());
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(AppError::UpstreamFailure { message: "model crashed".into() });
            }
            let _ = tx.send(call.to_string()).await;
            Ok(())
        }

        async fn config(&self) -> ModelConfig {
            self.config.lock().unwrap().clone()
        }

        async fn update_config(&self, config: ModelConfig) -> Result<ModelConfig, AppError> {
            config.validate()?;
            *self.config.lock().unwrap() = config.clone();
            Ok(config)
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ChatStore for FailingStore {
        async fn save(&self, _chat: &StoredChat) -> Result<(), AppError> {
            Err(AppError::persistence("disk full"))
        }
        async fn load(&self, _id: &str) -> Result<Option<StoredChat>, AppError> {
            Ok(None)
        }
        async fn list(&self) -> Result<Vec<ChatSummary>, AppError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _id: &str) -> Result<bool, AppError> {
            Ok(false)
        }
    }

    fn service_with(generator: ScriptedGenerator) -> (ChatService, Arc<ScriptedGenerator>) {
        let generator = Arc::new(generator);
        let sessions = Arc::new(SessionStore::new(Arc::new(MemoryChatStore::new())));
        (ChatService::new(sessions, generator.clone()), generator)
    }

    pub(crate) async fn next_event(rx: &mut broadcast::Receiver<WsEvent>) -> WsEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    pub(crate) async fn wait_for_stop(rx: &mut broadcast::Receiver<WsEvent>) -> Vec<MessageView> {
        loop {
            if let WsEvent::ChatUpdate { messages, kind: UpdateKind::Stop, .. } = next_event(rx).await {
                return messages;
            }
        }
    }

    async fn wait_for_saved(rx: &mut broadcast::Receiver<WsEvent>) {
        loop {
            if let WsEvent::ChatSaved { .. } = next_event(rx).await {
                return;
            }
        }
    }

    /// Waits until the streamed reply shows `content` at the leaf.
    async fn wait_for_leaf(rx: &mut broadcast::Receiver<WsEvent>, content: &str) {
        loop {
            if let WsEvent::ChatUpdate { messages, .. } = next_event(rx).await {
                if messages.last().is_some_and(|m| m.content == content) {
                    return;
                }
            }
        }
    }

    fn contents(messages: &[MessageView]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    async fn chat_and_wait(
        svc: &ChatService,
        handle: &Arc<SessionHandle>,
        rx: &mut broadcast::Receiver<WsEvent>,
        text: &str,
    ) -> Vec<MessageView> {
        svc.chat(handle, text).await.unwrap();
        let messages = wait_for_stop(rx).await;
        wait_for_saved(rx).await;
        messages
    }

    #[tokio::test]
    async fn chat_streams_a_reply_and_saves() {
        let (svc, generator) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();

        svc.chat(&handle, "hi").await.unwrap();

        match next_event(&mut rx).await {
            WsEvent::ChatUpdate { messages, kind, .. } => {
                assert_eq!(kind, UpdateKind::Message);
                assert_eq!(contents(&messages), ["hi", ""]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let messages = wait_for_stop(&mut rx).await;
        assert_eq!(contents(&messages), ["hi", "reply 1"]);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        wait_for_saved(&mut rx).await;

        assert!(handle.lock().await.saved_state());
        assert!(!handle.lock().await.is_generating());
        let prompt = generator.requests.lock().unwrap()[0].clone();
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].content, "hi");
    }

    #[tokio::test]
    async fn active_path_grows_by_two_per_chat() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();

        for (turn, text) in ["one", "two", "three"].iter().enumerate() {
            let messages = chat_and_wait(&svc, &handle, &mut rx, text).await;
            assert_eq!(messages.len(), 2 * (turn + 1));
        }
        let path_len = handle.lock().await.tree.active_path().len();
        assert_eq!(path_len, 6);
    }

    #[tokio::test]
    async fn edit_forks_and_navigation_restores_the_original() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();
        chat_and_wait(&svc, &handle, &mut rx, "hi").await;

        svc.edit(&handle, 1, "hello").await.unwrap();
        let messages = wait_for_stop(&mut rx).await;
        assert_eq!(contents(&messages), ["hello", "reply 2"]);
        assert_eq!(messages[0].sibling_info, (2, 2));
        assert_eq!(handle.lock().await.tree.node_count(), 4);
        wait_for_saved(&mut rx).await;

        svc.change_active_child(&handle, 1, Direction::Prev).await.unwrap();
        match next_event(&mut rx).await {
            WsEvent::ChatUpdate { messages, kind, .. } => {
                assert_eq!(kind, UpdateKind::Navigation);
                assert_eq!(contents(&messages), ["hi", "reply 1"]);
                assert_eq!(messages[0].sibling_info, (1, 2));
            }
            other => panic!("unexpected event {other:?}"),
        }
        // A branch switch is persisted like any other change.
        wait_for_saved(&mut rx).await;
        assert!(handle.lock().await.saved_state());
    }

    #[tokio::test]
    async fn regenerate_keeps_the_previous_reply() {
        let (svc, generator) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();
        chat_and_wait(&svc, &handle, &mut rx, "hi").await;

        svc.regenerate(&handle, None).await.unwrap();
        let messages = wait_for_stop(&mut rx).await;
        assert_eq!(contents(&messages), ["hi", "reply 2"]);
        assert_eq!(messages[1].sibling_info, (2, 2));
        wait_for_saved(&mut rx).await;
        // The regenerated prompt does not include the old reply.
        assert_eq!(generator.requests.lock().unwrap()[1].messages.len(), 1);

        svc.change_active_child(&handle, 0, Direction::Prev).await.unwrap();
        let projection = handle.lock().await.tree.projection();
        assert_eq!(contents(&projection), ["hi", "reply 1"]);
    }

    #[tokio::test]
    async fn navigation_at_a_boundary_changes_nothing() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();
        let before = chat_and_wait(&svc, &handle, &mut rx, "hi").await;

        svc.change_active_child(&handle, 0, Direction::Prev).await.unwrap();
        match next_event(&mut rx).await {
            WsEvent::ChatUpdate { messages, kind: UpdateKind::Navigation, .. } => {
                assert_eq!(messages, before)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(handle.lock().await.saved_state());
    }

    #[tokio::test]
    async fn bad_addressing_is_rejected_without_mutation() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();
        chat_and_wait(&svc, &handle, &mut rx, "hi").await;
        let before = handle.lock().await.tree.node_count();

        let err = svc.edit(&handle, 5, "x").await.unwrap_err();
        assert!(matches!(err, AppError::OutOfRange { level: 5, len: 2 }));
        let err = svc.edit(&handle, 0, "x").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        let err = svc.regenerate(&handle, Some(1)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        let err = svc.change_active_child(&handle, 2, Direction::Next).await.unwrap_err();
        assert_eq!(err.kind(), "out_of_range");
        let err = svc.chat(&handle, "   ").await.unwrap_err();
        assert!(err.is_validation());

        assert_eq!(handle.lock().await.tree.node_count(), before);
        assert!(handle.lock().await.saved_state());
    }

    #[tokio::test]
    async fn structural_commands_wait_for_the_terminal_signal() {
        let gate = Arc::new(Notify::new());
        let (svc, _) = service_with(ScriptedGenerator::gated(gate.clone()));
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();

        svc.chat(&handle, "hi").await.unwrap();
        wait_for_leaf(&mut rx, "reply ").await;

        for err in [
            svc.chat(&handle, "again").await.unwrap_err(),
            svc.edit(&handle, 1, "edited").await.unwrap_err(),
            svc.regenerate(&handle, None).await.unwrap_err(),
            svc.continue_reply(&handle, None).await.unwrap_err(),
            svc.change_active_child(&handle, 0, Direction::Prev).await.unwrap_err(),
        ] {
            assert_eq!(err.kind(), "invalid_state");
        }

        gate.notify_one();
        let messages = wait_for_stop(&mut rx).await;
        assert_eq!(contents(&messages), ["hi", "reply 1"]);
        assert_eq!(handle.lock().await.tree.node_count(), 2);
    }

    #[tokio::test]
    async fn stopping_keeps_partial_content() {
        let gate = Arc::new(Notify::new());
        let (svc, _) = service_with(ScriptedGenerator::gated(gate.clone()));
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();

        svc.chat(&handle, "hi").await.unwrap();
        wait_for_leaf(&mut rx, "reply ").await;

        assert!(svc.stop_generation(&handle).await);
        let messages = wait_for_stop(&mut rx).await;
        assert_eq!(contents(&messages), ["hi", "reply "]);
        assert!(!handle.lock().await.is_generating());
        wait_for_saved(&mut rx).await;

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let projection = handle.lock().await.tree.projection();
        assert_eq!(contents(&projection), ["hi", "reply "]);
        assert!(!svc.stop_generation(&handle).await);
    }

    #[tokio::test]
    async fn upstream_failure_leaves_partial_reply_and_reports() {
        let (svc, _) = service_with(ScriptedGenerator::failing());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();

        svc.chat(&handle, "hi").await.unwrap();
        let messages = wait_for_stop(&mut rx).await;
        assert_eq!(contents(&messages), ["hi", "reply "]);
        match next_event(&mut rx).await {
            WsEvent::Error { kind, .. } => assert_eq!(kind, "upstream_failure"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!handle.lock().await.is_generating());
        // The caller may retry explicitly.
        svc.regenerate(&handle, None).await.unwrap();
        wait_for_stop(&mut rx).await;
        assert_eq!(handle.lock().await.tree.node_count(), 3);
    }

    #[tokio::test]
    async fn continue_extends_the_leaf_in_place() {
        let (svc, generator) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();
        chat_and_wait(&svc, &handle, &mut rx, "hi").await;

        svc.continue_reply(&handle, None).await.unwrap();
        let messages = wait_for_stop(&mut rx).await;
        assert_eq!(contents(&messages), ["hi", "reply 1reply 2"]);
        assert_eq!(handle.lock().await.tree.node_count(), 2);
        assert!(generator.requests.lock().unwrap()[1].is_continuation());
    }

    #[tokio::test]
    async fn continue_answers_a_dangling_user_turn() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();
        {
            let mut session = handle.lock().await;
            session.tree.append_to_active_path(MessageRole::User, "unanswered");
            session.touch();
        }

        svc.continue_reply(&handle, None).await.unwrap();
        let messages = wait_for_stop(&mut rx).await;
        assert_eq!(contents(&messages), ["unanswered", "reply 1"]);

        let err = svc.continue_reply(&handle, Some(1)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn continue_on_an_earlier_reply_forks_a_copy() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();
        chat_and_wait(&svc, &handle, &mut rx, "hi").await;
        chat_and_wait(&svc, &handle, &mut rx, "more").await;

        svc.continue_reply(&handle, Some(2)).await.unwrap();
        let messages = wait_for_stop(&mut rx).await;
        assert_eq!(contents(&messages), ["hi", "reply 1reply 3"]);
        assert_eq!(messages[1].sibling_info, (2, 2));
        wait_for_saved(&mut rx).await;

        svc.change_active_child(&handle, 0, Direction::Prev).await.unwrap();
        let projection = handle.lock().await.tree.projection();
        assert_eq!(contents(&projection), ["hi", "reply 1", "more", "reply 2"]);
    }

    #[tokio::test]
    async fn continue_on_an_empty_chat_is_rejected() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let err = svc.continue_reply(&handle, None).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn save_failure_keeps_the_tree() {
        let generator = Arc::new(ScriptedGenerator::new());
        let sessions = Arc::new(SessionStore::new(Arc::new(FailingStore)));
        let svc = ChatService::new(sessions, generator);
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();

        svc.chat(&handle, "hi").await.unwrap();
        wait_for_stop(&mut rx).await;
        match next_event(&mut rx).await {
            WsEvent::Error { kind, .. } => assert_eq!(kind, "persistence_failure"),
            other => panic!("unexpected event {other:?}"),
        }
        let session = handle.lock().await;
        assert_eq!(contents(&session.tree.projection()), ["hi", "reply 1"]);
        assert!(!session.saved_state());
    }

    #[tokio::test]
    async fn saved_chats_reload_with_the_same_projection() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let id = handle.id().to_string();
        let mut rx = handle.lock().await.subscribe();
        chat_and_wait(&svc, &handle, &mut rx, "hi").await;
        svc.regenerate(&handle, None).await.unwrap();
        let before = wait_for_stop(&mut rx).await;
        wait_for_saved(&mut rx).await;

        drop(rx);
        drop(handle);
        svc.release(&id).await;

        assert_eq!(svc.projection(&id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn rename_list_and_delete() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let handle = svc.new_chat().await;
        let mut rx = handle.lock().await.subscribe();
        chat_and_wait(&svc, &handle, &mut rx, "hi").await;

        svc.rename(&handle, "  Greetings ").await.unwrap();
        wait_for_saved(&mut rx).await;
        let chats = svc.list_chats().await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].name, "Greetings");
        assert!(svc.rename(&handle, " ").await.unwrap_err().is_validation());

        svc.delete_chat(handle.id()).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            WsEvent::ChatDeleted { success: true, chat_id: handle.id().to_string() }
        );
        assert!(svc.list_chats().await.unwrap().is_empty());
        assert!(svc.load_chat(handle.id()).await.unwrap_err().is_not_found());
        assert!(svc.chat(&handle, "still there?").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn model_config_is_forwarded() {
        let (svc, _) = service_with(ScriptedGenerator::new());
        let mut config = svc.model_config().await;
        config.temperature = 1.5;
        let updated = svc.update_model_config(config.clone()).await.unwrap();
        assert_eq!(updated, config);
        assert_eq!(svc.model_config().await.temperature, 1.5);

        config.top_p = 4.0;
        assert!(svc.update_model_config(config).await.unwrap_err().is_validation());
    }
}
