use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::errors::AppError;
use crate::models::{UpdateKind, WsCommand, WsEvent};
use crate::service::chat_service::ChatService;
use crate::service::session_store::SessionHandle;

/// What happens to the chat a client moves away from.
#[derive(Debug, Clone, Copy)]
enum Leave {
    /// Kept in memory until it is saved.
    Release,
    /// Unsaved changes are given up.
    Discard,
}

/// Protocol state of one connected client: the chat it is attached to and
/// its subscription to that chat's events.
pub struct ClientSession {
    svc: ChatService,
    attached: Arc<SessionHandle>,
    events: broadcast::Receiver<WsEvent>,
}

impl ClientSession {
    /// Attaches to `chat_id` when given and known, otherwise to a fresh chat.
    /// Returns the session together with the events to send first.
    pub async fn open(svc: ChatService, chat_id: Option<&str>) -> (Self, Vec<WsEvent>) {
        let mut replies = Vec::new();
        let existing = match chat_id {
            Some(id) => match svc.load_chat(id).await {
                Ok(handle) => Some(handle),
                Err(err) => {
                    if err.is_persistence() {
                        error!("Chat {id} could not be loaded: {err}");
                    } else {
                        warn!("Client asked to resume chat {id}: {err}");
                    }
                    replies.push(WsEvent::from(&err));
                    None
                }
            },
            None => None,
        };

        let (handle, fresh) = match existing {
            Some(handle) => (handle, false),
            None => (svc.new_chat().await, true),
        };
        let (events, greeting) = join(&handle, fresh).await;
        info!("Client attached to chat {}", handle.id());
        replies.extend(greeting);

        (Self { svc, attached: handle, events }, replies)
    }

    pub fn chat_id(&self) -> &str {
        self.attached.id()
    }

    /// Receives the next event broadcast for the attached chat.
    pub async fn recv(&mut self) -> Result<WsEvent, RecvError> {
        self.events.recv().await
    }

    /// Parses and runs one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) -> Vec<WsEvent> {
        match serde_json::from_str::<WsCommand>(text) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                warn!("Rejected malformed command on chat {}: {e}", self.chat_id());
                let err = AppError::InvalidField {
                    field_name: "event".to_string(),
                    message: format!("Invalid request: {e}"),
                };
                vec![WsEvent::from(&err)]
            }
        }
    }

    /// Runs a command and returns the replies meant only for this client.
    /// Updates to the chat itself arrive through the broadcast channel.
    pub async fn dispatch(&mut self, command: WsCommand) -> Vec<WsEvent> {
        match self.execute(command).await {
            Ok(replies) => replies,
            Err(err) => {
                debug!("Command on chat {} rejected: {err}", self.chat_id());
                vec![WsEvent::from(&err)]
            }
        }
    }

    async fn execute(&mut self, command: WsCommand) -> Result<Vec<WsEvent>, AppError> {
        let handle = self.attached.clone();
        match command {
            WsCommand::Chat { message } => self.svc.chat(&handle, &message).await?,
            WsCommand::Edit { level, message } => self.svc.edit(&handle, level, &message).await?,
            WsCommand::Continue { level } => self.svc.continue_reply(&handle, level).await?,
            WsCommand::Regenerate { level } => self.svc.regenerate(&handle, level).await?,
            WsCommand::ChangeActiveChild { level, direction } => {
                self.svc.change_active_child(&handle, level, direction).await?
            }
            WsCommand::StopGeneration => {
                self.svc.stop_generation(&handle).await;
            }
            WsCommand::ResetChat | WsCommand::NewChat => {
                let fresh = self.svc.new_chat().await;
                return Ok(self.attach(fresh, true, Leave::Discard).await);
            }
            WsCommand::LoadChat { chat_id } => {
                let loaded = self.svc.load_chat(&chat_id).await?;
                return Ok(self.attach(loaded, false, Leave::Release).await);
            }
            WsCommand::DeleteChat { chat_id } => return Ok(self.delete_chat(&chat_id).await),
            WsCommand::EditChatName { name } => {
                self.svc.rename(&handle, &name).await?;
                let chats = self.svc.list_chats().await?;
                return Ok(vec![WsEvent::ChatList { chats }]);
            }
            WsCommand::ListChats => {
                let chats = self.svc.list_chats().await?;
                return Ok(vec![WsEvent::ChatList { chats }]);
            }
            WsCommand::GetModelConfig => {
                let config = self.svc.model_config().await;
                return Ok(vec![WsEvent::ModelConfigUpdated {
                    success: true,
                    config: Some(config),
                    error: None,
                }]);
            }
            WsCommand::UpdateModelConfig { config } => {
                let event = match self.svc.update_model_config(config).await {
                    Ok(config) => {
                        info!("Model configuration updated to {}", config.model_name);
                        WsEvent::ModelConfigUpdated { success: true, config: Some(config), error: None }
                    }
                    Err(err) => {
                        warn!("Model configuration update rejected: {err}");
                        WsEvent::ModelConfigUpdated {
                            success: false,
                            config: None,
                            error: Some(err.to_string()),
                        }
                    }
                };
                return Ok(vec![event]);
            }
        }
        Ok(Vec::new())
    }

    /// Handles something received from the attached chat's channel and
    /// returns what to forward to the client.
    pub async fn handle_broadcast(&mut self, received: Result<WsEvent, RecvError>) -> Vec<WsEvent> {
        match received {
            Ok(WsEvent::ChatDeleted { success, chat_id }) if chat_id == self.chat_id() => {
                // Deleted by another client: move somewhere usable.
                info!("Chat {chat_id} was deleted while attached");
                let mut replies = vec![WsEvent::ChatDeleted { success, chat_id }];
                let fresh = self.svc.new_chat().await;
                replies.extend(self.attach(fresh, true, Leave::Release).await);
                replies
            }
            Ok(event) => vec![event],
            Err(RecvError::Lagged(skipped)) => {
                warn!("Client of chat {} lagged by {skipped} events, resyncing", self.chat_id());
                let session = self.attached.lock().await;
                // Drop whatever is still queued; the snapshot supersedes it.
                self.events = self.events.resubscribe();
                vec![session.history_event()]
            }
            // The sender lives as long as the handle we hold.
            Err(RecvError::Closed) => Vec::new(),
        }
    }

    /// Called when the connection goes away.
    pub async fn close(self) {
        let ClientSession { svc, attached, events } = self;
        let chat_id = attached.id().to_string();
        drop(events);
        drop(attached);
        svc.release(&chat_id).await;
        info!("Client detached from chat {chat_id}");
    }

    /// Deletes while the chat is still live, so the removal waits for any
    /// save in flight. Only then does an attached client move to a fresh chat.
    async fn delete_chat(&mut self, chat_id: &str) -> Vec<WsEvent> {
        let mut replies = match self.svc.delete_chat(chat_id).await {
            Ok(()) => vec![WsEvent::ChatDeleted { success: true, chat_id: chat_id.to_string() }],
            Err(err) => {
                warn!("Failed to delete chat {chat_id}: {err}");
                vec![
                    WsEvent::ChatDeleted { success: false, chat_id: chat_id.to_string() },
                    WsEvent::from(&err),
                ]
            }
        };
        if chat_id == self.chat_id() {
            let fresh = self.svc.new_chat().await;
            replies.extend(self.attach(fresh, true, Leave::Release).await);
        }
        replies
    }

    /// Switches to `handle`; `fresh` picks the greeting for a new chat.
    async fn attach(
        &mut self,
        handle: Arc<SessionHandle>,
        fresh: bool,
        previous_chat: Leave,
    ) -> Vec<WsEvent> {
        let (events, greeting) = join(&handle, fresh).await;
        let previous = std::mem::replace(&mut self.attached, handle);
        self.events = events;

        let previous_id = previous.id().to_string();
        drop(previous);
        if previous_id != self.chat_id() {
            match previous_chat {
                Leave::Release => self.svc.release(&previous_id).await,
                Leave::Discard => self.svc.discard(&previous_id).await,
            }
        }
        info!("Client moved from chat {previous_id} to {}", self.chat_id());
        greeting
    }
}

/// Subscribes and snapshots under the session lock, so the client sees every
/// later update exactly once.
async fn join(handle: &SessionHandle, fresh: bool) -> (broadcast::Receiver<WsEvent>, Vec<WsEvent>) {
    let session = handle.lock().await;
    let events = session.subscribe();
    let greeting = if fresh {
        vec![
            WsEvent::NewChatStarted { chat_id: handle.id().to_string() },
            WsEvent::ChatUpdate {
                chat_id: handle.id().to_string(),
                messages: session.tree.projection(),
                kind: UpdateKind::Message,
            },
        ]
    } else {
        vec![session.history_event()]
    };
    (events, greeting)
}
