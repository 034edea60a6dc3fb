use std::sync::Arc;

use anyhow::Context;
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{ClientFrame, ServerFrame},
};
use storage::{Storage, StoredMessage};
use tracing::{debug, error, info};

use crate::{
    presence::PresenceNotifier,
    session::{ClientHandle, ConnId, SessionRegistry},
};

const AUTH_REQUIRED: &str = "Authentication required";
const BLOCKED_MESSAGE: &str = "Cannot send message to this user";

/// Per-frame state machine for a chat connection. A connection starts
/// unauthenticated, where only `auth` is accepted; after that, every frame
/// re-resolves its sender from the registry, because a handle can lose its
/// registration mid-session when a second login supersedes it.
///
/// All failures are contained per frame: a bad frame earns an `error` reply
/// and the connection stays open, and a store failure drops the frame with
/// no confirmation so the client's optimistic entry times out.
pub struct DeliveryRouter {
    registry: Arc<SessionRegistry>,
    presence: PresenceNotifier,
    storage: Storage,
}

impl DeliveryRouter {
    pub fn new(registry: Arc<SessionRegistry>, storage: Storage) -> Self {
        Self {
            registry,
            presence: PresenceNotifier::new(storage.clone()),
            storage,
        }
    }

    /// Entry point for one inbound text frame.
    pub async fn handle_text(&self, handle: &ClientHandle, raw: &str) {
        match serde_json::from_str::<ClientFrame>(raw) {
            Ok(frame) => self.handle_frame(handle, frame).await,
            Err(parse_error) => {
                debug!(%parse_error, "ignoring malformed frame");
                handle.send(ServerFrame::error("Malformed frame"));
            }
        }
    }

    pub async fn handle_frame(&self, handle: &ClientHandle, frame: ClientFrame) {
        match frame {
            ClientFrame::Auth { user_id } => {
                self.registry.register(user_id, handle.clone());
                info!(user_id = user_id.0, "user connected");
                self.presence.mark_online(user_id).await;
            }
            ClientFrame::Message {
                receiver_id,
                content,
                temp_id,
            } => {
                let Some(sender_id) = self.require_sender(handle) else {
                    return;
                };
                if let Err(refusal) = self
                    .deliver_message(handle, sender_id, receiver_id, &content, temp_id)
                    .await
                {
                    handle.send(ServerFrame::error(refusal.message));
                }
            }
            ClientFrame::Typing {
                receiver_id,
                is_typing,
            } => {
                let Some(sender_id) = self.require_sender(handle) else {
                    return;
                };
                // Ephemeral: forwarded only to a live recipient, otherwise
                // dropped without error or persistence.
                if let Some(receiver) = self.registry.lookup(receiver_id) {
                    receiver.send(ServerFrame::Typing {
                        sender_id,
                        is_typing,
                    });
                }
            }
        }
    }

    /// Close transition. Only a removal that actually matched flips the
    /// stored presence, so a superseded zombie handle closing late does not
    /// mark the (still connected) user offline.
    pub async fn connection_closed(&self, conn_id: ConnId) {
        if let Some(user_id) = self.registry.unregister(conn_id) {
            info!(user_id = user_id.0, "user disconnected");
            self.presence.mark_offline(user_id).await;
        }
    }

    fn require_sender(&self, handle: &ClientHandle) -> Option<UserId> {
        let sender = self.registry.resolve_sender(handle.conn_id());
        if sender.is_none() {
            handle.send(ServerFrame::error(AUTH_REQUIRED));
        }
        sender
    }

    /// Block check, durable insert, then fan-out. Policy refusals come back
    /// as Err and turn into an `error` frame for the sender; infrastructure
    /// failures are logged here and swallowed, which deliberately leaves the
    /// sender without a confirmation.
    async fn deliver_message(
        &self,
        handle: &ClientHandle,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
        temp_id: Option<String>,
    ) -> Result<(), ApiError> {
        if content.trim().is_empty() {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "Message content cannot be empty",
            ));
        }

        // Blocking is mutual silence: either direction refuses delivery.
        match self.either_direction_blocked(sender_id, receiver_id).await {
            Ok(true) => {
                return Err(ApiError::new(ErrorCode::Forbidden, BLOCKED_MESSAGE));
            }
            Ok(false) => {}
            Err(lookup_error) => {
                error!(
                    %lookup_error,
                    sender_id = sender_id.0,
                    receiver_id = receiver_id.0,
                    "block lookup failed, dropping frame"
                );
                return Ok(());
            }
        }

        let stored = match self.persist_message(sender_id, receiver_id, content).await {
            Ok(stored) => stored,
            Err(store_error) => {
                error!(
                    %store_error,
                    sender_id = sender_id.0,
                    receiver_id = receiver_id.0,
                    "message insert failed, dropping frame"
                );
                return Ok(());
            }
        };

        if let Some(receiver) = self.registry.lookup(receiver_id) {
            let sender_username = self
                .storage
                .username_for_user(sender_id)
                .await
                .ok()
                .flatten();
            receiver.send(ServerFrame::Message {
                id: stored.message_id,
                sender_id,
                receiver_id,
                content: stored.content.clone(),
                created_at: stored.created_at,
                sender_username,
            });
        }

        // Confirmed regardless of recipient liveness; offline recipients
        // catch up through the conversation history query.
        handle.send(ServerFrame::MessageConfirmed {
            temp_id,
            id: stored.message_id,
            sender_id: stored.sender_id,
            receiver_id: stored.receiver_id,
            content: stored.content,
            created_at: stored.created_at,
        });
        Ok(())
    }

    async fn either_direction_blocked(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> anyhow::Result<bool> {
        Ok(self.storage.is_blocked(receiver_id, sender_id).await?
            || self.storage.is_blocked(sender_id, receiver_id).await?)
    }

    async fn persist_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> anyhow::Result<StoredMessage> {
        let message_id = self
            .storage
            .create_message(sender_id, receiver_id, content)
            .await?;
        self.storage
            .message_by_id(message_id)
            .await?
            .context("stored message row missing after insert")
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
