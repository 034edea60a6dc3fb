use std::sync::Arc;

use shared::{domain::UserId, protocol::ServerFrame};
use tracing::debug;

use crate::session::SessionRegistry;

/// Fire-and-forget push of out-of-band events (game invitations, invite
/// responses, tournament pairings) to a user's live connection. At most
/// once, no retry, no queue: an offline user misses the event and recovers
/// it from stored state on their next query.
#[derive(Clone)]
pub struct NotificationBroadcaster {
    registry: Arc<SessionRegistry>,
}

impl NotificationBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn push(&self, user_id: UserId, frame: ServerFrame) {
        let Some(handle) = self.registry.lookup(user_id) else {
            debug!(user_id = user_id.0, "push skipped, user not connected");
            return;
        };
        if !handle.send(frame) {
            debug!(user_id = user_id.0, "push dropped, connection closing");
        }
    }
}
