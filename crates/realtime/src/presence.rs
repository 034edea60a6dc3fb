use shared::domain::{UserId, UserStatus};
use storage::Storage;
use tracing::warn;

/// Sole writer of the users.status column. Presence is a best-effort signal:
/// the write is not atomic with registry mutation, and a failed update is
/// logged rather than surfaced to the connection.
#[derive(Clone)]
pub struct PresenceNotifier {
    storage: Storage,
}

impl PresenceNotifier {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn mark_online(&self, user_id: UserId) {
        self.update(user_id, UserStatus::Online).await;
    }

    pub async fn mark_offline(&self, user_id: UserId) {
        self.update(user_id, UserStatus::Offline).await;
    }

    async fn update(&self, user_id: UserId, status: UserStatus) {
        if let Err(error) = self.storage.update_user_status(user_id, status).await {
            warn!(
                user_id = user_id.0,
                status = status.as_str(),
                %error,
                "presence update failed"
            );
        }
    }
}
