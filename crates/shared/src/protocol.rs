use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::domain::{InviteId, InviteStatus, MessageId, TournamentId, UserId, UserStatus};

/// One inbound wire frame. One JSON object per WebSocket text message,
/// discriminated by `type`; field names are camelCase on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Auth {
        #[serde(deserialize_with = "lenient_user_id")]
        user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        #[serde(deserialize_with = "lenient_user_id")]
        receiver_id: UserId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        #[serde(deserialize_with = "lenient_user_id")]
        receiver_id: UserId,
        is_typing: bool,
    },
}

/// One outbound wire frame, covering both routed chat traffic and the
/// fire-and-forget notification events pushed from the HTTP routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Message {
        id: MessageId,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_username: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MessageConfirmed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
        id: MessageId,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        created_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        sender_id: UserId,
        is_typing: bool,
    },
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    GameInvitation {
        invite_id: InviteId,
        sender_id: UserId,
        sender_username: String,
    },
    #[serde(rename_all = "camelCase")]
    GameInvitationResponse {
        invite_id: InviteId,
        status: InviteStatus,
        opponent_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    TournamentMatch {
        tournament_id: TournamentId,
        tournament_name: String,
        round: i64,
        opponent_id: UserId,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

/// Registry keys are canonical numeric identifiers, but clients have been
/// observed sending ids as JSON strings; accept both and normalize.
fn lenient_user_id<'de, D>(deserializer: D) -> Result<UserId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(value) => Ok(UserId(value)),
        RawId::Text(text) => text
            .trim()
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| de::Error::custom(format!("invalid numeric id {text:?}"))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub status: UserStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub bio: Option<String>,
    pub avatar: Option<String>,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedUser {
    pub id: UserId,
    pub username: String,
}

/// One row of a two-party conversation as served by the history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHistoryEntry {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender_username: String,
}
