use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{InviteId, InviteStatus, MessageId, TournamentId, UserId, UserStatus};

/// Durable store for users, messages, blocks, game invitations and
/// tournaments. The realtime core reads and writes through this handle and
/// never caches rows beyond a single frame's lifetime.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub bio: Option<String>,
    pub avatar: Option<String>,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub sender_username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredInvitation {
    pub invite_id: InviteId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: InviteStatus,
}

#[derive(Debug, Clone)]
pub struct StoredTournament {
    pub tournament_id: TournamentId,
    pub name: String,
    pub status: String,
    pub current_round: i64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<UserId> {
        let rec = sqlx::query("INSERT INTO users (username, password) VALUES (?, ?) RETURNING id")
            .bind(username)
            .bind(password_hash)
            .fetch_one(&self.pool)
            .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_by_credentials(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, bio, avatar, status, created_at FROM users
             WHERE username = ? AND password = ?",
        )
        .bind(username)
        .bind(password_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(decode_user))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, bio, avatar, status, created_at FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(decode_user))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn list_users(&self) -> Result<Vec<(UserId, String, UserStatus)>> {
        let rows = sqlx::query("SELECT id, username, status FROM users")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    UserId(r.get::<i64, _>(0)),
                    r.get::<String, _>(1),
                    decode_status(&r.get::<String, _>(2)),
                )
            })
            .collect())
    }

    pub async fn update_user_profile(
        &self,
        user_id: UserId,
        bio: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET bio = ?, avatar = ? WHERE id = ?")
            .bind(bio)
            .bind(avatar)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_user_status(&self, user_id: UserId, status: UserStatus) -> Result<()> {
        sqlx::query("UPDATE users SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<MessageId> {
        let rec = sqlx::query(
            "INSERT INTO messages (sender_id, receiver_id, content) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(sender_id.0)
        .bind(receiver_id.0)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    pub async fn message_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, sender_id, receiver_id, content, created_at FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredMessage {
            message_id: MessageId(r.get::<i64, _>(0)),
            sender_id: UserId(r.get::<i64, _>(1)),
            receiver_id: UserId(r.get::<i64, _>(2)),
            content: r.get::<String, _>(3),
            created_at: r.get::<DateTime<Utc>, _>(4),
        }))
    }

    /// Both directions of a two-party conversation, oldest first, with the
    /// sender's username joined in for display.
    pub async fn conversation(
        &self,
        user_id: UserId,
        other_user_id: UserId,
    ) -> Result<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            "SELECT m.id, m.sender_id, m.receiver_id, m.content, m.created_at, u.username
             FROM messages m
             JOIN users u ON m.sender_id = u.id
             WHERE (m.sender_id = ? AND m.receiver_id = ?)
                OR (m.sender_id = ? AND m.receiver_id = ?)
             ORDER BY m.created_at ASC, m.id ASC",
        )
        .bind(user_id.0)
        .bind(other_user_id.0)
        .bind(other_user_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ConversationMessage {
                message_id: MessageId(r.get::<i64, _>(0)),
                sender_id: UserId(r.get::<i64, _>(1)),
                receiver_id: UserId(r.get::<i64, _>(2)),
                content: r.get::<String, _>(3),
                created_at: r.get::<DateTime<Utc>, _>(4),
                sender_username: r.get::<String, _>(5),
            })
            .collect())
    }

    pub async fn is_blocked(&self, blocker_id: UserId, blocked_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM blocked_users WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker_id.0)
            .bind(blocked_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn block_user(&self, blocker_id: UserId, blocked_id: UserId) -> Result<()> {
        sqlx::query("INSERT INTO blocked_users (blocker_id, blocked_id) VALUES (?, ?)")
            .bind(blocker_id.0)
            .bind(blocked_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn unblock_user(&self, blocker_id: UserId, blocked_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM blocked_users WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker_id.0)
            .bind(blocked_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn blocked_users(&self, user_id: UserId) -> Result<Vec<(UserId, String)>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username
             FROM users u
             JOIN blocked_users b ON u.id = b.blocked_id
             WHERE b.blocker_id = ?",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (UserId(r.get::<i64, _>(0)), r.get::<String, _>(1)))
            .collect())
    }

    pub async fn create_game_invitation(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<InviteId> {
        let rec = sqlx::query(
            "INSERT INTO game_invitations (sender_id, receiver_id) VALUES (?, ?) RETURNING id",
        )
        .bind(sender_id.0)
        .bind(receiver_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(InviteId(rec.get::<i64, _>(0)))
    }

    pub async fn update_game_invitation_status(
        &self,
        invite_id: InviteId,
        status: InviteStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE game_invitations SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(invite_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn game_invitation(&self, invite_id: InviteId) -> Result<Option<StoredInvitation>> {
        let row = sqlx::query(
            "SELECT id, sender_id, receiver_id, status FROM game_invitations WHERE id = ?",
        )
        .bind(invite_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredInvitation {
            invite_id: InviteId(r.get::<i64, _>(0)),
            sender_id: UserId(r.get::<i64, _>(1)),
            receiver_id: UserId(r.get::<i64, _>(2)),
            status: match r.get::<String, _>(3).as_str() {
                "accepted" => InviteStatus::Accepted,
                "declined" => InviteStatus::Declined,
                _ => InviteStatus::Pending,
            },
        }))
    }

    /// Inserts the tournament plus one participant row per entrant, bracket
    /// positions assigned in input order.
    pub async fn create_tournament(
        &self,
        name: &str,
        participants: &[UserId],
    ) -> Result<TournamentId> {
        let rec = sqlx::query("INSERT INTO tournaments (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        let tournament_id = TournamentId(rec.get::<i64, _>(0));

        for (index, user_id) in participants.iter().enumerate() {
            sqlx::query(
                "INSERT INTO tournament_participants (tournament_id, user_id, position)
                 VALUES (?, ?, ?)",
            )
            .bind(tournament_id.0)
            .bind(user_id.0)
            .bind(index as i64 + 1)
            .execute(&self.pool)
            .await?;
        }

        Ok(tournament_id)
    }

    pub async fn tournament(
        &self,
        tournament_id: TournamentId,
    ) -> Result<Option<StoredTournament>> {
        let row =
            sqlx::query("SELECT id, name, status, current_round FROM tournaments WHERE id = ?")
                .bind(tournament_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| StoredTournament {
            tournament_id: TournamentId(r.get::<i64, _>(0)),
            name: r.get::<String, _>(1),
            status: r.get::<String, _>(2),
            current_round: r.get::<i64, _>(3),
        }))
    }
}

fn decode_user(row: SqliteRow) -> StoredUser {
    StoredUser {
        user_id: UserId(row.get::<i64, _>(0)),
        username: row.get::<String, _>(1),
        bio: row.get::<Option<String>, _>(2),
        avatar: row.get::<Option<String>, _>(3),
        status: decode_status(&row.get::<String, _>(4)),
        created_at: row.get::<DateTime<Utc>, _>(5),
    }
}

fn decode_status(raw: &str) -> UserStatus {
    match raw {
        "online" => UserStatus::Online,
        _ => UserStatus::Offline,
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
