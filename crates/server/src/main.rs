use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use realtime::{ClientHandle, DeliveryRouter, NotificationBroadcaster, SessionRegistry};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{InviteId, InviteStatus, TournamentId, UserId, UserStatus},
    error::{ApiError, ErrorCode},
    protocol::{BlockedUser, MessageHistoryEntry, ServerFrame, UserProfile, UserSummary},
};
use storage::Storage;
use tracing::{error, info};

mod auth;
mod config;

use auth::hash_password;
use config::{load_settings, normalize_database_url};

#[derive(Clone)]
struct AppState {
    storage: Storage,
    registry: Arc<SessionRegistry>,
    router: Arc<DeliveryRouter>,
    broadcaster: NotificationBroadcaster,
}

#[derive(Debug, Deserialize)]
struct CredentialsRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct AuthResponse {
    id: i64,
    username: String,
}

#[derive(Debug, Deserialize)]
struct ProfileUpdateRequest {
    bio: Option<String>,
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockRequest {
    blocker_id: i64,
    blocked_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameInviteRequest {
    sender_id: i64,
    receiver_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GameInviteResponse {
    success: bool,
    invite_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InviteRespondRequest {
    invite_id: i64,
    status: InviteStatus,
}

#[derive(Debug, Deserialize)]
struct CreateTournamentRequest {
    name: String,
    participants: Vec<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTournamentResponse {
    success: bool,
    tournament_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TournamentNotifyRequest {
    player1_id: i64,
    player2_id: i64,
    round: i64,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|err| {
        error!(
            %database_url,
            %err,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        err
    })?;

    let registry = Arc::new(SessionRegistry::new());
    let router = Arc::new(DeliveryRouter::new(registry.clone(), storage.clone()));
    let broadcaster = NotificationBroadcaster::new(registry.clone());

    let state = AppState {
        storage,
        registry,
        router,
        broadcaster,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/users", get(list_users))
        .route("/api/users/:id", get(get_user).put(update_profile))
        .route("/api/messages/:user_id/:other_user_id", get(conversation))
        .route("/api/block", post(block_user))
        .route("/api/unblock", post(unblock_user))
        .route("/api/blocked/:user_id", get(blocked_users))
        .route("/api/game-invite", post(create_game_invite))
        .route("/api/game-invite/respond", post(respond_game_invite))
        .route("/api/tournament", post(create_tournament))
        .route("/api/tournament/:id/notify", post(notify_tournament_match))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn internal(err: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, err.to_string())),
    )
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, Json<ApiError>)> {
    let password_hash = hash_password(&req.password);
    let user_id = state
        .storage
        .create_user(&req.username, &password_hash)
        .await
        .map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(ApiError::new(ErrorCode::Validation, "Username already exists")),
            )
        })?;

    Ok(Json(AuthResponse {
        id: user_id.0,
        username: req.username,
    }))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, Json<ApiError>)> {
    let password_hash = hash_password(&req.password);
    let user = state
        .storage
        .user_by_credentials(&req.username, &password_hash)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new(ErrorCode::Unauthorized, "Invalid credentials")),
            )
        })?;

    state
        .storage
        .update_user_status(user.user_id, UserStatus::Online)
        .await
        .map_err(internal)?;

    Ok(Json(AuthResponse {
        id: user.user_id.0,
        username: user.username,
    }))
}

async fn list_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<UserSummary>>, (StatusCode, Json<ApiError>)> {
    let users = state.storage.list_users().await.map_err(internal)?;
    Ok(Json(
        users
            .into_iter()
            .map(|(id, username, status)| UserSummary {
                id,
                username,
                status,
            })
            .collect(),
    ))
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<UserProfile>, (StatusCode, Json<ApiError>)> {
    let user = state
        .storage
        .user_by_id(UserId(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ApiError::new(ErrorCode::NotFound, "User not found")),
            )
        })?;

    Ok(Json(UserProfile {
        id: user.user_id,
        username: user.username,
        bio: user.bio,
        avatar: user.avatar,
        status: user.status,
        created_at: user.created_at,
    }))
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ProfileUpdateRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ApiError>)> {
    state
        .storage
        .update_user_profile(UserId(id), req.bio.as_deref(), req.avatar.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn conversation(
    State(state): State<Arc<AppState>>,
    Path((user_id, other_user_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<MessageHistoryEntry>>, (StatusCode, Json<ApiError>)> {
    let messages = state
        .storage
        .conversation(UserId(user_id), UserId(other_user_id))
        .await
        .map_err(internal)?;
    Ok(Json(
        messages
            .into_iter()
            .map(|m| MessageHistoryEntry {
                id: m.message_id,
                sender_id: m.sender_id,
                receiver_id: m.receiver_id,
                content: m.content,
                created_at: m.created_at,
                sender_username: m.sender_username,
            })
            .collect(),
    ))
}

async fn block_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ApiError>)> {
    state
        .storage
        .block_user(UserId(req.blocker_id), UserId(req.blocked_id))
        .await
        .map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(ApiError::new(ErrorCode::Validation, "Failed to block user")),
            )
        })?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn unblock_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ApiError>)> {
    state
        .storage
        .unblock_user(UserId(req.blocker_id), UserId(req.blocked_id))
        .await
        .map_err(internal)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn blocked_users(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<BlockedUser>>, (StatusCode, Json<ApiError>)> {
    let blocked = state
        .storage
        .blocked_users(UserId(user_id))
        .await
        .map_err(internal)?;
    Ok(Json(
        blocked
            .into_iter()
            .map(|(id, username)| BlockedUser { id, username })
            .collect(),
    ))
}

async fn create_game_invite(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GameInviteRequest>,
) -> Result<Json<GameInviteResponse>, (StatusCode, Json<ApiError>)> {
    let sender_id = UserId(req.sender_id);
    let receiver_id = UserId(req.receiver_id);

    let blocked = state
        .storage
        .is_blocked(receiver_id, sender_id)
        .await
        .map_err(internal)?;
    if blocked {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ApiError::new(
                ErrorCode::Forbidden,
                "Cannot send invitation to this user",
            )),
        ));
    }

    let invite_id = state
        .storage
        .create_game_invitation(sender_id, receiver_id)
        .await
        .map_err(internal)?;

    if let Some(sender_username) = state
        .storage
        .username_for_user(sender_id)
        .await
        .map_err(internal)?
    {
        state.broadcaster.push(
            receiver_id,
            ServerFrame::GameInvitation {
                invite_id,
                sender_id,
                sender_username,
            },
        );
    }

    Ok(Json(GameInviteResponse {
        success: true,
        invite_id: invite_id.0,
    }))
}

async fn respond_game_invite(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InviteRespondRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ApiError>)> {
    let invite_id = InviteId(req.invite_id);
    state
        .storage
        .update_game_invitation_status(invite_id, req.status)
        .await
        .map_err(internal)?;

    if let Some(invite) = state
        .storage
        .game_invitation(invite_id)
        .await
        .map_err(internal)?
    {
        state.broadcaster.push(
            invite.sender_id,
            ServerFrame::GameInvitationResponse {
                invite_id,
                status: req.status,
                opponent_id: invite.receiver_id,
            },
        );
    }

    Ok(Json(SuccessResponse { success: true }))
}

async fn create_tournament(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTournamentRequest>,
) -> Result<Json<CreateTournamentResponse>, (StatusCode, Json<ApiError>)> {
    let participants: Vec<UserId> = req.participants.into_iter().map(UserId).collect();
    let tournament_id = state
        .storage
        .create_tournament(&req.name, &participants)
        .await
        .map_err(internal)?;
    Ok(Json(CreateTournamentResponse {
        success: true,
        tournament_id: tournament_id.0,
    }))
}

async fn notify_tournament_match(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<TournamentNotifyRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ApiError>)> {
    let tournament = state
        .storage
        .tournament(TournamentId(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ApiError::new(ErrorCode::NotFound, "Tournament not found")),
            )
        })?;

    let player1 = UserId(req.player1_id);
    let player2 = UserId(req.player2_id);
    let pairing_for = |opponent_id: UserId| ServerFrame::TournamentMatch {
        tournament_id: tournament.tournament_id,
        tournament_name: tournament.name.clone(),
        round: req.round,
        opponent_id,
    };
    state.broadcaster.push(player1, pairing_for(player2));
    state.broadcaster.push(player2, pairing_for(player1));

    Ok(Json(SuccessResponse { success: true }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<ServerFrame>();
    let handle = ClientHandle::new(state.registry.issue_conn_id(), outbound_tx);

    // Single writer per connection: frames queued by this connection's
    // router work and by broadcaster pushes leave in queue order.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        if let Message::Text(text) = message {
            state.router.handle_text(&handle, &text).await;
        }
    }

    state.router.connection_closed(handle.conn_id()).await;
    writer.abort();
}
