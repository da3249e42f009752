use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use trefla_shared::permission::{AdminGrant, Permission};
use trefla_shared::protocol::ChatView;
use trefla_shared::types::{
    AdminNotificationId, AdminNotificationType, ChatId, NotificationId, UserId,
};
use trefla_store::{AdminNotification, Message, User};

use crate::config::ServerConfig;
use crate::engine::{CardOwnership, ClaimWithdrawal, TransferReply, TransferRequest, Verification};
use crate::error::ServerError;
use crate::ws;

/// Header carrying the calling user's id.
pub const USER_HEADER: &str = "x-user-id";

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

#[derive(Clone)]
pub struct AppState {
    pub engine: CardOwnership,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/:user_id", get(ws::ws_handler))
        .route("/me/card", post(submit_card))
        .route("/me/device-token", post(set_device_token))
        .route("/me/chats", get(chat_summary))
        .route("/me/notifications/read", post(mark_notifications_read))
        .route("/cards/:card_number/transfer-requests", post(request_transfer))
        .route("/notifications/:id/transfer-reply", post(reply_transfer))
        .route("/chats/card", post(open_card_chat))
        .route("/chats/:chat_id/messages", get(list_messages).post(send_message))
        .route("/admin/users/:user_id/verify", post(admin_verify))
        .route("/admin/users/:user_id/unverify", post(admin_unverify))
        .route("/admin/users/:user_id/reject", post(admin_reject))
        .route("/admin/id-transfers", get(admin_list_transfers))
        .route(
            "/admin/id-transfers/:id",
            get(admin_get_transfer).delete(admin_delete_transfer),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Success envelope.  Failures render through [`ServerError`] as
/// `{status: false, message}`.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    status: bool,
    message: &'static str,
    data: T,
}

fn ok<T: Serialize>(message: &'static str, data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        status: true,
        message,
        data,
    })
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ServerError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    name: String,
    sessions: usize,
}

#[derive(Deserialize)]
struct SubmitCardRequest {
    #[serde(default)]
    card_number: String,
    #[serde(default)]
    card_img_url: String,
}

#[derive(Deserialize)]
struct DeviceTokenRequest {
    device_token: String,
}

#[derive(Deserialize)]
struct TransferReplyRequest {
    accept: bool,
}

#[derive(Deserialize)]
struct OpenCardChatRequest {
    card_number: String,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    text: String,
}

#[derive(Deserialize)]
struct RejectRequest {
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct Page {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        name: state.config.instance_name.clone(),
        sessions: state.engine.sessions().session_count().await,
    })
}

// ─── Caller identity ───

fn caller(headers: &HeaderMap) -> Result<UserId, ServerError> {
    let raw = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::Permission(format!("Missing {USER_HEADER} header")))?;
    raw.trim()
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| ServerError::Validation(format!("Invalid {USER_HEADER} header: {raw}")))
}

/// Resolve the admin behind the bearer token and check one permission.
fn require_admin(
    headers: &HeaderMap,
    state: &AppState,
    permission: Permission,
) -> Result<AdminGrant, ServerError> {
    let Some(ref expected) = state.config.admin_token else {
        return Err(ServerError::Permission(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth).trim();
    if token.is_empty() {
        return Err(ServerError::Permission("Missing admin token".into()));
    }

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    let grant = if token_bytes.len() == expected_bytes.len()
        && token_bytes.ct_eq(expected_bytes).unwrap_u8() == 1
    {
        AdminGrant::superuser()
    } else {
        state
            .engine
            .with_db(|db| Ok(db.get_admin_by_token(token)?))?
            .map(|admin| admin.grant())
            .ok_or_else(|| ServerError::Permission("Invalid admin token".into()))?
    };

    if !grant.allows(permission) {
        return Err(ServerError::Permission(format!(
            "Missing permission {}",
            permission.path()
        )));
    }
    Ok(grant)
}

// ─── User endpoints ───

async fn submit_card(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<SubmitCardRequest>,
) -> ApiResult<User> {
    let user_id = caller(&headers)?;
    let user = state
        .engine
        .submit_card(user_id, &req.card_number, &req.card_img_url)
        .await?;
    Ok(ok("Card submitted", user))
}

async fn set_device_token(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<DeviceTokenRequest>,
) -> ApiResult<bool> {
    let user_id = caller(&headers)?;
    let updated = state
        .engine
        .with_db(|db| Ok(db.set_device_token(user_id, req.device_token.trim())?))?;
    if !updated {
        return Err(ServerError::NotFound(format!("User {user_id} not found")));
    }
    Ok(ok("Device token saved", true))
}

async fn chat_summary(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Vec<ChatView>> {
    let user_id = caller(&headers)?;
    Ok(ok("Chats", state.engine.chat_summary(user_id)?))
}

async fn mark_notifications_read(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<bool> {
    let user_id = caller(&headers)?;
    state.engine.mark_notifications_read(user_id)?;
    Ok(ok("Notifications marked as read", true))
}

async fn request_transfer(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(card_number): Path<String>,
) -> ApiResult<TransferRequest> {
    let user_id = caller(&headers)?;
    Ok(ok("Transfer request sent", state.engine.request_transfer(user_id, &card_number).await?))
}

async fn reply_transfer(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<NotificationId>,
    Json(req): Json<TransferReplyRequest>,
) -> ApiResult<TransferReply> {
    let user_id = caller(&headers)?;
    Ok(ok("Transfer request answered", state.engine.reply_transfer(user_id, id, req.accept).await?))
}

async fn open_card_chat(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<OpenCardChatRequest>,
) -> ApiResult<ChatView> {
    let user_id = caller(&headers)?;
    Ok(ok("Chat opened", state.engine.open_card_chat(user_id, &req.card_number).await?))
}

async fn send_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Message> {
    let user_id = caller(&headers)?;
    Ok(ok("Message sent", state.engine.send_message(chat_id, user_id, &req.text).await?))
}

async fn list_messages(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Query(page): Query<Page>,
) -> ApiResult<Vec<Message>> {
    let user_id = caller(&headers)?;
    let limit = page.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let offset = page.offset.unwrap_or(0);

    let messages = state.engine.with_db(|db| {
        let chat = db.get_chat(chat_id)?;
        if chat.slot_of(user_id).is_none() {
            return Err(ServerError::Permission(
                "You are not a participant of this chat".into(),
            ));
        }
        Ok(db.messages_for_chat(chat_id, limit, offset)?)
    })?;
    Ok(ok("Messages", messages))
}

// ─── Admin endpoints ───

async fn admin_verify(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Verification> {
    let grant = require_admin(&headers, &state, Permission::IdentityVerify)?;
    info!(user = %user_id, role = grant.role.as_str(), "Admin verifying card");
    Ok(ok("Card verified", state.engine.verify(user_id).await?))
}

async fn admin_unverify(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<ClaimWithdrawal> {
    let grant = require_admin(&headers, &state, Permission::IdentityVerify)?;
    info!(user = %user_id, role = grant.role.as_str(), "Admin unverifying card");
    Ok(ok("Card unverified", state.engine.unverify(user_id).await?))
}

async fn admin_reject(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<ClaimWithdrawal> {
    let grant = require_admin(&headers, &state, Permission::DriverIdReject)?;
    info!(user = %user_id, role = grant.role.as_str(), "Admin rejecting card");
    Ok(ok("Card rejected", state.engine.reject(user_id, &req.reason).await?))
}

async fn admin_list_transfers(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Vec<AdminNotification>> {
    require_admin(&headers, &state, Permission::IdTransferShow)?;
    let items = state
        .engine
        .with_db(|db| Ok(db.list_admin_notifications(AdminNotificationType::IdTransfer)?))?;
    Ok(ok("ID transfer requests", items))
}

fn load_transfer(
    state: &AppState,
    id: AdminNotificationId,
) -> Result<AdminNotification, ServerError> {
    let item = state.engine.with_db(|db| Ok(db.get_admin_notification(id)?))?;
    if item.kind != AdminNotificationType::IdTransfer {
        return Err(ServerError::NotFound(format!("ID transfer {id} not found")));
    }
    Ok(item)
}

async fn admin_get_transfer(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<AdminNotificationId>,
) -> ApiResult<AdminNotification> {
    require_admin(&headers, &state, Permission::IdTransferShow)?;
    Ok(ok("ID transfer request", load_transfer(&state, id)?))
}

async fn admin_delete_transfer(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<AdminNotificationId>,
) -> ApiResult<bool> {
    require_admin(&headers, &state, Permission::IdTransferShow)?;
    load_transfer(&state, id)?;
    let deleted = state
        .engine
        .with_db(|db| Ok(db.delete_admin_notification(id)?))?;
    info!(id = %id, "ID transfer work item deleted");
    Ok(ok("ID transfer request deleted", deleted))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
