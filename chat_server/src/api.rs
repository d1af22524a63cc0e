use crate::auth::{self, TokenKeys};
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::db;
use crate::error::ChatError;
use crate::gateway::ChatService;
use crate::identity::SqliteDirectory;
use crate::ws;
use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chat_protocol::User;
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use uuid::Uuid;

const POOL_SIZE: u32 = 16;

#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let pool = db::open_pool(config.db_path(), POOL_SIZE)?;
        let secret = match &config.jwt_secret {
            Some(s) => s.as_bytes().to_vec(),
            None => auth::load_or_create_secret(&config.secret_path()).await?,
        };
        let keys = TokenKeys::new(secret, time::Duration::hours(config.token_ttl_hours));
        let identity = Arc::new(SqliteDirectory::new(pool.clone(), keys));
        let broadcaster = Broadcaster::new(config.queue_capacity);
        Ok(Self {
            service: ChatService::new(pool, identity, broadcaster),
            config,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/me", get(me))
        .route("/api/users", get(search_users))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/direct", post(open_direct))
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/groups", post(create_group))
        .route("/api/groups/:id", patch(rename_group).delete(delete_group))
        .route("/api/groups/:id/members", post(add_member))
        .route("/api/groups/:id/members/:user_id", delete(remove_member))
        .route("/api/groups/:id/admins", post(grant_admin))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/signup", post(signup))
        .route("/api/login", post(login))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn bearer(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: axum::http::Request<B>,
    next: Next<B>,
) -> Result<Response, ChatError> {
    let token = bearer(req.headers()).map(str::to_owned);
    let user = state.service.authenticate(token.as_deref()).await?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) | ChatError::NotAMember => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(self.to_rpc())).into_response()
    }
}

type ApiResult<T> = Result<T, ChatError>;

#[derive(Deserialize)]
struct SignupReq {
    #[serde(alias = "name")]
    user_name: String,
    email: String,
    password: String,
}

async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupReq>,
) -> ApiResult<impl IntoResponse> {
    let resp = state
        .service
        .signup(&req.user_name, &req.email, &req.password)
        .await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

#[derive(Deserialize)]
struct LoginReq {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> ApiResult<impl IntoResponse> {
    let resp = state.service.login(&req.email, &req.password).await?;
    Ok(Json(resp))
}

async fn me(Extension(user): Extension<User>) -> Json<User> {
    Json(user)
}

#[derive(Deserialize)]
struct SearchQuery {
    search: Option<String>,
}

async fn search_users(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(q): Query<SearchQuery>,
) -> ApiResult<impl IntoResponse> {
    let users = state
        .service
        .search_users(&user, q.search.as_deref())
        .await?;
    Ok(Json(users))
}

#[derive(Deserialize)]
struct UserRef {
    user_id: Uuid,
}

async fn open_direct(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<UserRef>,
) -> ApiResult<impl IntoResponse> {
    let conv = state
        .service
        .get_or_create_direct_conversation(&user, req.user_id)
        .await?;
    Ok(Json(conv))
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_my_conversations(&user).await?))
}

#[derive(Deserialize)]
struct PageQuery {
    before: Option<Uuid>,
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let messages = state
        .service
        .list_messages(&user, id, page.before, page.limit)
        .await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
struct SendReq {
    content: String,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendReq>,
) -> ApiResult<impl IntoResponse> {
    let msg = state.service.send_message(&user, id, &req.content).await?;
    Ok((StatusCode::CREATED, Json(msg)))
}

#[derive(Deserialize)]
struct CreateGroupReq {
    name: Option<String>,
    users: Vec<Uuid>,
}

async fn create_group(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<CreateGroupReq>,
) -> ApiResult<impl IntoResponse> {
    let group = state
        .service
        .create_group(&user, req.name, req.users)
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

#[derive(Deserialize)]
struct RenameReq {
    name: String,
}

async fn rename_group(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameReq>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.rename_group(&user, id, &req.name).await?))
}

async fn delete_group(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.delete_group(&user, id).await?))
}

async fn add_member(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
    Json(req): Json<UserRef>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.add_member(&user, id, req.user_id).await?))
}

async fn remove_member(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.remove_member(&user, id, user_id).await?))
}

async fn grant_admin(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
    Json(req): Json<UserRef>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.grant_admin(&user, id, req.user_id).await?))
}

async fn ws_handler(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| ws::handle_socket(socket, state.service, user))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Run the HTTP server until interrupted.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;
    let state = AppState::new(config).await?;
    tracing::info!(%addr, "chat server listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
