use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use huddle_api::error::ApiError;
use huddle_api::identity::JwtResolver;
use huddle_api::middleware::require_auth;
use huddle_api::{AppState, AppStateInner, groups, messages};
use huddle_gateway::connection;
use huddle_gateway::sessions::SessionRegistry;

#[derive(Clone)]
struct ServerState {
    app: AppState,
    registry: SessionRegistry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("HUDDLE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("HUDDLE_DB_PATH").unwrap_or_else(|_| "huddle.db".into());
    let host = std::env::var("HUDDLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("HUDDLE_PORT")
        .unwrap_or_else(|_| "8888".into())
        .parse()?;

    // Init database
    let db = Arc::new(huddle_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let registry = SessionRegistry::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        resolver: Arc::new(JwtResolver::new(&jwt_secret)),
    });

    let state = ServerState {
        app: app_state.clone(),
        registry,
    };

    // Routes
    let public_routes = Router::new().route("/health", get(|| async { "ok" }));

    let protected_routes = Router::new()
        .route("/messages", post(messages::send_message))
        .route("/messages/inbox", get(messages::inbox))
        .route("/messages/sent", get(messages::sent))
        .route("/messages/conversations", get(messages::conversations))
        .route(
            "/messages/conversation/{user_id}",
            get(messages::conversation_with),
        )
        .route("/messages/unread-count", get(messages::unread_count))
        .route("/messages/{message_id}/read", put(messages::mark_read))
        .route("/messages/{message_id}", delete(messages::delete_message))
        .route(
            "/messages/groups",
            get(groups::list_groups).post(groups::create_group),
        )
        .route(
            "/messages/groups/{group_id}/messages",
            get(groups::group_messages).post(groups::send_group_message),
        )
        .route(
            "/messages/groups/{group_id}/members",
            get(groups::group_members).post(groups::add_member),
        )
        .route(
            "/messages/groups/{group_id}/members/{member_id}",
            delete(groups::remove_member),
        )
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Huddle server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// Authenticate the upgrade BEFORE admitting the connection: the token is
/// resolved here, and a failure is an HTTP 401 with no WebSocket. The
/// client must reconnect with a valid token; the server never retries.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let token = query.token.ok_or(ApiError::Unauthorized)?;
    let identity = state.app.resolver.resolve(&token).map_err(|_| {
        warn!("gateway upgrade rejected: unresolvable token");
        ApiError::Unauthorized
    })?;

    // Mirror the identity so gateway-side receiver lookups can see it
    let db = state.app.db.clone();
    let mirrored = identity.clone();
    tokio::task::spawn_blocking(move || db.upsert_user(&mirrored))
        .await
        .map_err(|_| ApiError::Internal)?
        .map_err(ApiError::from)?;

    let db = state.app.db.clone();
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.registry, db, identity)
    }))
}
