use axum::{middleware, routing, Router};

use crate::activity;
use crate::auth::middleware::JwtSecret;
use crate::chat::routes as chat_routes;
use crate::dispatch::{drivers, routes as dispatch_routes};
use crate::presence;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let dispatch = Router::new()
        .route(
            "/api/ride-requests",
            routing::post(dispatch_routes::create_ride_request),
        )
        .route(
            "/api/ride-requests/{id}",
            routing::get(dispatch_routes::get_ride_request),
        )
        .route(
            "/api/ride-requests/{id}/accept",
            routing::post(dispatch_routes::accept_ride_request),
        )
        .route(
            "/api/ride-requests/{id}/decline",
            routing::post(dispatch_routes::decline_ride_request),
        )
        .route(
            "/api/ride-requests/{id}/cancel",
            routing::post(dispatch_routes::cancel_ride_request),
        )
        .route(
            "/api/driver/requests",
            routing::get(dispatch_routes::list_driver_requests),
        );

    let chat = Router::new()
        .route(
            "/api/chat/sessions",
            routing::post(chat_routes::open_session).get(chat_routes::list_sessions),
        )
        .route("/api/chat/sessions/{id}", routing::get(chat_routes::get_session))
        .route(
            "/api/chat/sessions/{id}/messages",
            routing::post(chat_routes::post_message),
        )
        .route(
            "/api/chat/sessions/{id}/escalate",
            routing::post(chat_routes::escalate),
        )
        .route("/api/chat/sessions/{id}/join", routing::post(chat_routes::join))
        .route(
            "/api/chat/sessions/{id}/handoff",
            routing::post(chat_routes::handoff),
        )
        .route("/api/chat/sessions/{id}/close", routing::post(chat_routes::close));

    // Admin routes (role checked inside each handler)
    let admin = Router::new()
        .route("/api/admin/drivers/{id}", routing::put(drivers::update_driver))
        .route(
            "/api/activity-logs",
            routing::get(activity::list_activity_logs),
        );

    let presence_routes =
        Router::new().route("/api/presence", routing::get(presence::get_presence));

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", routing::get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", routing::get(health_check));

    Router::new()
        .merge(dispatch)
        .merge(chat)
        .merge(admin)
        .merge(presence_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
