//! Shared helpers: a server on a random port, tokens, and socket plumbing.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use rideline_server::auth::jwt::issue_access_token;
use rideline_server::auth::Role;
use rideline_server::config::Config;
use rideline_server::state::AppState;
use rideline_server::ws::events::{ClientEvent, DriverRegisterPayload, ServerEvent};

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    pub state: AppState,
    pub http: reqwest::Client,
    _dir: tempfile::TempDir,
}

pub async fn start() -> TestServer {
    start_with(Config::default()).await
}

/// Start the server with the given tuning. Background monitors are not
/// spawned; tests drive expiry and idle close explicitly.
pub async fn start_with(config: Config) -> TestServer {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = dir.path().to_str().unwrap().to_string();

    let db = rideline_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = rideline_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    let state = AppState::new(db, jwt_secret, &config);

    let app = rideline_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        state,
        http: reqwest::Client::new(),
        _dir: dir,
    }
}

impl TestServer {
    pub fn token(&self, id: &str, name: &str, role: Role) -> String {
        issue_access_token(&self.state.jwt_secret, id, name, role).unwrap()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn connect(&self, token: &str) -> WsStream {
        let url = format!("ws://{}/ws?token={}", self.addr, token);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .expect("Failed to connect WebSocket");
        ws
    }

    /// Mark a driver license-verified via the admin endpoint.
    pub async fn verify_driver(&self, driver_id: &str, name: &str) {
        let admin = self.token("adm-root", "Root", Role::Admin);
        let resp = self
            .http
            .put(self.url(&format!("/api/admin/drivers/{}", driver_id)))
            .bearer_auth(admin)
            .json(&json!({ "displayName": name, "licenseVerified": true }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    /// Verified driver with a registered socket, ready for broadcasts.
    pub async fn online_driver(&self, driver_id: &str) -> (String, WsStream) {
        self.verify_driver(driver_id, driver_id).await;
        let token = self.token(driver_id, driver_id, Role::Driver);
        let mut ws = self.connect(&token).await;
        send(
            &mut ws,
            &ClientEvent::DriverRegister(DriverRegisterPayload {
                driver_id: driver_id.to_string(),
            }),
        )
        .await;
        expect_event(&mut ws, "driver_registered").await;
        (token, ws)
    }

    pub async fn post(&self, token: &str, path: &str, body: Option<Value>) -> reqwest::Response {
        let mut req = self.http.post(self.url(path)).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        req.send().await.unwrap()
    }

    pub async fn get(&self, token: &str, path: &str) -> reqwest::Response {
        self.http
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }
}

pub fn ride_request_body(booking_id: &str) -> Value {
    json!({
        "bookingId": booking_id,
        "car": { "id": "car-7", "make": "Skoda", "model": "Octavia", "year": 2024 },
        "pickupLocation": "Hauptbahnhof, Gleis 1",
        "pickupAt": "2026-11-02T09:00:00Z",
        "returnAt": "2026-11-04T09:00:00Z",
        "price": { "dailyRateCents": 3900, "totalCents": 7800, "currency": "EUR" }
    })
}

pub async fn send(ws: &mut WsStream, event: &ClientEvent) {
    let text = serde_json::to_string(event).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Next server event with the given name, skipping others. `None` on timeout.
pub async fn next_named(ws: &mut WsStream, name: &str, wait: Duration) -> Option<ServerEvent> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let event: ServerEvent = serde_json::from_str(text.as_str()).unwrap();
                if event.name() == name {
                    return Some(event);
                }
            }
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

pub async fn expect_event(ws: &mut WsStream, name: &str) -> ServerEvent {
    next_named(ws, name, Duration::from_secs(3))
        .await
        .unwrap_or_else(|| panic!("expected {} event", name))
}

/// Round-trip a cheap request so every earlier frame on this socket has
/// been handled by the server.
pub async fn barrier(ws: &mut WsStream) {
    send(ws, &ClientEvent::GetOnlineUsers).await;
    expect_event(ws, "onlineUsers").await;
}
