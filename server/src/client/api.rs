//! REST client. Every call here returns authoritative server state.

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::auth::Role;
use crate::chat::{ChatMessage, ChatSession, ChatStatus, SenderRole};
use crate::client::{ClientConfig, ClientError};
use crate::db::models::{ActivityLog, Driver};
use crate::dispatch::drivers::UpdateDriverRequest;
use crate::dispatch::{NewRideRequest, RideRequest};
use crate::error::ErrorCategory;
use crate::presence::Participant;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    category: ErrorCategory,
    code: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            token: token.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let resp = check(req.send().await?).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn send_empty(&self, req: RequestBuilder) -> Result<(), ClientError> {
        check(req.send().await?).await?;
        Ok(())
    }

    // --- Dispatch ---

    pub async fn create_ride_request(
        &self,
        body: &NewRideRequest,
    ) -> Result<RideRequest, ClientError> {
        self.send(self.request(Method::POST, "/api/ride-requests").json(body))
            .await
    }

    pub async fn get_ride_request(&self, request_id: &str) -> Result<RideRequest, ClientError> {
        self.send(self.request(Method::GET, &format!("/api/ride-requests/{}", request_id)))
            .await
    }

    /// REST path to the same arbiter as `driver:accept`.
    pub async fn accept_ride_request(&self, request_id: &str) -> Result<RideRequest, ClientError> {
        self.send(self.request(
            Method::POST,
            &format!("/api/ride-requests/{}/accept", request_id),
        ))
        .await
    }

    pub async fn decline_ride_request(&self, request_id: &str) -> Result<(), ClientError> {
        self.send_empty(self.request(
            Method::POST,
            &format!("/api/ride-requests/{}/decline", request_id),
        ))
        .await
    }

    pub async fn cancel_ride_request(&self, request_id: &str) -> Result<RideRequest, ClientError> {
        self.send(self.request(
            Method::POST,
            &format!("/api/ride-requests/{}/cancel", request_id),
        ))
        .await
    }

    /// Open requests the calling driver may still accept.
    pub async fn list_driver_requests(&self) -> Result<Vec<RideRequest>, ClientError> {
        self.send(self.request(Method::GET, "/api/driver/requests"))
            .await
    }

    pub async fn update_driver(
        &self,
        driver_id: &str,
        display_name: &str,
        license_verified: bool,
    ) -> Result<Driver, ClientError> {
        let body = UpdateDriverRequest {
            display_name: display_name.to_string(),
            license_verified,
        };
        self.send(
            self.request(Method::PUT, &format!("/api/admin/drivers/{}", driver_id))
                .json(&body),
        )
        .await
    }

    // --- Chat ---

    pub async fn open_chat_session(&self) -> Result<ChatSession, ClientError> {
        self.send(self.request(Method::POST, "/api/chat/sessions"))
            .await
    }

    pub async fn get_chat_session(&self, session_id: &str) -> Result<ChatSession, ClientError> {
        self.send(self.request(Method::GET, &format!("/api/chat/sessions/{}", session_id)))
            .await
    }

    pub async fn list_chat_sessions(
        &self,
        status: Option<ChatStatus>,
    ) -> Result<Vec<ChatSession>, ClientError> {
        let mut req = self.request(Method::GET, "/api/chat/sessions");
        if let Some(status) = status {
            req = req.query(&[("status", status.as_str())]);
        }
        self.send(req).await
    }

    pub async fn post_chat_message(
        &self,
        session_id: &str,
        sender_role: SenderRole,
        message: &str,
    ) -> Result<ChatMessage, ClientError> {
        self.send(
            self.request(Method::POST, &format!("/api/chat/sessions/{}/messages", session_id))
                .json(&json!({ "senderRole": sender_role, "message": message })),
        )
        .await
    }

    pub async fn escalate_chat(&self, session_id: &str) -> Result<ChatSession, ClientError> {
        self.chat_action(session_id, "escalate").await
    }

    pub async fn join_chat(&self, session_id: &str) -> Result<ChatSession, ClientError> {
        self.chat_action(session_id, "join").await
    }

    pub async fn close_chat(&self, session_id: &str) -> Result<ChatSession, ClientError> {
        self.chat_action(session_id, "close").await
    }

    pub async fn handoff_chat(
        &self,
        session_id: &str,
        to_admin_id: &str,
    ) -> Result<ChatSession, ClientError> {
        self.send(
            self.request(Method::POST, &format!("/api/chat/sessions/{}/handoff", session_id))
                .json(&json!({ "toAdminId": to_admin_id })),
        )
        .await
    }

    async fn chat_action(
        &self,
        session_id: &str,
        action: &str,
    ) -> Result<ChatSession, ClientError> {
        self.send(self.request(
            Method::POST,
            &format!("/api/chat/sessions/{}/{}", session_id, action),
        ))
        .await
    }

    // --- Presence / activity ---

    pub async fn list_presence(&self, role: Option<Role>) -> Result<Vec<Participant>, ClientError> {
        let mut req = self.request(Method::GET, "/api/presence");
        if let Some(role) = role {
            req = req.query(&[("role", role.as_str())]);
        }
        self.send(req).await
    }

    pub async fn activity_logs(&self, limit: u32) -> Result<Vec<ActivityLog>, ClientError> {
        self.send(
            self.request(Method::GET, "/api/activity-logs")
                .query(&[("limit", limit)]),
        )
        .await
    }
}

/// Map a non-success response to the server's typed error body.
async fn check(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let err = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => ClientError::Api {
            status: status.as_u16(),
            category: parsed.category,
            code: parsed.code,
            message: parsed.error,
        },
        Err(_) => ClientError::Api {
            status: status.as_u16(),
            category: if status.is_server_error() {
                ErrorCategory::Internal
            } else if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                ErrorCategory::Authorization
            } else {
                ErrorCategory::Invalid
            },
            code: status.as_str().to_string(),
            message: body,
        },
    };
    tracing::debug!(status = status.as_u16(), code = err.code(), "API call failed");
    Err(err)
}
