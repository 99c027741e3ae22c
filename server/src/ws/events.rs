//! Socket event taxonomy.
//!
//! Every frame is a JSON text message `{"event": "<name>", "data": {...}}`.
//! Payload fields are camelCase. The same types are used by the server and
//! by `crate::client`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatSession, SenderRole};
use crate::db::models::ActivityLog;
use crate::dispatch::{CarSummary, CloseReason, PriceTerms, RideRequest};
use crate::error::ErrorCategory;
use crate::presence::Participant;

// --- Server -> client ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "driver_request")]
    DriverRequest(DriverRequestEvent),
    #[serde(rename = "driver_closed")]
    DriverClosed(DriverClosedEvent),
    #[serde(rename = "driver_accepted")]
    DriverAccepted(DriverAcceptedEvent),
    #[serde(rename = "driver_register_error")]
    DriverRegisterError(MessageEvent),
    #[serde(rename = "driver_registered")]
    DriverRegistered(DriverRegisteredEvent),
    #[serde(rename = "newSupportRequest")]
    NewSupportRequest(SessionEvent),
    #[serde(rename = "chatUpdate")]
    ChatUpdate(SessionEvent),
    #[serde(rename = "adminJoined")]
    AdminJoined(AdminJoinedEvent),
    #[serde(rename = "newActivityLog")]
    NewActivityLog(ActivityLogEvent),
    #[serde(rename = "newMessage")]
    NewMessage(NewMessageEvent),
    #[serde(rename = "userTyping")]
    UserTyping(UserTypingEvent),
    #[serde(rename = "participant_online")]
    ParticipantOnline(PresenceEvent),
    #[serde(rename = "participant_offline")]
    ParticipantOffline(PresenceEvent),
    #[serde(rename = "onlineUsers")]
    OnlineUsers(OnlineUsersEvent),
    #[serde(rename = "error")]
    Error(ErrorEvent),
}

impl ServerEvent {
    /// Wire name, also the topic clients subscribe to.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DriverRequest(_) => "driver_request",
            Self::DriverClosed(_) => "driver_closed",
            Self::DriverAccepted(_) => "driver_accepted",
            Self::DriverRegisterError(_) => "driver_register_error",
            Self::DriverRegistered(_) => "driver_registered",
            Self::NewSupportRequest(_) => "newSupportRequest",
            Self::ChatUpdate(_) => "chatUpdate",
            Self::AdminJoined(_) => "adminJoined",
            Self::NewActivityLog(_) => "newActivityLog",
            Self::NewMessage(_) => "newMessage",
            Self::UserTyping(_) => "userTyping",
            Self::ParticipantOnline(_) => "participant_online",
            Self::ParticipantOffline(_) => "participant_offline",
            Self::OnlineUsers(_) => "onlineUsers",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRequestEvent {
    pub request_id: String,
    pub booking_id: String,
    pub car: CarSummary,
    pub pickup_location: String,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    pub price: PriceTerms,
    /// Authoritative creation time; client countdowns derive from this.
    pub requested_at: i64,
}

impl From<&RideRequest> for DriverRequestEvent {
    fn from(request: &RideRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            booking_id: request.booking_id.clone(),
            car: request.car.clone(),
            pickup_location: request.pickup_location.clone(),
            pickup_at: request.pickup_at,
            return_at: request.return_at,
            price: request.price.clone(),
            requested_at: request.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverClosedEvent {
    pub booking_id: String,
    pub request_id: String,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverAcceptedEvent {
    pub booking_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRegisteredEvent {
    pub driver_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: String,
    pub session: ChatSession,
}

impl From<&ChatSession> for SessionEvent {
    fn from(session: &ChatSession) -> Self {
        Self {
            session_id: session.id.clone(),
            session: session.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminJoinedEvent {
    pub session_id: String,
    pub admin_id: String,
    pub admin_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEvent {
    pub activity_log: ActivityLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub session_id: String,
    pub sender_role: SenderRole,
    pub message: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTypingEvent {
    pub session_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub participant: Participant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineUsersEvent {
    pub users: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
}

impl From<&crate::error::DispatchError> for ErrorEvent {
    fn from(err: &crate::error::DispatchError) -> Self {
        Self {
            category: err.category(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<&crate::error::ChatError> for ErrorEvent {
    fn from(err: &crate::error::ChatError) -> Self {
        Self {
            category: err.category(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// --- Client -> server ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "driver:register")]
    DriverRegister(DriverRegisterPayload),
    #[serde(rename = "driver:accept")]
    DriverAccept(DriverAcceptPayload),
    #[serde(rename = "driver:decline")]
    DriverDecline(DriverDeclinePayload),
    #[serde(rename = "joinRoom")]
    JoinRoom(RoomPayload),
    #[serde(rename = "leaveRoom")]
    LeaveRoom(RoomPayload),
    #[serde(rename = "joinAdminRoom")]
    JoinAdminRoom,
    #[serde(rename = "sendMessage")]
    SendMessage(SendMessagePayload),
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    #[serde(rename = "getOnlineUsers")]
    GetOnlineUsers,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DriverRegister(_) => "driver:register",
            Self::DriverAccept(_) => "driver:accept",
            Self::DriverDecline(_) => "driver:decline",
            Self::JoinRoom(_) => "joinRoom",
            Self::LeaveRoom(_) => "leaveRoom",
            Self::JoinAdminRoom => "joinAdminRoom",
            Self::SendMessage(_) => "sendMessage",
            Self::Typing(_) => "typing",
            Self::GetOnlineUsers => "getOnlineUsers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRegisterPayload {
    pub driver_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverAcceptPayload {
    pub booking_id: String,
    pub driver_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverDeclinePayload {
    pub booking_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub session_id: String,
    pub sender_role: SenderRole,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub session_id: String,
    pub is_typing: bool,
}
