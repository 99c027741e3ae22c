//! Reconciliation of socket events with REST snapshots.
//!
//! REST is authoritative for history and terminal state; socket events carry
//! what just happened. Sessions and requests are keyed by id, messages are
//! deduplicated by `(sender role, text, createdAt)`. After a connection gap
//! the view is `Stale` and incoming events are buffered until a fresh
//! snapshot has been applied.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::chat::{ChatMessage, ChatSession, ChatStatus};
use crate::dispatch::{CarSummary, RideRequest, RideStatus};
use crate::ws::events::{DriverRequestEvent, NewMessageEvent, ServerEvent};

/// Authoritative state fetched over REST.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub sessions: Vec<ChatSession>,
    /// Open requests offered to this driver.
    pub requests: Vec<RideRequest>,
}

/// A request on a driver's pending list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: String,
    pub booking_id: String,
    pub car: CarSummary,
    pub pickup_location: String,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    /// Server creation time. Countdowns derive from this, never from
    /// local receipt time.
    pub requested_at: i64,
    /// Set once this driver won the request.
    pub accepted: bool,
}

impl From<&DriverRequestEvent> for PendingRequest {
    fn from(event: &DriverRequestEvent) -> Self {
        Self {
            request_id: event.request_id.clone(),
            booking_id: event.booking_id.clone(),
            car: event.car.clone(),
            pickup_location: event.pickup_location.clone(),
            pickup_at: event.pickup_at,
            return_at: event.return_at,
            requested_at: event.requested_at,
            accepted: false,
        }
    }
}

impl From<&RideRequest> for PendingRequest {
    fn from(request: &RideRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            booking_id: request.booking_id.clone(),
            car: request.car.clone(),
            pickup_location: request.pickup_location.clone(),
            pickup_at: request.pickup_at,
            return_at: request.return_at,
            requested_at: request.created_at,
            accepted: request.status == RideStatus::Accepted,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsistentView {
    sessions: BTreeMap<String, ChatSession>,
    pending: BTreeMap<String, PendingRequest>,
    /// Messages for sessions the view has not seen yet.
    parked: HashMap<String, Vec<ChatMessage>>,
    /// Requests this driver declined; redelivery is ignored.
    declined: HashSet<String>,
}

impl ConsistentView {
    pub fn session(&self, session_id: &str) -> Option<&ChatSession> {
        self.sessions.get(session_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ChatSession> {
        self.sessions.values()
    }

    /// Sessions in one status, e.g. the admin waiting queue.
    pub fn sessions_in(&self, status: ChatStatus) -> Vec<&ChatSession> {
        self.sessions.values().filter(|s| s.status == status).collect()
    }

    pub fn pending(&self) -> Vec<&PendingRequest> {
        let mut list: Vec<&PendingRequest> = self.pending.values().collect();
        list.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        list
    }

    pub fn pending_request(&self, request_id: &str) -> Option<&PendingRequest> {
        self.pending.get(request_id)
    }

    pub fn parked_count(&self) -> usize {
        self.parked.values().map(Vec::len).sum()
    }

    /// Fold one socket event into the view. Applying the same event twice
    /// leaves the view unchanged.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::ChatUpdate(e) | ServerEvent::NewSupportRequest(e) => {
                self.upsert_session(e.session.clone());
            }
            ServerEvent::NewMessage(e) => self.add_message(message_from_event(e)),
            ServerEvent::DriverRequest(e) => {
                if !self.declined.contains(&e.request_id) {
                    self.pending
                        .entry(e.request_id.clone())
                        .or_insert_with(|| PendingRequest::from(e));
                }
            }
            ServerEvent::DriverClosed(e) => {
                self.pending.remove(&e.request_id);
            }
            ServerEvent::DriverAccepted(e) => {
                if let Some(pending) = self.pending.get_mut(&e.request_id) {
                    pending.accepted = true;
                }
            }
            _ => {}
        }
    }

    /// Replace what the snapshot covers with server truth.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        for session in snapshot.sessions {
            let id = session.id.clone();
            self.sessions.insert(id.clone(), session);
            self.unpark(&id);
        }

        // Anything not offered any more closed during the gap. Won requests
        // are kept; they are no longer open so the snapshot omits them.
        let offered: BTreeMap<String, PendingRequest> = snapshot
            .requests
            .iter()
            .filter(|r| r.status == RideStatus::Open && !self.declined.contains(&r.id))
            .map(|r| (r.id.clone(), PendingRequest::from(r)))
            .collect();
        self.pending.retain(|id, p| p.accepted || offered.contains_key(id));
        for (id, request) in offered {
            self.pending.entry(id).or_insert(request);
        }
    }

    /// Local decline: drop the request and ignore it if it is offered again.
    pub fn decline(&mut self, request_id: &str) {
        self.pending.remove(request_id);
        self.declined.insert(request_id.to_string());
    }

    /// Drop requests whose server-side timeout has passed. Advisory: the
    /// server decides expiry, this only tidies the list.
    pub fn prune_expired(&mut self, now: i64, timeout_millis: i64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| p.accepted || p.requested_at + timeout_millis > now);
        before - self.pending.len()
    }

    fn upsert_session(&mut self, incoming: ChatSession) {
        let id = incoming.id.clone();
        match self.sessions.get_mut(&id) {
            None => {
                self.sessions.insert(id.clone(), incoming);
            }
            Some(existing) => {
                let messages = std::mem::take(&mut existing.messages);
                let reopen = existing.status == ChatStatus::Closed
                    && incoming.status != ChatStatus::Closed;
                let newer = incoming.updated_at >= existing.updated_at;
                let incoming_messages = incoming.messages.clone();

                if newer && !reopen {
                    *existing = incoming;
                }
                existing.messages = messages;
                for message in incoming_messages {
                    insert_message(&mut existing.messages, message);
                }
            }
        }
        self.unpark(&id);
    }

    fn add_message(&mut self, message: ChatMessage) {
        match self.sessions.get_mut(&message.session_id) {
            Some(session) => {
                if message.created_at > session.last_message_at {
                    session.last_message_at = message.created_at;
                }
                insert_message(&mut session.messages, message);
            }
            None => {
                let parked = self.parked.entry(message.session_id.clone()).or_default();
                if !parked.iter().any(|m| m.identity() == message.identity()) {
                    parked.push(message);
                }
            }
        }
    }

    fn unpark(&mut self, session_id: &str) {
        let Some(parked) = self.parked.remove(session_id) else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(session_id) {
            for message in parked {
                insert_message(&mut session.messages, message);
            }
        }
    }
}

/// Socket messages carry no store id; the REST copy of the same line
/// replaces it on the next snapshot.
fn message_from_event(event: &NewMessageEvent) -> ChatMessage {
    ChatMessage {
        id: 0,
        session_id: event.session_id.clone(),
        sender_role: event.sender_role,
        sender_id: None,
        text: event.message.clone(),
        created_at: event.created_at,
    }
}

/// Insert keeping `created_at` order, after every line with the same
/// timestamp so ties keep arrival order. Duplicates are dropped.
fn insert_message(messages: &mut Vec<ChatMessage>, message: ChatMessage) {
    if let Some(existing) = messages
        .iter_mut()
        .find(|m| m.identity() == message.identity())
    {
        if existing.id == 0 && message.id != 0 {
            existing.id = message.id;
            existing.sender_id = message.sender_id;
        }
        return;
    }
    let at = messages.partition_point(|m| m.created_at <= message.created_at);
    messages.insert(at, message);
}

/// Merge buffered socket events on top of a REST snapshot.
pub fn merge(events: &[ServerEvent], snapshot: Snapshot) -> ConsistentView {
    let mut view = ConsistentView::default();
    view.apply_snapshot(snapshot);
    for event in events {
        view.apply(event);
    }
    view
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Socket events apply directly.
    Live,
    /// A gap happened; events wait for the next snapshot.
    Stale,
}

/// Owns the view across reconnects. Starts `Stale`: nothing is trusted
/// until the first snapshot.
#[derive(Debug, Clone)]
pub struct Reconciler {
    view: ConsistentView,
    phase: Phase,
    buffered: Vec<ServerEvent>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            view: ConsistentView::default(),
            phase: Phase::Stale,
            buffered: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn view(&self) -> &ConsistentView {
        &self.view
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn apply_event(&mut self, event: ServerEvent) {
        match self.phase {
            Phase::Live => self.view.apply(&event),
            Phase::Stale => self.buffered.push(event),
        }
    }

    pub fn connection_lost(&mut self) {
        if self.phase == Phase::Live {
            tracing::debug!("View marked stale");
        }
        self.phase = Phase::Stale;
    }

    /// Apply a fresh snapshot, replay what arrived meanwhile, go live.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.view.apply_snapshot(snapshot);
        let replay = std::mem::take(&mut self.buffered);
        let replayed = replay.len();
        for event in &replay {
            self.view.apply(event);
        }
        self.phase = Phase::Live;
        tracing::debug!(replayed = replayed, "Snapshot applied");
    }

    pub fn decline(&mut self, request_id: &str) {
        self.view.decline(request_id);
    }

    pub fn prune_expired(&mut self, now: i64, timeout_millis: i64) -> usize {
        self.view.prune_expired(now, timeout_millis)
    }
}
