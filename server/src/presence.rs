//! Server-side presence tracking and broadcast.
//!
//! In-memory presence store (DashMap) keyed by participant id. A participant
//! exists from its first live socket until its last one closes. Drivers
//! additionally join the dispatch eligibility set through `driver:register`
//! and leave it on disconnect.

use axum::{
    extract::{Query, State},
    Json,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::state::AppState;
use crate::ws::events::{PresenceEvent, ServerEvent};
use crate::ws::Room;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Info tracked per participant in the presence map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub status: ConnectionStatus,
    /// Number of live sockets.
    pub connections: usize,
    pub connected_at: i64,
    pub last_seen: i64,
}

#[derive(Clone, Default)]
pub struct PresenceTracker {
    participants: Arc<DashMap<String, Participant>>,
    /// Drivers eligible for new dispatches, with registration time.
    eligible_drivers: Arc<DashMap<String, i64>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new socket for a participant. Returns the participant when
    /// this is its first socket (i.e. it just came online).
    pub fn connect(&self, id: &str, name: &str, role: Role, now: i64) -> Option<Participant> {
        let mut entry = self
            .participants
            .entry(id.to_string())
            .or_insert_with(|| Participant {
                id: id.to_string(),
                name: name.to_string(),
                role,
                status: ConnectionStatus::Online,
                connections: 0,
                connected_at: now,
                last_seen: now,
            });
        entry.connections += 1;
        entry.last_seen = now;
        (entry.connections == 1).then(|| entry.value().clone())
    }

    /// Drop one socket. When the last one goes, the participant is removed
    /// along with every eligibility entry, and returned marked offline.
    pub fn disconnect(&self, id: &str, now: i64) -> Option<Participant> {
        let gone = {
            let mut entry = self.participants.get_mut(id)?;
            entry.connections = entry.connections.saturating_sub(1);
            entry.last_seen = now;
            entry.connections == 0
        };
        if !gone {
            return None;
        }

        self.eligible_drivers.remove(id);
        self.participants
            .remove_if(id, |_, p| p.connections == 0)
            .map(|(_, mut p)| {
                p.status = ConnectionStatus::Offline;
                p
            })
    }

    pub fn touch(&self, id: &str, now: i64) {
        if let Some(mut p) = self.participants.get_mut(id) {
            p.last_seen = now;
        }
    }

    pub fn get(&self, id: &str) -> Option<Participant> {
        self.participants.get(id).map(|p| p.clone())
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    /// Currently connected participants, optionally filtered by role,
    /// sorted by id for stable output.
    pub fn list_online(&self, role: Option<Role>) -> Vec<Participant> {
        let mut list: Vec<Participant> = self
            .participants
            .iter()
            .filter(|p| role.map_or(true, |r| p.role == r))
            .map(|p| p.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Add an online driver to the eligibility set.
    pub fn register_driver(&self, id: &str, now: i64) -> bool {
        if !self.is_online(id) {
            return false;
        }
        self.eligible_drivers.insert(id.to_string(), now);
        true
    }

    pub fn unregister_driver(&self, id: &str) {
        self.eligible_drivers.remove(id);
    }

    pub fn is_eligible(&self, id: &str) -> bool {
        self.eligible_drivers.contains_key(id)
    }

    /// Snapshot of the eligibility set, oldest registration first.
    pub fn eligible_drivers(&self) -> Vec<String> {
        let mut drivers: Vec<(String, i64)> = self
            .eligible_drivers
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        drivers.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        drivers.into_iter().map(|(id, _)| id).collect()
    }
}

// --- Functions called from WS actor lifecycle ---

/// Announce a participant that just came online to admin consoles.
pub fn announce_online(state: &AppState, participant: Participant) {
    tracing::info!(
        user_id = %participant.id,
        role = %participant.role,
        "Participant online"
    );
    state.hub.publish(
        &Room::Admins,
        &ServerEvent::ParticipantOnline(PresenceEvent { participant }),
    );
}

/// Announce a participant whose last socket closed.
pub fn announce_offline(state: &AppState, participant: Participant) {
    tracing::info!(
        user_id = %participant.id,
        role = %participant.role,
        "Participant offline"
    );
    state.hub.publish(
        &Room::Admins,
        &ServerEvent::ParticipantOffline(PresenceEvent { participant }),
    );
}

// --- REST endpoint handlers ---

#[derive(Debug, Deserialize)]
pub struct PresenceQuery {
    pub role: Option<Role>,
}

/// GET /api/presence?role=driver
///
/// Currently connected participants, optionally filtered by role.
pub async fn get_presence(
    State(state): State<AppState>,
    _claims: Claims,
    Query(query): Query<PresenceQuery>,
) -> Json<Vec<Participant>> {
    Json(state.presence.list_online(query.role))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_until_last_socket_closes() {
        let tracker = PresenceTracker::new();
        assert!(tracker.connect("drv-1", "Dana", Role::Driver, 10).is_some());
        assert!(tracker.connect("drv-1", "Dana", Role::Driver, 11).is_none());

        assert!(tracker.disconnect("drv-1", 12).is_none());
        assert!(tracker.is_online("drv-1"));

        let gone = tracker.disconnect("drv-1", 13).unwrap();
        assert_eq!(gone.status, ConnectionStatus::Offline);
        assert!(!tracker.is_online("drv-1"));
    }

    #[test]
    fn disconnect_removes_driver_from_eligibility() {
        let tracker = PresenceTracker::new();
        tracker.connect("drv-1", "Dana", Role::Driver, 10);
        assert!(tracker.register_driver("drv-1", 11));
        assert_eq!(tracker.eligible_drivers(), vec!["drv-1".to_string()]);

        tracker.disconnect("drv-1", 12);
        assert!(tracker.eligible_drivers().is_empty());
    }

    #[test]
    fn offline_driver_cannot_register() {
        let tracker = PresenceTracker::new();
        assert!(!tracker.register_driver("drv-9", 1));
        assert!(!tracker.is_eligible("drv-9"));
    }

    #[test]
    fn list_online_filters_by_role() {
        let tracker = PresenceTracker::new();
        tracker.connect("adm-1", "Ari", Role::Admin, 1);
        tracker.connect("drv-1", "Dana", Role::Driver, 2);
        tracker.connect("drv-2", "Dev", Role::Driver, 3);

        let drivers = tracker.list_online(Some(Role::Driver));
        assert_eq!(drivers.len(), 2);
        assert!(drivers.iter().all(|p| p.role == Role::Driver));
        assert_eq!(tracker.list_online(None).len(), 3);
    }
}
