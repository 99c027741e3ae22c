//! Acceptance Arbiter.
//!
//! The socket `driver:accept` and `POST /api/ride-requests/{id}/accept` both
//! land in [`accept`]. Broadcasts happen only after the store has committed.

use crate::activity::{self, NewActivity};
use crate::auth::middleware::Claims;
use crate::dispatch::broadcast::notify_closed;
use crate::dispatch::expiry;
use crate::db::Transition;
use crate::dispatch::store;
use crate::dispatch::{CloseReason, RideRequest};
use crate::error::DispatchError;
use crate::state::AppState;
use crate::ws::events::{DriverAcceptedEvent, ServerEvent};

enum Settled {
    Accepted {
        transition: Transition<RideRequest>,
        candidates: Vec<String>,
    },
    /// The accept found the request past its timeout and expired it.
    ExpiredNow {
        request: RideRequest,
        candidates: Vec<String>,
    },
}

/// Resolve one acceptance attempt.
///
/// Exactly one driver ever gets `Ok` with a freshly accepted request; a
/// repeat by that same driver gets `Ok` again. Everyone else gets
/// `AlreadyAssigned`, `Expired`, `Cancelled` or `NotFound`.
pub async fn accept(
    state: &AppState,
    request_id: &str,
    driver_id: &str,
) -> Result<RideRequest, DispatchError> {
    let db = state.db.clone();
    let timeout = state.dispatch.request_timeout_millis();
    let rid = request_id.to_string();
    let did = driver_id.to_string();

    let settled = tokio::task::spawn_blocking(move || -> Result<Settled, DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        let now = crate::now_millis();

        if store::get_request(&conn, &rid)?.is_none() {
            return Err(DispatchError::NotFound);
        }
        if !store::is_driver_verified(&conn, &did)? {
            return Err(DispatchError::NotEligible);
        }

        match store::try_accept(&conn, &rid, &did, now, timeout) {
            Ok(transition) => {
                let candidates = store::list_candidates(&conn, &rid)?;
                Ok(Settled::Accepted {
                    transition,
                    candidates,
                })
            }
            Err(DispatchError::Expired) => match store::try_expire(&conn, &rid, now, timeout)? {
                Some(request) => {
                    let candidates = store::list_candidates(&conn, &rid)?;
                    Ok(Settled::ExpiredNow {
                        request,
                        candidates,
                    })
                }
                None => Err(DispatchError::Expired),
            },
            Err(e) => Err(e),
        }
    })
    .await??;

    match settled {
        Settled::ExpiredNow {
            request,
            candidates,
        } => {
            expiry::announce_expired(state, &request, &candidates).await;
            Err(DispatchError::Expired)
        }
        Settled::Accepted {
            transition: Transition::Unchanged(request),
            ..
        } => Ok(request),
        Settled::Accepted {
            transition: Transition::Applied(request),
            candidates,
        } => {
            state.hub.send_to_user(
                driver_id,
                &ServerEvent::DriverAccepted(DriverAcceptedEvent {
                    booking_id: request.booking_id.clone(),
                    request_id: request.id.clone(),
                }),
            );
            let withdrawn = notify_closed(
                state,
                &request,
                CloseReason::AcceptedByAnother,
                &candidates,
                Some(driver_id),
            );

            tracing::info!(
                booking_id = %request.booking_id,
                request_id = %request.id,
                driver_id = %driver_id,
                withdrawn = withdrawn,
                "Ride request accepted"
            );

            activity::record(
                state,
                NewActivity {
                    actor_id: driver_id.to_string(),
                    action: "ride_request.accepted",
                    entity_type: "ride_request",
                    entity_id: request.id.clone(),
                    details: format!("booking {}", request.booking_id),
                },
            )
            .await;

            Ok(request)
        }
    }
}

/// Socket clients address requests by booking id.
pub async fn accept_by_booking(
    state: &AppState,
    booking_id: &str,
    driver_id: &str,
) -> Result<RideRequest, DispatchError> {
    let request = lookup_booking(state, booking_id).await?;
    accept(state, &request.id, driver_id).await
}

/// Record a decline. A hint only: it never blocks other drivers and is
/// accepted in any status.
pub async fn decline(
    state: &AppState,
    request_id: &str,
    driver_id: &str,
) -> Result<(), DispatchError> {
    let db = state.db.clone();
    let rid = request_id.to_string();
    let did = driver_id.to_string();

    tokio::task::spawn_blocking(move || -> Result<(), DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        if store::get_request(&conn, &rid)?.is_none() {
            return Err(DispatchError::NotFound);
        }
        store::mark_declined(&conn, &rid, &did, crate::now_millis())?;
        Ok(())
    })
    .await??;

    tracing::debug!(request_id = %request_id, driver_id = %driver_id, "Ride request declined");
    Ok(())
}

pub async fn decline_by_booking(
    state: &AppState,
    booking_id: &str,
    driver_id: &str,
) -> Result<(), DispatchError> {
    let request = lookup_booking(state, booking_id).await?;
    decline(state, &request.id, driver_id).await
}

/// Customer cancellation. Idempotent; a request that has already left
/// `open` for another reason answers with that outcome.
pub async fn cancel(
    state: &AppState,
    claims: &Claims,
    request_id: &str,
) -> Result<RideRequest, DispatchError> {
    let db = state.db.clone();
    let rid = request_id.to_string();
    let customer_id = claims.sub.clone();

    let (transition, candidates) = tokio::task::spawn_blocking(move || -> Result<_, DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        let transition = store::try_cancel(&conn, &rid, &customer_id, crate::now_millis())?;
        let candidates = if transition.was_applied() {
            store::list_candidates(&conn, &rid)?
        } else {
            Vec::new()
        };
        Ok((transition, candidates))
    })
    .await??;

    let request = match transition {
        Transition::Unchanged(request) => return Ok(request),
        Transition::Applied(request) => request,
    };

    notify_closed(state, &request, CloseReason::Cancelled, &candidates, None);
    tracing::info!(
        booking_id = %request.booking_id,
        request_id = %request.id,
        "Ride request cancelled"
    );

    activity::record(
        state,
        NewActivity {
            actor_id: claims.sub.clone(),
            action: "ride_request.cancelled",
            entity_type: "ride_request",
            entity_id: request.id.clone(),
            details: format!("booking {}", request.booking_id),
        },
    )
    .await;

    Ok(request)
}

async fn lookup_booking(state: &AppState, booking_id: &str) -> Result<RideRequest, DispatchError> {
    let db = state.db.clone();
    let bid = booking_id.to_string();
    tokio::task::spawn_blocking(move || -> Result<RideRequest, DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        store::find_by_booking(&conn, &bid)?.ok_or(DispatchError::NotFound)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::config::Config;
    use crate::dispatch::broadcast::create_and_dispatch;
    use crate::dispatch::fixtures::new_request;
    use crate::dispatch::RideStatus;
    use crate::ws::events::ServerEvent;
    use crate::ws::ConnectionHandle;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn test_state() -> AppState {
        let db = crate::db::init_memory_db().unwrap();
        AppState::new(db, vec![9u8; 32], &Config::default())
    }

    fn claims(id: &str, role: Role) -> Claims {
        Claims {
            sub: id.to_string(),
            name: id.to_string(),
            role,
            iat: 0,
            exp: i64::MAX,
        }
    }

    /// Connect, verify and register a driver. Returns its socket receiver.
    fn online_driver(state: &AppState, id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        state.hub.register(ConnectionHandle {
            id: conn_id,
            user_id: id.to_string(),
            role: Role::Driver,
            sender: tx,
        });
        state.presence.connect(id, id, Role::Driver, 0);
        state.presence.register_driver(id, 0);
        let conn = state.db.lock().unwrap();
        store::upsert_driver(&conn, id, id, true, 0).unwrap();
        rx
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(text.as_str()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn winner_is_confirmed_and_others_are_withdrawn() {
        let state = test_state();
        let mut rx_a = online_driver(&state, "drv-a");
        let mut rx_b = online_driver(&state, "drv-b");

        let request =
            create_and_dispatch(&state, &claims("cust-1", Role::Customer), new_request("bk-1"))
                .await
                .unwrap()
                .into_inner();
        assert!(matches!(events(&mut rx_a)[..], [ServerEvent::DriverRequest(_)]));
        assert!(matches!(events(&mut rx_b)[..], [ServerEvent::DriverRequest(_)]));

        let accepted = accept(&state, &request.id, "drv-a").await.unwrap();
        assert_eq!(accepted.status, RideStatus::Accepted);

        let err = accept(&state, &request.id, "drv-b").await.unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyAssigned));

        assert!(matches!(events(&mut rx_a)[..], [ServerEvent::DriverAccepted(_)]));
        match &events(&mut rx_b)[..] {
            [ServerEvent::DriverClosed(closed)] => {
                assert_eq!(closed.reason, CloseReason::AcceptedByAnother)
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn unverified_driver_is_not_eligible() {
        let state = test_state();
        let request =
            create_and_dispatch(&state, &claims("cust-1", Role::Customer), new_request("bk-1"))
                .await
                .unwrap()
                .into_inner();
        let err = accept(&state, &request.id, "drv-unknown").await.unwrap_err();
        assert!(matches!(err, DispatchError::NotEligible));
    }

    #[tokio::test]
    async fn cancel_withdraws_and_blocks_later_accept() {
        let state = test_state();
        let mut rx = online_driver(&state, "drv-a");
        let customer = claims("cust-1", Role::Customer);
        let request = create_and_dispatch(&state, &customer, new_request("bk-1"))
            .await
            .unwrap()
            .into_inner();
        events(&mut rx);

        let cancelled = cancel(&state, &customer, &request.id).await.unwrap();
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        // second cancel is a no-op
        cancel(&state, &customer, &request.id).await.unwrap();

        match &events(&mut rx)[..] {
            [ServerEvent::DriverClosed(closed)] => {
                assert_eq!(closed.reason, CloseReason::Cancelled)
            }
            other => panic!("unexpected events {other:?}"),
        }
        let err = accept(&state, &request.id, "drv-a").await.unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn decline_hides_request_without_blocking_others() {
        let state = test_state();
        let _rx_a = online_driver(&state, "drv-a");
        let _rx_b = online_driver(&state, "drv-b");
        let request =
            create_and_dispatch(&state, &claims("cust-1", Role::Customer), new_request("bk-1"))
                .await
                .unwrap()
                .into_inner();

        decline_by_booking(&state, "bk-1", "drv-a").await.unwrap();
        let accepted = accept_by_booking(&state, "bk-1", "drv-b").await.unwrap();
        assert_eq!(accepted.id, request.id);
        assert_eq!(accepted.accepted_driver_id.as_deref(), Some("drv-b"));
    }

    #[tokio::test]
    async fn unknown_booking_is_not_found() {
        let state = test_state();
        let err = accept_by_booking(&state, "bk-missing", "drv-a").await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound));
    }
}
