//! Expiry Monitor.
//!
//! The server owns the clock: an open request becomes `expired` once
//! `created_at + request_timeout` has passed, whatever client timers show.
//! Each expiry is its own compare-and-swap, so a concurrent accept either
//! wins before it or fails `Expired` after it.

use crate::activity::{self, NewActivity, SYSTEM_ACTOR};
use crate::dispatch::broadcast::notify_closed;
use crate::dispatch::store;
use crate::dispatch::{CloseReason, RideRequest};
use crate::error::DispatchError;
use crate::state::AppState;

/// Expire every open request whose timeout has elapsed at `now`.
/// Returns the requests this sweep moved to `expired`.
pub async fn expire_due(state: &AppState, now: i64) -> Result<Vec<RideRequest>, DispatchError> {
    let db = state.db.clone();
    let timeout = state.dispatch.request_timeout_millis();

    let expired = tokio::task::spawn_blocking(move || -> Result<_, DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        let mut expired = Vec::new();
        for id in store::list_due_for_expiry(&conn, now, timeout)? {
            // None: an accept or cancel got there first
            if let Some(request) = store::try_expire(&conn, &id, now, timeout)? {
                let candidates = store::list_candidates(&conn, &id)?;
                expired.push((request, candidates));
            }
        }
        Ok(expired)
    })
    .await??;

    let mut requests = Vec::with_capacity(expired.len());
    for (request, candidates) in expired {
        announce_expired(state, &request, &candidates).await;
        requests.push(request);
    }
    Ok(requests)
}

/// Withdraw an expired request from its candidates. Drivers see expiry as
/// `driver_closed{reason: cancelled}`.
pub(crate) async fn announce_expired(
    state: &AppState,
    request: &RideRequest,
    candidates: &[String],
) {
    let withdrawn = notify_closed(state, request, CloseReason::Cancelled, candidates, None);
    tracing::info!(
        booking_id = %request.booking_id,
        request_id = %request.id,
        withdrawn = withdrawn,
        "Ride request expired"
    );

    activity::record(
        state,
        NewActivity {
            actor_id: SYSTEM_ACTOR.to_string(),
            action: "ride_request.expired",
            entity_type: "ride_request",
            entity_id: request.id.clone(),
            details: format!("booking {} had no acceptance", request.booking_id),
        },
    )
    .await;
}

/// Spawn the background sweep, every `sweep_interval_secs` seconds.
pub fn spawn_expiry_monitor(state: AppState) -> tokio::task::JoinHandle<()> {
    let interval = std::time::Duration::from_secs(state.dispatch.sweep_interval_secs.max(1));

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            match expire_due(&state, crate::now_millis()).await {
                Ok(expired) if !expired.is_empty() => {
                    tracing::info!("Expiry sweep: expired {} ride request(s)", expired.len());
                }
                Ok(_) => {
                    tracing::debug!("Expiry sweep: nothing due");
                }
                Err(e) => {
                    tracing::error!("Expiry sweep error: {}", e);
                }
            }
        }
    })
}
