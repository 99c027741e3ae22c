//! Request Broadcast Channel.
//!
//! A new request is offered once to the drivers that are online and
//! license-verified at that instant. The candidate set is persisted and never
//! recomputed; drivers arriving later find the request over REST.

use crate::activity::{self, NewActivity};
use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::db::Transition;
use crate::dispatch::store;
use crate::dispatch::{CloseReason, NewRideRequest, RideRequest};
use crate::error::DispatchError;
use crate::state::AppState;
use crate::ws::events::{DriverClosedEvent, DriverRequestEvent, ServerEvent};

/// Create a ride request for a booking and fan it out.
///
/// Retrying with the same booking returns the existing open or accepted
/// request as `Unchanged`, without a second broadcast.
pub async fn create_and_dispatch(
    state: &AppState,
    claims: &Claims,
    new: NewRideRequest,
) -> Result<Transition<RideRequest>, DispatchError> {
    if claims.role != Role::Customer {
        return Err(DispatchError::Forbidden("only customers can request a driver"));
    }
    new.validate()?;

    // Snapshot of the eligibility set at broadcast time
    let online = state.presence.eligible_drivers();

    let db = state.db.clone();
    let customer_id = claims.sub.clone();
    let (transition, candidates) = tokio::task::spawn_blocking(move || -> Result<_, DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        let now = crate::now_millis();

        let transition = store::insert_request(&conn, &customer_id, &new, now)?;
        if !transition.was_applied() {
            return Ok((transition, Vec::new()));
        }

        let candidates = store::filter_verified(&conn, &online)?;
        store::insert_candidates(&conn, &transition.get().id, &candidates, now)?;
        Ok((transition, candidates))
    })
    .await??;

    let request = match transition {
        Transition::Unchanged(request) => {
            tracing::debug!(
                booking_id = %request.booking_id,
                request_id = %request.id,
                "Booking already dispatched"
            );
            return Ok(Transition::Unchanged(request));
        }
        Transition::Applied(request) => request,
    };

    let sent = fan_out(state, &request, &candidates);
    tracing::info!(
        booking_id = %request.booking_id,
        request_id = %request.id,
        candidates = candidates.len(),
        delivered = sent,
        "Ride request dispatched"
    );

    activity::record(
        state,
        NewActivity {
            actor_id: claims.sub.clone(),
            action: "ride_request.created",
            entity_type: "ride_request",
            entity_id: request.id.clone(),
            details: format!(
                "booking {} offered to {} driver(s)",
                request.booking_id,
                candidates.len()
            ),
        },
    )
    .await;

    Ok(Transition::Applied(request))
}

/// Send `driver_request` to every candidate. Delivery is not acknowledged.
/// Returns the number of sockets the event was queued on.
pub fn fan_out(state: &AppState, request: &RideRequest, candidates: &[String]) -> usize {
    let event = ServerEvent::DriverRequest(DriverRequestEvent::from(request));
    candidates
        .iter()
        .map(|driver_id| state.hub.send_to_user(driver_id, &event))
        .sum()
}

/// Withdraw a request from every notified driver except `except`.
pub fn notify_closed(
    state: &AppState,
    request: &RideRequest,
    reason: CloseReason,
    candidates: &[String],
    except: Option<&str>,
) -> usize {
    let event = ServerEvent::DriverClosed(DriverClosedEvent {
        booking_id: request.booking_id.clone(),
        request_id: request.id.clone(),
        reason,
    });
    candidates
        .iter()
        .filter(|driver_id| Some(driver_id.as_str()) != except)
        .map(|driver_id| state.hub.send_to_user(driver_id, &event))
        .sum()
}
