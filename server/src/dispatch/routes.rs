//! REST endpoints for ride dispatch.
//!
//! Each one is safe to call after the equivalent socket action: accept and
//! cancel are idempotent, decline is a hint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::dispatch::{arbiter, broadcast, store, NewRideRequest, RideRequest};
use crate::error::DispatchError;
use crate::state::AppState;

/// POST /api/ride-requests
///
/// Customer dispatches a driver for a booking.
/// 201 on a new dispatch, 200 when the booking was already dispatched.
pub async fn create_ride_request(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<NewRideRequest>,
) -> Result<(StatusCode, Json<RideRequest>), DispatchError> {
    let transition = broadcast::create_and_dispatch(&state, &claims, body).await?;
    let status = if transition.was_applied() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(transition.into_inner())))
}

/// GET /api/ride-requests/{id}
///
/// Authoritative state of one request.
/// Customers only see their own; drivers and admins see any.
pub async fn get_ride_request(
    State(state): State<AppState>,
    claims: Claims,
    Path(request_id): Path<String>,
) -> Result<Json<RideRequest>, DispatchError> {
    let db = state.db.clone();
    let request = tokio::task::spawn_blocking(move || -> Result<RideRequest, DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        store::get_request(&conn, &request_id)?.ok_or(DispatchError::NotFound)
    })
    .await??;

    if claims.role == Role::Customer && request.customer_id != claims.sub {
        return Err(DispatchError::NotFound);
    }
    Ok(Json(request))
}

/// POST /api/ride-requests/{id}/accept
///
/// REST fallback for `driver:accept`.
pub async fn accept_ride_request(
    State(state): State<AppState>,
    claims: Claims,
    Path(request_id): Path<String>,
) -> Result<Json<RideRequest>, DispatchError> {
    require_driver(&claims)?;
    let request = arbiter::accept(&state, &request_id, &claims.sub).await?;
    Ok(Json(request))
}

/// POST /api/ride-requests/{id}/decline
pub async fn decline_ride_request(
    State(state): State<AppState>,
    claims: Claims,
    Path(request_id): Path<String>,
) -> Result<StatusCode, DispatchError> {
    require_driver(&claims)?;
    arbiter::decline(&state, &request_id, &claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/ride-requests/{id}/cancel
///
/// Owning customer only.
pub async fn cancel_ride_request(
    State(state): State<AppState>,
    claims: Claims,
    Path(request_id): Path<String>,
) -> Result<Json<RideRequest>, DispatchError> {
    if claims.role != Role::Customer {
        return Err(DispatchError::Forbidden("only the booking customer can cancel"));
    }
    let request = arbiter::cancel(&state, &claims, &request_id).await?;
    Ok(Json(request))
}

/// GET /api/driver/requests
///
/// Open requests this driver can still accept.
/// Discovery path for drivers who came online after a broadcast.
pub async fn list_driver_requests(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<RideRequest>>, DispatchError> {
    require_driver(&claims)?;

    let db = state.db.clone();
    let timeout = state.dispatch.request_timeout_millis();
    let requests = tokio::task::spawn_blocking(move || -> Result<Vec<RideRequest>, DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        if !store::is_driver_verified(&conn, &claims.sub)? {
            return Err(DispatchError::NotEligible);
        }
        Ok(store::list_open_for_driver(
            &conn,
            &claims.sub,
            crate::now_millis(),
            timeout,
        )?)
    })
    .await??;

    Ok(Json(requests))
}

fn require_driver(claims: &Claims) -> Result<(), DispatchError> {
    if claims.role == Role::Driver {
        Ok(())
    } else {
        Err(DispatchError::Forbidden("driver role required"))
    }
}
