//! Authoritative ride request storage.
//!
//! Every status change is a conditional `UPDATE ... WHERE status = 'open'`.
//! The affected-row count decides the winner, so two callers can never both
//! move the same request out of `open`.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::models::Driver;
use crate::db::Transition;
use crate::dispatch::{NewRideRequest, RideRequest, RideStatus};
use crate::error::DispatchError;

const REQUEST_COLUMNS: &str = "id, booking_id, customer_id, car, pickup_location, pickup_at, \
     return_at, price, status, accepted_driver_id, created_at, closed_at";

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RideRequest> {
    Ok(RideRequest {
        id: row.get(0)?,
        booking_id: row.get(1)?,
        customer_id: row.get(2)?,
        car: json_column(row, 3)?,
        pickup_location: row.get(4)?,
        pickup_at: row.get(5)?,
        return_at: row.get(6)?,
        price: json_column(row, 7)?,
        status: row.get(8)?,
        accepted_driver_id: row.get(9)?,
        created_at: row.get(10)?,
        closed_at: row.get(11)?,
    })
}

pub fn get_request(conn: &Connection, request_id: &str) -> rusqlite::Result<Option<RideRequest>> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM ride_requests WHERE id = ?1"),
        params![request_id],
        request_from_row,
    )
    .optional()
}

/// Latest request for a booking, preferring the open one.
pub fn find_by_booking(
    conn: &Connection,
    booking_id: &str,
) -> rusqlite::Result<Option<RideRequest>> {
    conn.query_row(
        &format!(
            "SELECT {REQUEST_COLUMNS} FROM ride_requests WHERE booking_id = ?1
             ORDER BY (status = 'open') DESC, created_at DESC LIMIT 1"
        ),
        params![booking_id],
        request_from_row,
    )
    .optional()
}

/// Insert a new open request for a booking.
/// If the booking already has an open or accepted request it is returned
/// unchanged, so a retried create never dispatches twice. Expired and
/// cancelled bookings may be dispatched again.
pub fn insert_request(
    conn: &Connection,
    customer_id: &str,
    new: &NewRideRequest,
    now: i64,
) -> Result<Transition<RideRequest>, DispatchError> {
    if let Some(existing) = find_by_booking(conn, &new.booking_id)? {
        if matches!(existing.status, RideStatus::Open | RideStatus::Accepted) {
            if existing.customer_id != customer_id {
                return Err(DispatchError::Forbidden("booking belongs to another customer"));
            }
            return Ok(Transition::Unchanged(existing));
        }
    }

    let id = Uuid::now_v7().to_string();
    let car = serde_json::to_string(&new.car).map_err(|e| DispatchError::Internal(e.to_string()))?;
    let price =
        serde_json::to_string(&new.price).map_err(|e| DispatchError::Internal(e.to_string()))?;

    conn.execute(
        "INSERT INTO ride_requests (id, booking_id, customer_id, car, pickup_location, pickup_at,
                                    return_at, price, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'open', ?9)",
        params![
            id,
            new.booking_id,
            customer_id,
            car,
            new.pickup_location,
            new.pickup_at,
            new.return_at,
            price,
            now,
        ],
    )?;

    get_request(conn, &id)?
        .map(Transition::Applied)
        .ok_or(DispatchError::NotFound)
}

/// Compare-and-swap `open -> accepted`.
///
/// Succeeds only while the request is open and younger than `timeout_millis`.
/// A repeat by the driver who already won is answered with `Unchanged`;
/// anyone else gets `AlreadyAssigned`. An open request past its timeout
/// answers `Expired` and is left for `try_expire`.
pub fn try_accept(
    conn: &Connection,
    request_id: &str,
    driver_id: &str,
    now: i64,
    timeout_millis: i64,
) -> Result<Transition<RideRequest>, DispatchError> {
    let changed = conn.execute(
        "UPDATE ride_requests SET status = 'accepted', accepted_driver_id = ?2, closed_at = ?3
         WHERE id = ?1 AND status = 'open' AND created_at + ?4 > ?3",
        params![request_id, driver_id, now, timeout_millis],
    )?;

    let request = get_request(conn, request_id)?.ok_or(DispatchError::NotFound)?;
    if changed == 1 {
        return Ok(Transition::Applied(request));
    }

    match request.status {
        RideStatus::Accepted if request.accepted_driver_id.as_deref() == Some(driver_id) => {
            Ok(Transition::Unchanged(request))
        }
        RideStatus::Accepted => Err(DispatchError::AlreadyAssigned),
        RideStatus::Cancelled => Err(DispatchError::Cancelled),
        RideStatus::Expired | RideStatus::Open => Err(DispatchError::Expired),
    }
}

/// Compare-and-swap `open -> expired`, only once the timeout has elapsed.
/// Returns the expired request if this call performed the transition.
pub fn try_expire(
    conn: &Connection,
    request_id: &str,
    now: i64,
    timeout_millis: i64,
) -> rusqlite::Result<Option<RideRequest>> {
    let changed = conn.execute(
        "UPDATE ride_requests SET status = 'expired', closed_at = ?2
         WHERE id = ?1 AND status = 'open' AND created_at + ?3 <= ?2",
        params![request_id, now, timeout_millis],
    )?;

    if changed == 1 {
        get_request(conn, request_id)
    } else {
        Ok(None)
    }
}

/// Compare-and-swap `open -> cancelled` on behalf of the owning customer.
/// Cancelling twice is a no-op.
pub fn try_cancel(
    conn: &Connection,
    request_id: &str,
    customer_id: &str,
    now: i64,
) -> Result<Transition<RideRequest>, DispatchError> {
    let current = get_request(conn, request_id)?.ok_or(DispatchError::NotFound)?;
    if current.customer_id != customer_id {
        return Err(DispatchError::Forbidden("ride request belongs to another customer"));
    }

    let changed = conn.execute(
        "UPDATE ride_requests SET status = 'cancelled', closed_at = ?2
         WHERE id = ?1 AND status = 'open'",
        params![request_id, now],
    )?;

    let request = get_request(conn, request_id)?.ok_or(DispatchError::NotFound)?;
    if changed == 1 {
        return Ok(Transition::Applied(request));
    }

    match request.status {
        RideStatus::Cancelled => Ok(Transition::Unchanged(request)),
        RideStatus::Accepted => Err(DispatchError::AlreadyAssigned),
        RideStatus::Expired | RideStatus::Open => Err(DispatchError::Expired),
    }
}

/// Ids of open requests whose timeout has elapsed at `now`.
pub fn list_due_for_expiry(
    conn: &Connection,
    now: i64,
    timeout_millis: i64,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM ride_requests
         WHERE status = 'open' AND created_at + ?2 <= ?1
         ORDER BY created_at ASC",
    )?;
    let ids = stmt
        .query_map(params![now, timeout_millis], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Open, unexpired requests a driver has not declined. REST fallback for
/// drivers that came online after the broadcast or missed it.
pub fn list_open_for_driver(
    conn: &Connection,
    driver_id: &str,
    now: i64,
    timeout_millis: i64,
) -> rusqlite::Result<Vec<RideRequest>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REQUEST_COLUMNS} FROM ride_requests r
         WHERE r.status = 'open' AND r.created_at + ?2 > ?1
           AND NOT EXISTS (
               SELECT 1 FROM ride_candidates c
               WHERE c.request_id = r.id AND c.driver_id = ?3 AND c.declined = 1
           )
         ORDER BY r.created_at ASC"
    ))?;
    let requests = stmt
        .query_map(params![now, timeout_millis, driver_id], request_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(requests)
}

/// Persist the candidate set captured at broadcast time.
pub fn insert_candidates(
    conn: &Connection,
    request_id: &str,
    driver_ids: &[String],
    now: i64,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO ride_candidates (request_id, driver_id, notified_at)
         VALUES (?1, ?2, ?3)",
    )?;
    for driver_id in driver_ids {
        stmt.execute(params![request_id, driver_id, now])?;
    }
    Ok(())
}

/// Every driver that was sent the request, declined or not.
pub fn list_candidates(conn: &Connection, request_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT driver_id FROM ride_candidates WHERE request_id = ?1
         ORDER BY notified_at, driver_id",
    )?;
    let ids = stmt
        .query_map(params![request_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Record a decline hint. Drivers outside the candidate set are added so
/// the request stays hidden from their REST listing.
pub fn mark_declined(
    conn: &Connection,
    request_id: &str,
    driver_id: &str,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO ride_candidates (request_id, driver_id, notified_at, declined)
         VALUES (?1, ?2, ?3, 1)
         ON CONFLICT(request_id, driver_id) DO UPDATE SET declined = 1",
        params![request_id, driver_id, now],
    )?;
    Ok(())
}

pub fn get_driver(conn: &Connection, driver_id: &str) -> rusqlite::Result<Option<Driver>> {
    conn.query_row(
        "SELECT id, display_name, license_verified, updated_at FROM drivers WHERE id = ?1",
        params![driver_id],
        Driver::from_row,
    )
    .optional()
}

pub fn upsert_driver(
    conn: &Connection,
    driver_id: &str,
    display_name: &str,
    license_verified: bool,
    now: i64,
) -> rusqlite::Result<Driver> {
    conn.execute(
        "INSERT INTO drivers (id, display_name, license_verified, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET display_name = ?2, license_verified = ?3, updated_at = ?4",
        params![driver_id, display_name, license_verified, now],
    )?;
    Ok(Driver {
        id: driver_id.to_string(),
        display_name: display_name.to_string(),
        license_verified,
        updated_at: now,
    })
}

pub fn is_driver_verified(conn: &Connection, driver_id: &str) -> rusqlite::Result<bool> {
    Ok(get_driver(conn, driver_id)?.is_some_and(|d| d.license_verified))
}

/// Keep only the drivers whose license is verified, preserving order.
pub fn filter_verified(conn: &Connection, driver_ids: &[String]) -> rusqlite::Result<Vec<String>> {
    let mut verified = Vec::with_capacity(driver_ids.len());
    for id in driver_ids {
        if is_driver_verified(conn, id)? {
            verified.push(id.clone());
        }
    }
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::fixtures::new_request;

    const TIMEOUT: i64 = 5 * 60 * 1000;
    const T: i64 = 1_800_000_000_000;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::migrations().to_latest(&mut conn).unwrap();
        conn
    }

    fn open_request(conn: &Connection) -> RideRequest {
        insert_request(conn, "cust-1", &new_request("bk-1"), T)
            .unwrap()
            .into_inner()
    }

    #[test]
    fn insert_is_idempotent_per_open_booking() {
        let conn = conn();
        let first = insert_request(&conn, "cust-1", &new_request("bk-1"), T).unwrap();
        let second = insert_request(&conn, "cust-1", &new_request("bk-1"), T + 10).unwrap();
        assert!(first.was_applied());
        assert!(!second.was_applied());
        assert_eq!(first.get().id, second.get().id);
    }

    #[test]
    fn other_customer_cannot_reuse_open_booking() {
        let conn = conn();
        open_request(&conn);
        let err = insert_request(&conn, "cust-2", &new_request("bk-1"), T).unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));
    }

    #[test]
    fn first_accept_wins_second_gets_already_assigned() {
        let conn = conn();
        let req = open_request(&conn);

        let won = try_accept(&conn, &req.id, "drv-a", T + 1_000, TIMEOUT).unwrap();
        assert!(won.was_applied());
        assert_eq!(won.get().accepted_driver_id.as_deref(), Some("drv-a"));

        let lost = try_accept(&conn, &req.id, "drv-b", T + 1_100, TIMEOUT).unwrap_err();
        assert!(matches!(lost, DispatchError::AlreadyAssigned));

        let stored = get_request(&conn, &req.id).unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Accepted);
        assert_eq!(stored.accepted_driver_id.as_deref(), Some("drv-a"));
    }

    #[test]
    fn winner_retry_is_unchanged_not_an_error() {
        let conn = conn();
        let req = open_request(&conn);
        try_accept(&conn, &req.id, "drv-a", T + 1_000, TIMEOUT).unwrap();
        let again = try_accept(&conn, &req.id, "drv-a", T + 2_000, TIMEOUT).unwrap();
        assert!(!again.was_applied());
    }

    #[test]
    fn accept_at_timeout_boundary_is_expired() {
        let conn = conn();
        let req = open_request(&conn);
        let err = try_accept(&conn, &req.id, "drv-a", T + TIMEOUT, TIMEOUT).unwrap_err();
        assert!(matches!(err, DispatchError::Expired));
        // accept does not flip the status itself
        assert_eq!(
            get_request(&conn, &req.id).unwrap().unwrap().status,
            RideStatus::Open
        );
    }

    #[test]
    fn expire_only_after_timeout_and_only_once() {
        let conn = conn();
        let req = open_request(&conn);
        assert!(try_expire(&conn, &req.id, T + TIMEOUT - 1, TIMEOUT).unwrap().is_none());
        let expired = try_expire(&conn, &req.id, T + TIMEOUT, TIMEOUT).unwrap().unwrap();
        assert_eq!(expired.status, RideStatus::Expired);
        assert!(try_expire(&conn, &req.id, T + TIMEOUT + 1, TIMEOUT).unwrap().is_none());

        let err = try_accept(&conn, &req.id, "drv-a", T + TIMEOUT + 1_000, TIMEOUT).unwrap_err();
        assert!(matches!(err, DispatchError::Expired));
    }

    #[test]
    fn expire_does_not_touch_accepted_request() {
        let conn = conn();
        let req = open_request(&conn);
        try_accept(&conn, &req.id, "drv-a", T + 1, TIMEOUT).unwrap();
        assert!(try_expire(&conn, &req.id, T + TIMEOUT, TIMEOUT).unwrap().is_none());
        assert!(list_due_for_expiry(&conn, T + TIMEOUT * 2, TIMEOUT).unwrap().is_empty());
    }

    #[test]
    fn cancel_is_idempotent_and_blocks_accept() {
        let conn = conn();
        let req = open_request(&conn);
        assert!(try_cancel(&conn, &req.id, "cust-1", T + 5).unwrap().was_applied());
        assert!(!try_cancel(&conn, &req.id, "cust-1", T + 6).unwrap().was_applied());

        let err = try_accept(&conn, &req.id, "drv-a", T + 7, TIMEOUT).unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    #[test]
    fn cancel_by_stranger_is_forbidden() {
        let conn = conn();
        let req = open_request(&conn);
        let err = try_cancel(&conn, &req.id, "cust-2", T + 5).unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));
    }

    #[test]
    fn declined_request_is_hidden_from_that_driver_only() {
        let conn = conn();
        let req = open_request(&conn);
        insert_candidates(&conn, &req.id, &["drv-a".into(), "drv-b".into()], T).unwrap();
        mark_declined(&conn, &req.id, "drv-a", T + 10).unwrap();

        assert!(list_open_for_driver(&conn, "drv-a", T + 20, TIMEOUT).unwrap().is_empty());
        assert_eq!(list_open_for_driver(&conn, "drv-b", T + 20, TIMEOUT).unwrap().len(), 1);
        // a late driver still discovers it
        assert_eq!(list_open_for_driver(&conn, "drv-c", T + 20, TIMEOUT).unwrap().len(), 1);
        assert_eq!(list_candidates(&conn, &req.id).unwrap().len(), 2);
    }

    #[test]
    fn filter_verified_drops_unknown_and_unverified() {
        let conn = conn();
        upsert_driver(&conn, "drv-a", "Ana", true, T).unwrap();
        upsert_driver(&conn, "drv-b", "Ben", false, T).unwrap();
        let ids = vec!["drv-a".to_string(), "drv-b".to_string(), "drv-c".to_string()];
        assert_eq!(filter_verified(&conn, &ids).unwrap(), vec!["drv-a".to_string()]);
    }
}
