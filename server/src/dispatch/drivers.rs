//! Driver license verification, maintained by admins.
//!
//! Verification gates both `driver:register` and accept. Revoking it also
//! drops the driver from the live eligibility set.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::activity::{self, NewActivity};
use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::db::models::Driver;
use crate::dispatch::store;
use crate::error::DispatchError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDriverRequest {
    pub display_name: String,
    pub license_verified: bool,
}

/// PUT /api/admin/drivers/{id}
///
/// Create or update a driver record. Admin only.
pub async fn update_driver(
    State(state): State<AppState>,
    claims: Claims,
    Path(driver_id): Path<String>,
    Json(body): Json<UpdateDriverRequest>,
) -> Result<Json<Driver>, DispatchError> {
    if claims.role != Role::Admin {
        return Err(DispatchError::Forbidden("admin role required"));
    }
    let display_name = body.display_name.trim().to_string();
    if display_name.is_empty() {
        return Err(DispatchError::Invalid("displayName is required".into()));
    }

    let db = state.db.clone();
    let id = driver_id.clone();
    let verified = body.license_verified;
    let driver = tokio::task::spawn_blocking(move || -> Result<Driver, DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        Ok(store::upsert_driver(&conn, &id, &display_name, verified, crate::now_millis())?)
    })
    .await??;

    if !driver.license_verified {
        state.presence.unregister_driver(&driver.id);
    }

    tracing::info!(
        driver_id = %driver.id,
        license_verified = driver.license_verified,
        "Driver record updated"
    );

    activity::record(
        &state,
        NewActivity {
            actor_id: claims.sub.clone(),
            action: if driver.license_verified {
                "driver.verified"
            } else {
                "driver.unverified"
            },
            entity_type: "driver",
            entity_id: driver.id.clone(),
            details: driver.display_name.clone(),
        },
    )
    .await;

    Ok(Json(driver))
}
