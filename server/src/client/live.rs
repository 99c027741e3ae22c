//! A console's live view: socket events folded over REST snapshots.
//!
//! On every `Connected` the view re-subscribes, re-joins its rooms and
//! pulls a fresh snapshot; on `Disconnected` it goes stale and buffers.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::client::reconcile::{ConsistentView, Phase, Reconciler, Snapshot};
use crate::client::{ApiClient, ClientError, Connection, ConnectionManager, Lifecycle};
use crate::ws::events::{
    ClientEvent, DriverAcceptPayload, DriverAcceptedEvent, DriverDeclinePayload,
    DriverRegisterPayload, RoomPayload, ServerEvent,
};

/// Events that change the reconciled view.
const VIEW_EVENTS: &[&str] = &[
    "chatUpdate",
    "newSupportRequest",
    "newMessage",
    "driver_request",
    "driver_closed",
    "driver_accepted",
];

/// Which console this view backs. Decides the rooms joined and the
/// snapshot fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Admin,
    Customer { session_id: String },
    Driver,
}

pub struct LiveView {
    connection: Connection,
    api: ApiClient,
    reconciler: Arc<Mutex<Reconciler>>,
    lifecycle_task: JoinHandle<()>,
}

impl LiveView {
    /// Connect, sync once, and keep syncing across reconnects.
    pub async fn start(
        manager: &ConnectionManager,
        api: ApiClient,
        identity: &str,
        token: &str,
        audience: Audience,
    ) -> Result<Self, ClientError> {
        let connection = manager.connect(identity, token).await?;
        let reconciler = Arc::new(Mutex::new(Reconciler::new()));
        let mut lifecycle = connection.lifecycle();

        sync(&connection, &api, &audience, &reconciler).await?;

        let task_conn = connection.clone();
        let task_api = api.clone();
        let task_rec = reconciler.clone();
        let lifecycle_task = tokio::spawn(async move {
            loop {
                match lifecycle.recv().await {
                    Ok(Lifecycle::Disconnected) => with(&task_rec, Reconciler::connection_lost),
                    Ok(Lifecycle::Connected) => {
                        if let Err(e) = sync(&task_conn, &task_api, &audience, &task_rec).await {
                            tracing::warn!(
                                identity = %task_conn.identity(),
                                error = %e,
                                "Resync after reconnect failed"
                            );
                        }
                    }
                    Ok(Lifecycle::GaveUp) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                }
            }
        });

        Ok(Self {
            connection,
            api,
            reconciler,
            lifecycle_task,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Copy of the current reconciled state.
    pub fn view(&self) -> ConsistentView {
        self.reconciler
            .lock()
            .map(|r| r.view().clone())
            .unwrap_or_default()
    }

    pub fn phase(&self) -> Phase {
        self.reconciler
            .lock()
            .map(|r| r.phase())
            .unwrap_or(Phase::Stale)
    }

    /// Accept a pending request. Uses the socket when live, REST otherwise;
    /// both reach the same arbiter. The socket path reports its outcome as
    /// `driver_accepted` or an `error` event.
    pub async fn accept(&self, request_id: &str) -> Result<(), ClientError> {
        let booking_id = self
            .view()
            .pending_request(request_id)
            .map(|p| p.booking_id.clone());

        if let Some(booking_id) = booking_id {
            let event = ClientEvent::DriverAccept(DriverAcceptPayload {
                booking_id,
                driver_id: self.connection.identity().to_string(),
            });
            match self.connection.publish(&event) {
                Ok(()) => return Ok(()),
                Err(ClientError::NotConnected) => {}
                Err(e) => return Err(e),
            }
        }

        let request = self.api.accept_ride_request(request_id).await?;
        with(&self.reconciler, |r| {
            r.apply_event(ServerEvent::DriverAccepted(DriverAcceptedEvent {
                booking_id: request.booking_id.clone(),
                request_id: request.id.clone(),
            }))
        });
        Ok(())
    }

    /// Decline locally and tell the server so it is not offered again.
    pub async fn decline(&self, request_id: &str) -> Result<(), ClientError> {
        let booking_id = self
            .view()
            .pending_request(request_id)
            .map(|p| p.booking_id.clone());
        with(&self.reconciler, |r| r.decline(request_id));

        if let Some(booking_id) = booking_id {
            let event = ClientEvent::DriverDecline(DriverDeclinePayload { booking_id });
            if self.connection.publish(&event).is_ok() {
                return Ok(());
            }
        }
        self.api.decline_ride_request(request_id).await
    }

    /// Tidy pending requests past the server timeout.
    pub fn prune_expired(&self, timeout_millis: i64) -> usize {
        self.reconciler
            .lock()
            .map(|mut r| r.prune_expired(crate::now_millis(), timeout_millis))
            .unwrap_or(0)
    }

    pub fn shutdown(self) {
        self.connection.teardown();
        self.lifecycle_task.abort();
    }
}

fn with<F>(reconciler: &Mutex<Reconciler>, f: F)
where
    F: FnOnce(&mut Reconciler),
{
    if let Ok(mut guard) = reconciler.lock() {
        f(&mut guard);
    }
}

/// Subscribe, join rooms, then fetch and apply the snapshot. Events that
/// arrive before the snapshot lands are buffered by the reconciler.
async fn sync(
    connection: &Connection,
    api: &ApiClient,
    audience: &Audience,
    reconciler: &Arc<Mutex<Reconciler>>,
) -> Result<(), ClientError> {
    for name in VIEW_EVENTS {
        let rec = reconciler.clone();
        connection.subscribe(name, move |event| {
            with(&rec, |r| r.apply_event(event.clone()));
        });
    }
    let identity = connection.identity().to_string();
    connection.subscribe("error", move |event| {
        if let ServerEvent::Error(e) = event {
            tracing::warn!(
                identity = %identity,
                code = %e.code,
                "Server rejected event: {}",
                e.message
            );
        }
    });

    let join = match audience {
        Audience::Admin => ClientEvent::JoinAdminRoom,
        Audience::Customer { session_id } => ClientEvent::JoinRoom(RoomPayload {
            session_id: session_id.clone(),
        }),
        Audience::Driver => ClientEvent::DriverRegister(DriverRegisterPayload {
            driver_id: connection.identity().to_string(),
        }),
    };
    connection.publish(&join)?;

    let snapshot = match audience {
        Audience::Admin => Snapshot {
            sessions: api.list_chat_sessions(None).await?,
            requests: Vec::new(),
        },
        Audience::Customer { session_id } => Snapshot {
            sessions: vec![api.get_chat_session(session_id).await?],
            requests: Vec::new(),
        },
        Audience::Driver => Snapshot {
            sessions: Vec::new(),
            requests: api.list_driver_requests().await?,
        },
    };
    with(reconciler, |r| r.apply_snapshot(snapshot));
    tracing::debug!(identity = %connection.identity(), "View synced");
    Ok(())
}
