//! Client half of the Connection Manager.
//!
//! A [`Connection`] owns one socket at a time. When the socket drops, a
//! background task redials with linear backoff (`k * backoff_step` before
//! attempt `k`) up to `max_reconnect_attempts`, then emits
//! [`Lifecycle::GaveUp`]. Subscriptions do not survive a disconnect: callers
//! re-subscribe and re-join their rooms on every `Connected`.

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::client::{ClientConfig, ClientError};
use crate::ws::events::{ClientEvent, ServerEvent};
use crate::ws::handler::{CLOSE_TOKEN_EXPIRED, CLOSE_TOKEN_INVALID};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connected,
    Disconnected,
    /// Reconnect attempts exhausted or the token was rejected. Terminal.
    GaveUp,
}

struct Shared {
    identity: String,
    subscriptions: DashMap<u64, (String, Handler)>,
    next_subscription: AtomicU64,
    /// Writer channel of the live socket; `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    lifecycle: broadcast::Sender<Lifecycle>,
    /// Last emitted lifecycle event.
    status: watch::Sender<Lifecycle>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn new(identity: &str) -> Self {
        let (lifecycle, _) = broadcast::channel(16);
        let (shutdown, _) = watch::channel(false);
        let (status, _) = watch::channel(Lifecycle::Disconnected);
        Self {
            identity: identity.to_string(),
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            outbound: Mutex::new(None),
            lifecycle,
            status,
            shutdown,
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Message>>) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = tx;
        }
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.outbound.lock().ok().and_then(|slot| slot.clone())
    }

    fn emit(&self, event: Lifecycle) {
        tracing::debug!(identity = %self.identity, lifecycle = ?event, "Connection lifecycle");
        self.status.send_replace(event);
        let _ = self.lifecycle.send(event);
    }

    fn dispatch(&self, event: &ServerEvent) {
        let name = event.name();
        // Clone handlers out so a handler may subscribe or unsubscribe.
        let handlers: Vec<Handler> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().0 == name)
            .map(|entry| entry.value().1.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

/// Dials connections. Holds configuration only; each [`Connection`] it
/// returns is independent.
pub struct ConnectionManager {
    config: ClientConfig,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a connection for `identity`. The first dial is retried with the
    /// same backoff as a reconnect. The returned connection is already live,
    /// so its first `Connected` has been emitted before the caller can
    /// observe lifecycle events.
    pub async fn connect(&self, identity: &str, token: &str) -> Result<Connection, ClientError> {
        let url = format!("{}?token={}", self.config.ws_url(), token);
        let shared = Arc::new(Shared::new(identity));
        let mut shutdown_rx = shared.shutdown.subscribe();

        let socket = dial_with_backoff(&self.config, &url, identity, true, &mut shutdown_rx).await?;
        tracing::info!(identity = %identity, "Connected");

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(drive(
            shared.clone(),
            self.config.clone(),
            url,
            socket,
            shutdown_rx,
            ready_tx,
        ));
        // Wait until the writer channel is installed.
        let _ = ready_rx.await;

        Ok(Connection { shared })
    }
}

/// Handle to a managed connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outbound().is_some()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<Lifecycle> {
        self.shared.lifecycle.subscribe()
    }

    /// The most recent lifecycle event, for callers that subscribed late.
    pub fn status(&self) -> Lifecycle {
        *self.shared.status.borrow()
    }

    /// Register a handler for one server event name (e.g. `"driver_request"`).
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscriptions
            .insert(id, (event.to_string(), Arc::new(handler)));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.len()
    }

    /// Send an event on the live socket. Fails fast while disconnected;
    /// nothing is queued for a later socket.
    pub fn publish(&self, event: &ClientEvent) -> Result<(), ClientError> {
        let tx = self.shared.outbound().ok_or(ClientError::NotConnected)?;
        let text = serde_json::to_string(event)?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Close the socket and stop reconnecting.
    pub fn teardown(&self) {
        tracing::info!(identity = %self.shared.identity, "Connection teardown");
        self.shared.shutdown.send_replace(true);
    }
}

pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscriptions.remove(&self.id);
        }
    }
}

enum SessionEnd {
    Lost,
    Rejected { code: u16, reason: String },
    Shutdown,
}

async fn dial_with_backoff(
    config: &ClientConfig,
    url: &str,
    identity: &str,
    first_immediate: bool,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Socket, ClientError> {
    let mut attempts = 0;

    if first_immediate {
        attempts += 1;
        match connect_async(url).await {
            Ok((socket, _)) => return Ok(socket),
            Err(e) => {
                tracing::warn!(identity = %identity, attempt = attempts, error = %e, "Dial failed");
            }
        }
    }

    for k in 1..=config.max_reconnect_attempts {
        let delay = config.backoff(k);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return Err(ClientError::NotConnected),
        }

        attempts += 1;
        match connect_async(url).await {
            Ok((socket, _)) => {
                tracing::info!(identity = %identity, attempt = k, "Reconnected");
                return Ok(socket);
            }
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    attempt = k,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Dial failed"
                );
            }
        }
    }

    Err(ClientError::RetriesExhausted { attempts })
}

async fn drive(
    shared: Arc<Shared>,
    config: ClientConfig,
    url: String,
    mut socket: Socket,
    mut shutdown_rx: watch::Receiver<bool>,
    ready: tokio::sync::oneshot::Sender<()>,
) {
    let mut ready = Some(ready);

    loop {
        let end = run_session(&shared, socket, &mut shutdown_rx, ready.take()).await;

        shared.set_outbound(None);
        shared.subscriptions.clear();
        shared.emit(Lifecycle::Disconnected);

        match end {
            SessionEnd::Shutdown => {
                tracing::info!(identity = %shared.identity, "Connection closed");
                return;
            }
            SessionEnd::Rejected { code, reason } => {
                tracing::warn!(
                    identity = %shared.identity,
                    code = code,
                    reason = %reason,
                    "Token rejected"
                );
                shared.emit(Lifecycle::GaveUp);
                return;
            }
            SessionEnd::Lost => {
                tracing::warn!(identity = %shared.identity, "Connection lost, reconnecting");
            }
        }

        match dial_with_backoff(&config, &url, &shared.identity, false, &mut shutdown_rx).await {
            Ok(next) => socket = next,
            // torn down while waiting
            Err(ClientError::NotConnected) => return,
            Err(e) => {
                tracing::warn!(identity = %shared.identity, error = %e, "Giving up");
                shared.emit(Lifecycle::GaveUp);
                return;
            }
        }
    }
}

async fn run_session(
    shared: &Shared,
    socket: Socket,
    shutdown_rx: &mut watch::Receiver<bool>,
    ready: Option<tokio::sync::oneshot::Sender<()>>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    shared.set_outbound(Some(tx.clone()));
    shared.emit(Lifecycle::Connected);
    if let Some(ready) = ready {
        let _ = ready.send(());
    }

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let end = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = tx.send(Message::Close(None));
                break SessionEnd::Shutdown;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => shared.dispatch(&event),
                        Err(e) => {
                            tracing::debug!(
                                identity = %shared.identity,
                                error = %e,
                                "Undecodable server event"
                            );
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let rejected = frame.and_then(|f| {
                        let code = u16::from(f.code);
                        (code == CLOSE_TOKEN_EXPIRED || code == CLOSE_TOKEN_INVALID)
                            .then(|| (code, f.reason.as_str().to_string()))
                    });
                    break match rejected {
                        Some((code, reason)) => SessionEnd::Rejected { code, reason },
                        None => SessionEnd::Lost,
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(identity = %shared.identity, error = %e, "Socket error");
                    break SessionEnd::Lost;
                }
                None => break SessionEnd::Lost,
            }
        }
    };

    shared.set_outbound(None);
    drop(tx);
    // let a pending close frame flush
    if tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::events::MessageEvent;
    use std::sync::atomic::AtomicUsize;

    fn detached(identity: &str) -> Connection {
        Connection {
            shared: Arc::new(Shared::new(identity)),
        }
    }

    #[test]
    fn handlers_only_see_their_event() {
        let conn = detached("drv-1");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = conn.subscribe("driver_register_error", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        conn.shared.dispatch(&ServerEvent::DriverRegisterError(MessageEvent {
            message: "nope".into(),
        }));
        conn.shared.dispatch(&ServerEvent::OnlineUsers(crate::ws::events::OnlineUsersEvent {
            users: vec![],
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let conn = detached("adm-1");
        let sub = conn.subscribe("chatUpdate", |_| {});
        assert_eq!(conn.subscription_count(), 1);
        sub.unsubscribe();
        assert_eq!(conn.subscription_count(), 0);
    }

    #[test]
    fn publish_fails_fast_when_disconnected() {
        let conn = detached("cust-1");
        let err = conn.publish(&ClientEvent::GetOnlineUsers).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }
}
