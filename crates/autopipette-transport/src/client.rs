use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::{Result, TransportError};
use crate::events::{BridgeEvent, EventQueue};
use crate::message::{Incoming, Notification, Request};
use crate::pending::PendingTable;
use crate::upload::{spawn_upload, UploadHandle};

/// Default number of queued events before the oldest is dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Largest message accepted from the bridge (16 MiB).
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connectivity as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Where and how to reach the bridge.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the bridge, `ws://host:port/websocket`.
    pub address: String,
    /// HTTP endpoint accepting multipart file uploads.
    pub upload_url: String,
    pub upload_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
    pub event_capacity: usize,
    /// Inbound messages larger than this end the session.
    pub max_message: usize,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("ws://{host}:{port}/websocket"),
            upload_url: format!("http://{host}/server/files/upload"),
            upload_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_message: DEFAULT_MAX_MESSAGE,
        }
    }
}

type Handler = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// State shared between callers and the supervisor task.
struct Shared {
    pending: PendingTable,
    handlers: Mutex<HashMap<String, Handler>>,
    events: EventQueue,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Handler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, payload: &[u8]) {
        match Incoming::parse(payload) {
            Ok(Incoming::Reply { id, outcome }) => {
                let body = match &outcome {
                    Ok(result) => result.clone(),
                    Err(err) => serde_json::to_value(err).unwrap_or(Value::Null),
                };
                if !self.pending.resolve(id, outcome.map_err(TransportError::Remote)) {
                    debug!(id, "reply without a waiter");
                    self.events.push(BridgeEvent::UnmatchedReply { id, body });
                }
            }
            Ok(Incoming::Notification { method, params }) => {
                let handler = self.handlers().get(&method).cloned();
                match handler {
                    Some(handler) => {
                        if let Err(error) = handler(&params) {
                            warn!(method = %method, error = %error, "notification handler failed");
                            self.events.push(BridgeEvent::HandlerError { method, error });
                        }
                    }
                    None => self.events.push(BridgeEvent::Notification { method, params }),
                }
            }
            Err(err) => {
                warn!(error = %err, "unreadable message from bridge");
                self.events.push(BridgeEvent::ParseError {
                    error: err.to_string(),
                });
            }
        }
    }
}

enum SessionEnd {
    Cancelled,
    Lost(String),
}

/// Persistent JSON-RPC connection to the firmware bridge.
///
/// One background task owns the socket, reconnecting with exponential
/// backoff until [`BridgeClient::stop`]. Every public method may be called
/// from any thread; `send_request` blocks only its caller.
pub struct BridgeClient {
    config: ClientConfig,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl BridgeClient {
    /// Start the supervisor. Connecting happens in the background.
    ///
    /// Fails right away if `config.address` is not a WebSocket URL.
    pub fn start(config: ClientConfig) -> Result<Self> {
        config
            .address
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidAddress {
                address: config.address.clone(),
                reason: err.to_string(),
            })?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("autopipette-bridge")
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;
        let handle = runtime.handle().clone();

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            pending: PendingTable::default(),
            handlers: Mutex::new(HashMap::new()),
            events: EventQueue::new(config.event_capacity),
            state,
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        runtime.spawn(supervise(
            config.clone(),
            Arc::clone(&shared),
            outbound_rx,
            cancel.clone(),
        ));
        info!(address = %config.address, "bridge client started");

        Ok(Self {
            config,
            shared,
            outbound,
            cancel,
            runtime: Mutex::new(Some(runtime)),
            handle,
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Block until connected or `timeout` elapses. Returns whether connected.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let mut rx = self.subscribe();
        let wait = async move {
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Connected))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
        };
        // `block_on` is only valid outside the runtime's own threads.
        match Handle::try_current() {
            Ok(_) => self.is_connected(),
            Err(_) => self.handle.block_on(wait),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    /// Send a request and block until its reply or `timeout`.
    ///
    /// A timeout only fails this request; the connection stays up and a late
    /// reply is reported as [`BridgeEvent::UnmatchedReply`].
    pub fn send_request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        self.ensure_running()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_string(&Request::new(id, method, &params))?;

        let rx = self.shared.pending.register(id);
        if self.outbound.send(payload).is_err() {
            self.shared.pending.remove(id);
            return Err(TransportError::Shutdown);
        }
        debug!(id, method, "request sent");

        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.shared.pending.remove(id);
                warn!(id, method, ?timeout, "request timed out");
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    /// Fire-and-forget message.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        self.ensure_running()?;
        let payload = serde_json::to_string(&Notification::new(method, &params))?;
        self.outbound
            .send(payload)
            .map_err(|_| TransportError::Shutdown)?;
        debug!(method, "notification sent");
        Ok(())
    }

    /// Route notifications named `method` to `handler` instead of the queue.
    pub fn register_handler<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.shared
            .handlers()
            .insert(method.to_string(), Arc::new(handler));
    }

    pub fn remove_handler(&self, method: &str) -> bool {
        self.shared.handlers().remove(method).is_some()
    }

    /// Upload a file out of band; the handle resolves to the server path.
    pub fn upload_file(&self, name: &str, bytes: Vec<u8>) -> UploadHandle {
        spawn_upload(
            &self.config.upload_url,
            name,
            bytes,
            self.config.upload_timeout,
        )
    }

    /// Take every queued event.
    pub fn drain_events(&self) -> Vec<BridgeEvent> {
        self.shared.events.drain()
    }

    /// Wait up to `timeout` for the next queued event.
    pub fn next_event(&self, timeout: Duration) -> Option<BridgeEvent> {
        self.shared.events.next(timeout)
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Cancel the supervisor, close the socket and fail pending requests.
    /// Calling it again does nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        self.shared.pending.fail_all(|| TransportError::Shutdown);
        self.shared.state.send_replace(ConnectionState::Disconnected);
        info!("bridge client stopped");
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn supervise(
    config: ClientConfig,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(config.backoff);
    loop {
        shared.state.send_replace(ConnectionState::Connecting);
        let connect = tokio_tungstenite::connect_async_with_config(
            config.address.as_str(),
            Some(socket_config(config.max_message)),
            true,
        );
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = tokio::time::timeout(config.connect_timeout, connect) => attempt,
        };

        let retry_in = match attempt {
            Ok(Ok((socket, _))) => {
                backoff.reset();
                shared.state.send_replace(ConnectionState::Connected);
                info!(address = %config.address, "connected to bridge");

                let end = run_session(socket, &shared, &mut outbound, &cancel).await;
                shared.state.send_replace(ConnectionState::Disconnected);
                shared.pending.fail_all(|| TransportError::Disconnected);
                while outbound.try_recv().is_ok() {}

                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost(reason) => {
                        let retry_in = backoff.next_delay();
                        warn!(reason = %reason, delay_ms = retry_in.as_millis() as u64, "bridge connection lost");
                        shared
                            .events
                            .push(BridgeEvent::Disconnected { reason, retry_in });
                        retry_in
                    }
                }
            }
            Ok(Err(err)) => connect_failed(&shared, &mut backoff, err.to_string()),
            Err(_) => connect_failed(&shared, &mut backoff, "connect timed out".to_string()),
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(retry_in) => {}
        }
    }
    shared.state.send_replace(ConnectionState::Disconnected);
    shared.pending.fail_all(|| TransportError::Shutdown);
    debug!("supervisor exited");
}

fn socket_config(max_message: usize) -> WebSocketConfig {
    let mut ws = WebSocketConfig::default();
    ws.max_message_size = Some(max_message);
    ws.max_frame_size = Some(max_message);
    ws
}

fn connect_failed(shared: &Shared, backoff: &mut Backoff, error: String) -> Duration {
    shared.state.send_replace(ConnectionState::Disconnected);
    let retry_in = backoff.next_delay();
    warn!(error = %error, delay_ms = retry_in.as_millis() as u64, "bridge connect failed");
    shared
        .events
        .push(BridgeEvent::ConnectionError { error, retry_in });
    retry_in
}

/// Pump one connection until it fails or the client is cancelled.
///
/// Every JSON-RPC message travels as one text message. Pings are answered
/// by the WebSocket layer itself.
async fn run_session(
    mut socket: Socket,
    shared: &Shared,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> SessionEnd {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = socket.close(None).await;
                return SessionEnd::Cancelled;
            }
            message = outbound.recv() => match message {
                Some(text) => {
                    if let Err(err) = socket.send(Message::Text(text)).await {
                        return SessionEnd::Lost(err.to_string());
                    }
                }
                None => return SessionEnd::Cancelled,
            },
            inbound = socket.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.dispatch(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => shared.dispatch(&data),
                Some(Ok(Message::Close(frame))) => {
                    let reason = match frame {
                        Some(frame) => format!(
                            "bridge closed the connection ({}: {})",
                            u16::from(frame.code),
                            frame.reason
                        ),
                        None => "bridge closed the connection".to_string(),
                    };
                    return SessionEnd::Lost(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                None => return SessionEnd::Lost("bridge closed the connection".to_string()),
            },
        }
    }
}
