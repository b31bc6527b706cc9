//! Transport link – one persistent WebSocket connection from a node to the
//! broker.
//!
//! The link owns the node's remote view: which topics it follows, which
//! services it provides and which service calls are still waiting for a
//! response.  A single background task drives the connection:
//!
//! ```text
//!  Disconnected ──► Connecting ──(NODE_ANNOUNCE round-trip)──► Connected
//!       ▲                                                          │
//!       └─────────────── socket error / close / broker gone ◄──────┘
//! ```
//!
//! On entering `Connected` every active subscription and service
//! registration is replayed before any queued traffic is written, so the
//! broker's view of the node matches the node's own state after each
//! reconnect.  Reconnects happen after a fixed interval, indefinitely, until
//! [`TransportLink::shutdown`].

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use nodebus_types::{
    BusError, MessageType, NODES_PATH, Payload, TransportMessage, new_message_id,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};

use crate::handle::Registration;
use crate::pubsub::panic_message;
use crate::service::{PayloadHandler, RemoteCaller};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback receiving the raw payload of a remotely published message.
pub type RemoteCallback = Arc<dyn Fn(&Payload) + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection settings of a [`TransportLink`].
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Fixed delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// How long to wait for the broker to acknowledge NODE_ANNOUNCE.
    pub handshake_timeout: Duration,
    /// How long [`TransportLink::shutdown`] waits for the final flush.
    pub shutdown_grace: Duration,
    /// Publishes held while the broker is unreachable.  Further publishes
    /// are dropped until the queue drains.
    pub max_queued_publishes: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            reconnect_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
            max_queued_publishes: 1024,
        }
    }
}

impl LinkConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_queued_publishes(mut self, limit: usize) -> Self {
        self.max_queued_publishes = limit;
        self
    }

    /// `ws://host:port/nodes`
    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, NODES_PATH)
    }
}

/// Connection state reported by [`TransportLink::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Shut down; the link never reconnects.
    Stopped,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Outbound {
    /// Connection epoch a control message was produced for.  Data messages
    /// carry `None` and survive reconnects.
    epoch: Option<u64>,
    message: TransportMessage,
}

#[derive(Default)]
struct LinkTables {
    topics: HashMap<String, Vec<(u64, RemoteCallback)>>,
    services: HashMap<String, (u64, Arc<dyn PayloadHandler>)>,
    connected: bool,
    epoch: u64,
}

struct LinkInner {
    node_name: String,
    uuid: String,
    config: LinkConfig,
    tables: Mutex<LinkTables>,
    pending: Mutex<HashMap<String, oneshot::Sender<Payload>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    state: watch::Sender<LinkState>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    queued_publishes: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a node's connection to the broker.  Cheap to clone.
///
/// Dropping the last clone stops the connection task the way
/// [`TransportLink::shutdown`] does, without waiting for it.
#[derive(Clone)]
pub struct TransportLink {
    inner: Arc<LinkInner>,
    _owner: Arc<LinkOwner>,
}

/// Shared by the user-facing clones only.  The connection task holds
/// `LinkInner` directly, so this drops with the last handle.
struct LinkOwner(Arc<LinkInner>);

impl Drop for LinkOwner {
    fn drop(&mut self) {
        let inner = &self.0;
        if inner.stop.send_replace(true) {
            return;
        }
        lock(&inner.pending).clear();
        let Some(mut task) = lock(&inner.task).take() else {
            inner.state.send_replace(LinkState::Stopped);
            return;
        };
        debug!(node = %inner.node_name, "last link handle dropped, stopping connection task");
        let grace = inner.config.shutdown_grace;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if tokio::time::timeout(grace, &mut task).await.is_err() {
                        task.abort();
                    }
                });
            }
            Err(_) => task.abort(),
        }
    }
}

impl TransportLink {
    /// Create a link for `node_name`.  `uuid` identifies the sending process
    /// instance on the wire.  Nothing connects until [`TransportLink::start`].
    pub fn new(node_name: impl Into<String>, uuid: impl Into<String>, config: LinkConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (stop, _) = watch::channel(false);
        let inner = Arc::new(LinkInner {
            node_name: node_name.into(),
            uuid: uuid.into(),
            config,
            tables: Mutex::new(LinkTables::default()),
            pending: Mutex::new(HashMap::new()),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            state,
            stop,
            task: Mutex::new(None),
            next_id: AtomicU64::new(0),
            queued_publishes: AtomicUsize::new(0),
        });
        Self {
            _owner: Arc::new(LinkOwner(Arc::clone(&inner))),
            inner,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Publishes queued but not yet written to the broker.
    pub fn queued_publishes(&self) -> usize {
        self.inner.queued_publishes.load(Ordering::Acquire)
    }

    /// Number of service calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Spawn the connection task.  Must be called from within a Tokio
    /// runtime; calling it twice has no effect.
    pub fn start(&self) {
        let Some(outbound_rx) = lock(&self.inner.outbound_rx).take() else {
            debug!(node = %self.inner.node_name, "transport link already started");
            return;
        };
        if *self.inner.stop.borrow() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let stop = self.inner.stop.subscribe();
        let handle = tokio::spawn(run(inner, outbound_rx, stop));
        *lock(&self.inner.task) = Some(handle);
    }

    /// Wait until the link is connected.  Returns `false` if `timeout`
    /// elapses first or the link stops.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| matches!(s, LinkState::Connected | LinkState::Stopped)),
        )
        .await;
        matches!(reached, Ok(Ok(s)) if *s == LinkState::Connected)
    }

    // ── Publish / subscribe ──────────────────────────────────────────────

    /// Queue a PUBLISH for the broker.  Fire-and-forget: messages published
    /// while disconnected are written once the link reconnects, up to
    /// [`LinkConfig::max_queued_publishes`] of them.
    pub fn publish(&self, topic: &str, payload: Payload) {
        if self.is_stopped() {
            trace!(topic, "transport link stopped, dropping publish");
            return;
        }
        let queued = self.inner.queued_publishes.fetch_add(1, Ordering::AcqRel);
        if queued >= self.inner.config.max_queued_publishes {
            self.inner.queued_publishes.fetch_sub(1, Ordering::AcqRel);
            debug!(topic, queued, "outbound queue full, dropping publish");
            return;
        }
        let message = self.inner.message(MessageType::Publish, topic).with_data(payload);
        self.inner.enqueue(None, message);
    }

    /// Follow `topic` remotely.  SUBSCRIBE goes on the wire only for the
    /// first callback of a topic; releasing the last one sends UNSUBSCRIBE.
    pub fn subscribe(&self, topic: &str, callback: RemoteCallback) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut tables = lock(&self.inner.tables);
            let callbacks = tables.topics.entry(topic.to_string()).or_default();
            callbacks.push((id, callback));
            if callbacks.len() == 1 {
                self.inner.enqueue_control(&tables, MessageType::Subscribe, topic);
            }
        }
        debug!(node = %self.inner.node_name, topic, "subscribed remotely");

        let link = Arc::downgrade(&self.inner);
        let name = topic.to_string();
        Registration::new(topic, move || {
            if let Some(inner) = Weak::upgrade(&link) {
                inner.unsubscribe(&name, id);
            }
        })
    }

    /// Drop every remote callback of `topic`.  Idempotent.
    pub fn unsubscribe_all(&self, topic: &str) {
        let mut tables = lock(&self.inner.tables);
        if tables.topics.remove(topic).is_some() {
            self.inner.enqueue_control(&tables, MessageType::Unsubscribe, topic);
        }
    }

    /// Topics followed remotely, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.inner.tables).topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    // ── Services ─────────────────────────────────────────────────────────

    /// Serve `name` to remote callers through `handler`.
    pub fn register_service(&self, name: &str, handler: Arc<dyn PayloadHandler>) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut tables = lock(&self.inner.tables);
            if tables.services.insert(name.to_string(), (id, handler)).is_none() {
                self.inner.enqueue_control(&tables, MessageType::ServiceRegister, name);
            }
        }
        debug!(node = %self.inner.node_name, service = name, "registered remote service");

        let link = Arc::downgrade(&self.inner);
        let service = name.to_string();
        Registration::new(name, move || {
            if let Some(inner) = Weak::upgrade(&link) {
                inner.unregister_service(&service, Some(id));
            }
        })
    }

    /// Stop serving `name` to remote callers.  Idempotent.
    pub fn unregister_service(&self, name: &str) {
        self.inner.unregister_service(name, None);
    }

    /// Services offered remotely, sorted.
    pub fn registered_services(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.tables).services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Call a service provided by another node and wait for its response.
    ///
    /// The returned payload may be a structured error payload; see
    /// [`BusError::from_error_payload`].
    ///
    /// # Errors
    ///
    /// * [`BusError::ServiceTimeout`] – no response within `timeout`; the
    ///   pending entry is evicted so a late response resolves nothing.
    /// * [`BusError::ConnectionLost`] – the link was shut down before or
    ///   while waiting.
    pub async fn call_service(
        &self,
        service: &str,
        request: Payload,
        timeout: Duration,
    ) -> Result<Payload, BusError> {
        if self.is_stopped() {
            return Err(BusError::ConnectionLost(format!(
                "transport link of {} is shut down",
                self.inner.node_name
            )));
        }

        let message_id = new_message_id(&self.inner.node_name, service);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(message_id.clone(), tx);

        let message = self
            .inner
            .message(MessageType::ServiceRequest, service)
            .with_data(request)
            .with_message_id(message_id.clone());
        debug!(service, message_id = %message_id, "sending service request");
        self.inner.enqueue(None, message);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BusError::ConnectionLost(format!(
                "transport link of {} closed while awaiting {service}",
                self.inner.node_name
            ))),
            Err(_) => {
                lock(&self.inner.pending).remove(&message_id);
                warn!(service, message_id = %message_id, ?timeout, "service call timed out");
                Err(BusError::ServiceTimeout {
                    service: service.to_string(),
                    timeout,
                })
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Send NODE_SHUTDOWN, wait up to the configured grace period for the
    /// connection task to flush and close, then fail every pending call with
    /// [`BusError::ConnectionLost`].
    pub async fn shutdown(&self) {
        if self.inner.stop.send_replace(true) {
            return;
        }
        info!(node = %self.inner.node_name, "shutting down transport link");

        let task = lock(&self.inner.task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.inner.config.shutdown_grace, &mut task)
                .await
                .is_err()
            {
                warn!(node = %self.inner.node_name, "transport link did not stop in time, aborting");
                task.abort();
            }
        }

        lock(&self.inner.pending).clear();
        lock(&self.inner.tables).connected = false;
        self.inner.state.send_replace(LinkState::Stopped);
    }

    fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }
}

#[async_trait]
impl RemoteCaller for TransportLink {
    async fn call_remote(&self, service: &str, request: Payload, timeout: Duration) -> Result<Payload, BusError> {
        self.call_service(service, request, timeout).await
    }
}

impl LinkInner {
    fn message(&self, msg_type: MessageType, topic_or_service: &str) -> TransportMessage {
        TransportMessage::new(msg_type, self.node_name.clone(), self.uuid.clone(), topic_or_service)
    }

    fn enqueue(&self, epoch: Option<u64>, message: TransportMessage) {
        if self.outbound.send(Outbound { epoch, message }).is_err() {
            debug!(node = %self.node_name, "outbound queue closed, dropping message");
        }
    }

    /// Queue a control message for the current connection.  While
    /// disconnected nothing is queued: the replay on reconnect covers it.
    fn enqueue_control(&self, tables: &LinkTables, msg_type: MessageType, name: &str) {
        if tables.connected {
            self.enqueue(Some(tables.epoch), self.message(msg_type, name));
        }
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut tables = lock(&self.tables);
        let Some(callbacks) = tables.topics.get_mut(topic) else {
            return;
        };
        callbacks.retain(|(cid, _)| *cid != id);
        if callbacks.is_empty() {
            tables.topics.remove(topic);
            self.enqueue_control(&tables, MessageType::Unsubscribe, topic);
            debug!(node = %self.node_name, topic, "unsubscribed remotely");
        }
    }

    fn unregister_service(&self, name: &str, id: Option<u64>) {
        let mut tables = lock(&self.tables);
        let matches = tables
            .services
            .get(name)
            .is_some_and(|(sid, _)| id.is_none_or(|id| id == *sid));
        if matches {
            tables.services.remove(name);
            self.enqueue_control(&tables, MessageType::ServiceUnregister, name);
            debug!(node = %self.node_name, service = name, "unregistered remote service");
        }
    }

    /// Mark the link connected and build the replay for the new epoch.
    fn enter_connected(&self) -> (u64, Vec<TransportMessage>) {
        let mut tables = lock(&self.tables);
        tables.connected = true;
        tables.epoch += 1;
        let mut replay: Vec<TransportMessage> = tables
            .topics
            .keys()
            .map(|topic| self.message(MessageType::Subscribe, topic))
            .collect();
        replay.extend(
            tables
                .services
                .keys()
                .map(|service| self.message(MessageType::ServiceRegister, service)),
        );
        (tables.epoch, replay)
    }

    fn leave_connected(&self) {
        lock(&self.tables).connected = false;
        if !*self.stop.borrow() {
            self.state.send_replace(LinkState::Disconnected);
        }
    }

    /// Whether a queued message should still be written on connection
    /// `epoch`.  Called once per dequeued message.
    fn is_current(&self, outbound: &Outbound, epoch: u64) -> bool {
        if outbound.message.msg_type == MessageType::Publish {
            self.queued_publishes.fetch_sub(1, Ordering::AcqRel);
        }
        if outbound.epoch.is_some_and(|e| e != epoch) {
            return false;
        }
        if outbound.message.msg_type == MessageType::ServiceRequest {
            // The caller gave up while the request sat in the queue.
            return outbound
                .message
                .message_id
                .as_ref()
                .is_some_and(|id| lock(&self.pending).contains_key(id));
        }
        true
    }

    // ── Connection ───────────────────────────────────────────────────────

    /// Open the socket and complete the NODE_ANNOUNCE round-trip.
    #[tracing::instrument(skip(self), fields(node = %self.node_name, url = %self.config.url()))]
    async fn connect(&self) -> Result<WsStream, BusError> {
        let (mut ws, _) = connect_async(self.config.url())
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        send_frame(&mut ws, &self.message(MessageType::NodeAnnounce, &self.node_name)).await?;

        let ack = tokio::time::timeout(self.config.handshake_timeout, async {
            while let Some(frame) = ws.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => return Err(BusError::Transport(e.to_string())),
                };
                match frame {
                    Message::Binary(bytes) => {
                        if matches!(
                            TransportMessage::decode(&bytes),
                            Ok(m) if m.msg_type == MessageType::NodeAnnounce
                        ) {
                            return Ok(());
                        }
                    }
                    Message::Close(frame) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                        return Err(BusError::ConnectionLost(format!("broker closed handshake: {reason}")));
                    }
                    _ => {}
                }
            }
            Err(BusError::ConnectionLost("broker closed during handshake".to_string()))
        })
        .await;

        match ack {
            Ok(Ok(())) => Ok(ws),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BusError::Transport(format!(
                "no NODE_ANNOUNCE acknowledgement within {:?}",
                self.config.handshake_timeout
            ))),
        }
    }

    /// Drive one established connection until it fails or the link stops.
    async fn serve(
        self: &Arc<Self>,
        ws: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), BusError> {
        let (mut sink, mut stream) = ws.split();

        let (epoch, replay) = self.enter_connected();
        for message in &replay {
            send_frame(&mut sink, message).await?;
        }
        self.state.send_replace(LinkState::Connected);
        info!(node = %self.node_name, replayed = replay.len(), "connected to broker");

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    while let Ok(pending) = outbound.try_recv() {
                        if self.is_current(&pending, epoch) {
                            send_frame(&mut sink, &pending.message).await?;
                        }
                    }
                    send_frame(&mut sink, &self.message(MessageType::NodeShutdown, &self.node_name)).await?;
                    let _ = sink.close().await;
                    return Ok(());
                }
                next = outbound.recv() => {
                    let Some(next) = next else {
                        return Ok(());
                    };
                    if self.is_current(&next, epoch) {
                        send_frame(&mut sink, &next.message).await?;
                    } else {
                        trace!(msg_type = %next.message.msg_type, "skipping stale outbound message");
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(bytes))) => match TransportMessage::decode(&bytes) {
                        Ok(message) => self.dispatch(message),
                        Err(e) => warn!(error = %e, "dropping malformed frame"),
                    },
                    Some(Ok(Message::Text(text))) => match TransportMessage::from_json(text.as_str()) {
                        Ok(message) => self.dispatch(message),
                        Err(e) => warn!(error = %e, "dropping malformed text frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(BusError::ConnectionLost("broker closed the connection".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(BusError::Transport(e.to_string())),
                },
            }
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    fn dispatch(self: &Arc<Self>, message: TransportMessage) {
        match message.msg_type {
            MessageType::Publish => self.deliver(message),
            MessageType::ServiceRequest => self.serve_request(message),
            MessageType::ServiceResponse => self.resolve(message),
            MessageType::NodeAnnounce => {}
            other => trace!(msg_type = %other, "ignoring inbound message"),
        }
    }

    fn deliver(&self, message: TransportMessage) {
        // Same-process subscribers were already served by the local registry.
        if message.uuid == self.uuid {
            trace!(topic = %message.topic_or_service, "skipping publish from own process");
            return;
        }
        let callbacks: Vec<RemoteCallback> = lock(&self.tables)
            .topics
            .get(&message.topic_or_service)
            .map(|cbs| cbs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        let payload = message.data.unwrap_or_default();
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&payload))) {
                error!(
                    topic = %message.topic_or_service,
                    error = %panic_message(&panic),
                    "remote subscriber callback panicked"
                );
            }
        }
    }

    fn serve_request(self: &Arc<Self>, request: TransportMessage) {
        let handler = lock(&self.tables)
            .services
            .get(&request.topic_or_service)
            .map(|(_, h)| Arc::clone(h));
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let service = request.topic_or_service.clone();
            let data = match handler {
                Some(handler) => match handler.handle_payload(request.data.clone().unwrap_or_default()).await {
                    Ok(payload) => payload,
                    Err(e) => e.to_error_payload(),
                },
                None => {
                    warn!(service = %service, "request for service not provided by this node");
                    BusError::ServiceNotFound(service.clone()).to_error_payload()
                }
            };
            let response = request.response(inner.node_name.clone(), inner.uuid.clone(), data);
            inner.enqueue(None, response);
        });
    }

    fn resolve(&self, response: TransportMessage) {
        let Some(message_id) = response.message_id else {
            warn!(service = %response.topic_or_service, "service response without message_id");
            return;
        };
        match lock(&self.pending).remove(&message_id) {
            Some(slot) => {
                let _ = slot.send(response.data.unwrap_or_default());
            }
            None => debug!(message_id = %message_id, "late or unknown service response"),
        }
    }
}

async fn send_frame<S>(sink: &mut S, message: &TransportMessage) -> Result<(), BusError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let bytes = message.encode()?;
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| BusError::Transport(e.to_string()))
}

/// Connection task: connect, serve, back off, repeat until stopped.
async fn run(
    inner: Arc<LinkInner>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow_and_update() {
            break;
        }
        inner.state.send_replace(LinkState::Connecting);

        let connected = tokio::select! {
            result = inner.connect() => result,
            _ = stop.changed() => break,
        };
        match connected {
            Ok(ws) => {
                if let Err(e) = inner.serve(ws, &mut outbound, &mut stop).await {
                    warn!(node = %inner.node_name, error = %e, "connection to broker lost");
                }
            }
            Err(e) => warn!(node = %inner.node_name, error = %e, "could not connect to broker"),
        }
        inner.leave_connected();

        if *stop.borrow() {
            break;
        }
        debug!(
            node = %inner.node_name,
            interval = ?inner.config.reconnect_interval,
            "reconnecting after backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(inner.config.reconnect_interval) => {}
            _ = stop.changed() => break,
        }
    }
    inner.state.send_replace(LinkState::Stopped);
    debug!(node = %inner.node_name, "transport link task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerWs = WebSocketStream<TcpStream>;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn fake_broker() -> (TcpListener, LinkConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = LinkConfig::new("127.0.0.1", port)
            .with_reconnect_interval(Duration::from_millis(50))
            .with_shutdown_grace(Duration::from_millis(500));
        (listener, config)
    }

    async fn accept(listener: &TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn recv(ws: &mut ServerWs) -> TransportMessage {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(bytes) => return TransportMessage::decode(&bytes).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send(ws: &mut ServerWs, message: &TransportMessage) {
        ws.send(Message::Binary(message.encode().unwrap().into())).await.unwrap();
    }

    /// Accept a connection and acknowledge its NODE_ANNOUNCE.
    async fn handshake(listener: &TcpListener) -> ServerWs {
        let mut ws = accept(listener).await;
        let announce = recv(&mut ws).await;
        assert_eq!(announce.msg_type, MessageType::NodeAnnounce);
        send(&mut ws, &TransportMessage::new(MessageType::NodeAnnounce, "node_server", "broker", &announce.node_name)).await;
        ws
    }

    #[test]
    fn url_points_at_nodes_endpoint() {
        assert_eq!(LinkConfig::new("10.0.0.2", 3100).url(), "ws://10.0.0.2:3100/nodes");
    }

    #[tokio::test]
    async fn unanswered_call_times_out_and_is_evicted() {
        let link = TransportLink::new("/caller", "proc-a", LinkConfig::default());
        let err = link
            .call_service("/reset", Payload::new(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::ServiceTimeout { .. }));
        assert_eq!(link.pending_calls(), 0);
    }

    #[tokio::test]
    async fn calls_after_shutdown_report_connection_lost() {
        let link = TransportLink::new("/caller", "proc-a", LinkConfig::default());
        link.shutdown().await;
        assert_eq!(link.state(), LinkState::Stopped);
        let err = link
            .call_service("/reset", Payload::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn connect_replays_subscriptions_and_services() {
        let (listener, config) = fake_broker().await;
        let link = TransportLink::new("/robot/arm", "proc-a", config);
        let _sub = link.subscribe("/telemetry", Arc::new(|_: &Payload| {}));
        let _second = link.subscribe("/telemetry", Arc::new(|_: &Payload| {}));
        link.start();

        let mut ws = handshake(&listener).await;
        let replayed = recv(&mut ws).await;
        assert_eq!(replayed.msg_type, MessageType::Subscribe);
        assert_eq!(replayed.topic_or_service, "/telemetry");
        assert!(link.wait_connected(Duration::from_secs(2)).await);

        // A later subscription goes out as a single control message.
        let _status = link.subscribe("/status", Arc::new(|_: &Payload| {}));
        let live = recv(&mut ws).await;
        assert_eq!(live.msg_type, MessageType::Subscribe);
        assert_eq!(live.topic_or_service, "/status");

        link.shutdown().await;
        assert_eq!(recv(&mut ws).await.msg_type, MessageType::NodeShutdown);
    }

    #[tokio::test]
    async fn reconnect_replays_current_state_only() {
        let (listener, config) = fake_broker().await;
        let link = TransportLink::new("/robot/arm", "proc-a", config);
        let telemetry = link.subscribe("/telemetry", Arc::new(|_: &Payload| {}));
        link.start();

        let ws = handshake(&listener).await;
        assert!(link.wait_connected(Duration::from_secs(2)).await);
        drop(ws);

        // Changed while the connection is down.
        telemetry.release();
        let _status = link.subscribe("/status", Arc::new(|_: &Payload| {}));

        let mut ws = handshake(&listener).await;
        let replayed = recv(&mut ws).await;
        assert_eq!(replayed.msg_type, MessageType::Subscribe);
        assert_eq!(replayed.topic_or_service, "/status");
        assert_eq!(link.subscribed_topics(), vec!["/status".to_string()]);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn inbound_publish_reaches_callbacks_except_own_process() {
        let (listener, config) = fake_broker().await;
        let link = TransportLink::new("/listener", "proc-a", config);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = link.subscribe(
            "/telemetry",
            Arc::new(move |p: &Payload| sink.lock().unwrap().push(p.clone())),
        );
        link.start();

        let mut ws = handshake(&listener).await;
        recv(&mut ws).await;

        let own = TransportMessage::new(MessageType::Publish, "/sibling", "proc-a", "/telemetry")
            .with_data(payload(json!({"battery": 1})));
        let remote = TransportMessage::new(MessageType::Publish, "/talker", "proc-b", "/telemetry")
            .with_data(payload(json!({"battery": 42})));
        send(&mut ws, &own).await;
        send(&mut ws, &remote).await;

        // Round-trip a request to know both publishes were processed.
        let marker = TransportMessage::new(MessageType::ServiceRequest, "/talker", "proc-b", "/missing")
            .with_message_id("marker");
        send(&mut ws, &marker).await;
        let response = recv(&mut ws).await;
        assert_eq!(response.message_id.as_deref(), Some("marker"));
        assert_eq!(
            BusError::from_error_payload("/missing", response.data.as_ref().unwrap()),
            Some(BusError::ServiceNotFound("/missing".to_string()))
        );

        assert_eq!(*seen.lock().unwrap(), vec![payload(json!({"battery": 42}))]);
        link.shutdown().await;
    }

    struct Reset;

    #[async_trait]
    impl PayloadHandler for Reset {
        async fn handle_payload(&self, _request: Payload) -> Result<Payload, BusError> {
            Ok(payload(json!({"ok": true})))
        }
    }

    #[tokio::test]
    async fn inbound_request_is_answered_with_same_message_id() {
        let (listener, config) = fake_broker().await;
        let link = TransportLink::new("/provider", "proc-a", config);
        let _svc = link.register_service("/reset", Arc::new(Reset));
        link.start();

        let mut ws = handshake(&listener).await;
        assert_eq!(recv(&mut ws).await.msg_type, MessageType::ServiceRegister);

        let request = TransportMessage::new(MessageType::ServiceRequest, "/caller", "proc-b", "/reset")
            .with_data(Payload::new())
            .with_message_id("caller_reset_1");
        send(&mut ws, &request).await;

        let response = recv(&mut ws).await;
        assert_eq!(response.msg_type, MessageType::ServiceResponse);
        assert_eq!(response.message_id.as_deref(), Some("caller_reset_1"));
        assert_eq!(response.data, Some(payload(json!({"ok": true}))));
        link.shutdown().await;
    }

    #[tokio::test]
    async fn outbound_call_resolves_on_matching_response() {
        let (listener, config) = fake_broker().await;
        let link = TransportLink::new("/caller", "proc-a", config);
        link.start();
        let mut ws = handshake(&listener).await;

        let caller = link.clone();
        let call = tokio::spawn(async move {
            caller
                .call_service("/reset", payload(json!({"seed": 3})), Duration::from_secs(5))
                .await
        });

        let request = recv(&mut ws).await;
        assert_eq!(request.msg_type, MessageType::ServiceRequest);
        assert_eq!(request.data, Some(payload(json!({"seed": 3}))));
        let response = request.response("/provider", "proc-b", payload(json!({"ok": true})));
        send(&mut ws, &response).await;

        assert_eq!(call.await.unwrap().unwrap(), payload(json!({"ok": true})));
        assert_eq!(link.pending_calls(), 0);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn last_release_of_a_topic_sends_unsubscribe() {
        let (listener, config) = fake_broker().await;
        let link = TransportLink::new("/robot/arm", "proc-a", config);
        link.start();
        let mut ws = handshake(&listener).await;
        assert!(link.wait_connected(Duration::from_secs(2)).await);

        let first = link.subscribe("/telemetry", Arc::new(|_: &Payload| {}));
        let second = link.subscribe("/telemetry", Arc::new(|_: &Payload| {}));
        let subscribe = recv(&mut ws).await;
        assert_eq!(subscribe.msg_type, MessageType::Subscribe);
        assert_eq!(subscribe.topic_or_service, "/telemetry");

        // One callback is left, so nothing goes out; the next frame on the
        // wire is the SUBSCRIBE for /status.
        first.release();
        let _status = link.subscribe("/status", Arc::new(|_: &Payload| {}));
        let next = recv(&mut ws).await;
        assert_eq!(next.msg_type, MessageType::Subscribe);
        assert_eq!(next.topic_or_service, "/status");

        second.release();
        let unsubscribe = recv(&mut ws).await;
        assert_eq!(unsubscribe.msg_type, MessageType::Unsubscribe);
        assert_eq!(unsubscribe.topic_or_service, "/telemetry");
        assert_eq!(link.subscribed_topics(), vec!["/status".to_string()]);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn released_service_sends_unregister() {
        let (listener, config) = fake_broker().await;
        let link = TransportLink::new("/provider", "proc-a", config);
        link.start();
        let mut ws = handshake(&listener).await;
        assert!(link.wait_connected(Duration::from_secs(2)).await);

        let svc = link.register_service("/reset", Arc::new(Reset));
        assert_eq!(recv(&mut ws).await.msg_type, MessageType::ServiceRegister);

        svc.release();
        let unregister = recv(&mut ws).await;
        assert_eq!(unregister.msg_type, MessageType::ServiceUnregister);
        assert_eq!(unregister.topic_or_service, "/reset");
        assert!(link.registered_services().is_empty());
        link.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_the_last_handle_shuts_the_link_down() {
        let (listener, config) = fake_broker().await;
        let link = TransportLink::new("/robot/arm", "proc-a", config);
        link.start();
        let mut ws = handshake(&listener).await;
        assert!(link.wait_connected(Duration::from_secs(2)).await);

        // A surviving clone keeps the connection open.
        let clone = link.clone();
        drop(link);
        let _status = clone.subscribe("/status", Arc::new(|_: &Payload| {}));
        assert_eq!(recv(&mut ws).await.msg_type, MessageType::Subscribe);

        drop(clone);
        assert_eq!(recv(&mut ws).await.msg_type, MessageType::NodeShutdown);
    }

    #[tokio::test]
    async fn publishes_beyond_the_queue_limit_are_dropped() {
        let (listener, config) = fake_broker().await;
        let link = TransportLink::new("/talker", "proc-a", config.with_max_queued_publishes(2));
        for battery in 1..=3 {
            link.publish("/telemetry", payload(json!({"battery": battery})));
        }
        assert_eq!(link.queued_publishes(), 2);

        link.start();
        let mut ws = handshake(&listener).await;
        for battery in 1..=2 {
            let publish = recv(&mut ws).await;
            assert_eq!(publish.msg_type, MessageType::Publish);
            assert_eq!(publish.data, Some(payload(json!({"battery": battery}))));
        }
        link.shutdown().await;
        assert_eq!(recv(&mut ws).await.msg_type, MessageType::NodeShutdown);
        assert_eq!(link.queued_publishes(), 0);
    }
}
