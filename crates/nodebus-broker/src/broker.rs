//! Broker state and routing.
//!
//! [`Broker`] is the single authoritative record of which nodes are
//! connected, which topics each node follows and which node owns each
//! service.  It never touches a socket: every connection is represented by a
//! [`ConnectionHandle`] feeding that connection's writer task.  All map
//! mutation happens under one lock; routing takes what it needs from the
//! maps under the lock and hands frames to the writers after releasing it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nodebus_types::{BROKER_NODE_NAME, BusError, MessageType, TransportMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Default time a node has to send NODE_ANNOUNCE after connecting.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default lifetime of an unanswered request's requester entry.
pub const DEFAULT_PENDING_REQUEST_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub handshake_timeout: Duration,
    pub pending_request_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            pending_request_ttl: DEFAULT_PENDING_REQUEST_TTL,
        }
    }
}

impl BrokerConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_pending_request_ttl(mut self, ttl: Duration) -> Self {
        self.pending_request_ttl = ttl;
        self
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Frame handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Message(TransportMessage),
    /// Close the socket with the given close code and reason.
    Close { code: u16, reason: String },
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Sending half of one node connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `frame` for the writer.  Returns `false` if the connection is
    /// gone.
    pub fn send(&self, frame: Outgoing) -> bool {
        self.tx.send(frame).is_ok()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct PendingRequest {
    requester: String,
    inserted_at: Instant,
}

#[derive(Default)]
struct BrokerState {
    active_nodes: HashMap<String, ConnectionHandle>,
    subscriptions: HashMap<String, HashSet<String>>,
    services: HashMap<String, String>,
    pending_requests: HashMap<String, PendingRequest>,
}

impl BrokerState {
    /// Drop every subscription and service owned by `node`.
    fn purge(&mut self, node: &str) {
        self.subscriptions.retain(|_, nodes| {
            nodes.remove(node);
            !nodes.is_empty()
        });
        self.services.retain(|_, owner| owner != node);
    }
}

/// Point-in-time view of the broker maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerSnapshot {
    pub nodes: Vec<String>,
    pub subscriptions: BTreeMap<String, Vec<String>>,
    pub services: BTreeMap<String, String>,
    pub pending_requests: usize,
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

pub struct Broker {
    id: String,
    config: BrokerConfig,
    state: Mutex<BrokerState>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Instance id sent as the `uuid` of frames the broker originates.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Presence ─────────────────────────────────────────────────────────

    /// Record `name` as connected through `conn`.
    ///
    /// Any state left over from a previous connection of the same node is
    /// purged, since the node replays its subscriptions and services after
    /// every handshake.  A previous connection that is still open is closed.
    pub fn register_node(&self, name: &str, conn: ConnectionHandle) {
        let replaced = {
            let mut state = self.lock();
            state.purge(name);
            state.active_nodes.insert(name.to_string(), conn)
        };
        if let Some(old) = replaced {
            warn!(node = name, "node reconnected, closing previous connection");
            old.send(Outgoing::Close {
                code: 1000,
                reason: "replaced by a newer connection".to_string(),
            });
        }
        info!(node = name, "node registered");
    }

    /// Remove `name` and everything it owns.  Returns whether it was active.
    pub fn unregister_node(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            state.purge(name);
            state.active_nodes.remove(name).is_some()
        };
        if removed {
            info!(node = name, "node unregistered");
        }
        removed
    }

    /// Unregister `name` only if it is still served by connection
    /// `connection_id`.  A late disconnect of a replaced connection leaves
    /// the newer connection untouched.
    pub fn release_connection(&self, name: &str, connection_id: u64) -> bool {
        let mut state = self.lock();
        if state.active_nodes.get(name).is_some_and(|c| c.id() == connection_id) {
            state.purge(name);
            state.active_nodes.remove(name);
            drop(state);
            info!(node = name, "node disconnected");
            true
        } else {
            false
        }
    }

    /// Forcibly close `name`'s connection and purge its state.
    pub fn disconnect_node(&self, name: &str) -> bool {
        let conn = {
            let mut state = self.lock();
            state.purge(name);
            state.active_nodes.remove(name)
        };
        match conn {
            Some(conn) => {
                conn.send(Outgoing::Close {
                    code: 1001,
                    reason: "disconnected by broker".to_string(),
                });
                info!(node = name, "node disconnected by broker");
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.lock().active_nodes.contains_key(name)
    }

    // ── Topics ───────────────────────────────────────────────────────────

    pub fn subscribe(&self, node: &str, topic: &str) {
        self.lock()
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(node.to_string());
        debug!(node, topic, "subscribed");
    }

    pub fn unsubscribe(&self, node: &str, topic: &str) {
        let mut state = self.lock();
        if let Some(nodes) = state.subscriptions.get_mut(topic) {
            nodes.remove(node);
            if nodes.is_empty() {
                state.subscriptions.remove(topic);
            }
        }
        debug!(node, topic, "unsubscribed");
    }

    // ── Services ─────────────────────────────────────────────────────────

    /// Make `node` the owner of `service`.  The last registration wins.
    pub fn register_service(&self, node: &str, service: &str) {
        let previous = self
            .lock()
            .services
            .insert(service.to_string(), node.to_string());
        match previous {
            Some(old) if old != node => {
                warn!(service, old_owner = %old, new_owner = node, "service owner replaced");
            }
            _ => debug!(node, service, "service registered"),
        }
    }

    /// Drop `service` if `node` owns it.
    pub fn unregister_service(&self, node: &str, service: &str) {
        let mut state = self.lock();
        if state.services.get(service).is_some_and(|owner| owner == node) {
            state.services.remove(service);
            debug!(node, service, "service unregistered");
        }
    }

    // ── Dispatch & routing ───────────────────────────────────────────────

    /// Apply one message received on `node`'s connection.
    pub fn dispatch(&self, node: &str, message: TransportMessage) {
        match message.msg_type {
            MessageType::Subscribe => self.subscribe(node, &message.topic_or_service),
            MessageType::Unsubscribe => self.unsubscribe(node, &message.topic_or_service),
            MessageType::ServiceRegister => self.register_service(node, &message.topic_or_service),
            MessageType::ServiceUnregister => self.unregister_service(node, &message.topic_or_service),
            MessageType::NodeShutdown => {
                self.unregister_node(node);
            }
            _ => {
                self.route_from(node, message);
            }
        }
    }

    /// Like [`Broker::dispatch`], but for a frame read from connection
    /// `connection_id`.  Frames that still arrive on a connection that has
    /// been replaced are dropped, and a shutdown from it only releases that
    /// connection.  Returns `false` once `connection_id` no longer serves
    /// `node`.
    pub fn dispatch_on(&self, node: &str, connection_id: u64, message: TransportMessage) -> bool {
        if message.msg_type == MessageType::NodeShutdown {
            self.release_connection(node, connection_id);
            return true;
        }
        let current = self
            .lock()
            .active_nodes
            .get(node)
            .is_some_and(|c| c.id() == connection_id);
        if !current {
            debug!(node, msg_type = %message.msg_type, "dropping frame from replaced connection");
            return false;
        }
        self.dispatch(node, message);
        true
    }

    /// Route `message` on behalf of its `node_name`.  Returns the number of
    /// frames handed to connections.
    pub fn route(&self, message: TransportMessage) -> usize {
        let sender = message.node_name.clone();
        self.route_from(&sender, message)
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, message),
        fields(msg_type = %message.msg_type, name = %message.topic_or_service)
    )]
    fn route_from(&self, sender: &str, message: TransportMessage) -> usize {
        match message.msg_type {
            MessageType::Publish => self.route_publish(sender, message),
            MessageType::ServiceRequest => self.route_request(sender, message),
            MessageType::ServiceResponse => self.route_response(message),
            other => {
                trace!(msg_type = %other, "ignoring message");
                0
            }
        }
    }

    fn route_publish(&self, sender: &str, message: TransportMessage) -> usize {
        let targets: Vec<(String, ConnectionHandle)> = {
            let state = self.lock();
            let Some(nodes) = state.subscriptions.get(&message.topic_or_service) else {
                return 0;
            };
            nodes
                .iter()
                .filter(|n| n.as_str() != sender)
                .filter_map(|n| state.active_nodes.get(n).map(|c| (n.clone(), c.clone())))
                .collect()
        };

        let mut delivered = 0;
        for (node, conn) in targets {
            if conn.send(Outgoing::Message(message.clone())) {
                delivered += 1;
            } else {
                warn!(node = %node, topic = %message.topic_or_service, "failed to forward publish");
            }
        }
        trace!(topic = %message.topic_or_service, delivered, "routed publish");
        delivered
    }

    fn route_request(&self, sender: &str, message: TransportMessage) -> usize {
        let Some(message_id) = message.message_id.clone() else {
            warn!(node = sender, service = %message.topic_or_service, "dropping service request without message_id");
            return 0;
        };

        enum Plan {
            Forward(ConnectionHandle, Option<ConnectionHandle>),
            Reject(Option<ConnectionHandle>, BusError),
        }

        let plan = {
            let mut state = self.lock();
            let ttl = self.config.pending_request_ttl;
            state.pending_requests.retain(|_, p| p.inserted_at.elapsed() < ttl);

            let requester = state.active_nodes.get(sender).cloned();
            let service = &message.topic_or_service;
            match state.services.get(service).cloned() {
                None => Plan::Reject(requester, BusError::ServiceNotFound(service.clone())),
                Some(owner) => match state.active_nodes.get(&owner).cloned() {
                    None => Plan::Reject(
                        requester,
                        BusError::ServiceUnavailable {
                            service: service.clone(),
                            reason: format!("owner {owner} is not connected"),
                        },
                    ),
                    Some(conn) => {
                        state.pending_requests.insert(
                            message_id.clone(),
                            PendingRequest {
                                requester: sender.to_string(),
                                inserted_at: Instant::now(),
                            },
                        );
                        Plan::Forward(conn, requester)
                    }
                },
            }
        };

        match plan {
            Plan::Forward(conn, requester) => {
                debug!(service = %message.topic_or_service, message_id = %message_id, "forwarding service request");
                if conn.send(Outgoing::Message(message.clone())) {
                    return 1;
                }
                warn!(message_id = %message_id, "failed to forward service request");
                self.lock().pending_requests.remove(&message_id);
                let err = BusError::ServiceUnavailable {
                    service: message.topic_or_service.clone(),
                    reason: "owner connection is closed".to_string(),
                };
                self.reject(sender, requester, &message, err)
            }
            Plan::Reject(requester, err) => self.reject(sender, requester, &message, err),
        }
    }

    /// Answer `request` on the broker's behalf with an error payload.
    fn reject(
        &self,
        sender: &str,
        requester: Option<ConnectionHandle>,
        request: &TransportMessage,
        err: BusError,
    ) -> usize {
        debug!(service = %request.topic_or_service, error = %err, "rejecting service request");
        let response = request.response(BROKER_NODE_NAME, self.id.clone(), err.to_error_payload());
        match requester {
            Some(conn) if conn.send(Outgoing::Message(response)) => 1,
            _ => {
                warn!(node = sender, "requester gone before rejection could be sent");
                0
            }
        }
    }

    fn route_response(&self, message: TransportMessage) -> usize {
        let Some(message_id) = message.message_id.as_deref() else {
            warn!(service = %message.topic_or_service, "dropping service response without message_id");
            return 0;
        };

        let target = {
            let mut state = self.lock();
            let pending = state.pending_requests.remove(message_id);
            pending.map(|p| (state.active_nodes.get(&p.requester).cloned(), p.requester))
        };

        match target {
            Some((Some(conn), requester)) => {
                if conn.send(Outgoing::Message(message.clone())) {
                    1
                } else {
                    warn!(node = %requester, message_id, "failed to forward service response");
                    0
                }
            }
            Some((None, requester)) => {
                warn!(node = %requester, message_id, "requester disconnected, dropping service response");
                0
            }
            None => {
                warn!(message_id, "no requester known for service response");
                0
            }
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn snapshot(&self) -> BrokerSnapshot {
        let state = self.lock();
        let mut nodes: Vec<String> = state.active_nodes.keys().cloned().collect();
        nodes.sort();
        BrokerSnapshot {
            nodes,
            subscriptions: state
                .subscriptions
                .iter()
                .map(|(topic, nodes)| {
                    let mut nodes: Vec<String> = nodes.iter().cloned().collect();
                    nodes.sort();
                    (topic.clone(), nodes)
                })
                .collect(),
            services: state
                .services
                .iter()
                .map(|(s, o)| (s.clone(), o.clone()))
                .collect(),
            pending_requests: state.pending_requests.len(),
        }
    }
}
