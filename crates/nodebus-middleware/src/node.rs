//! Node facade – one namespaced endpoint combining local and remote
//! delivery.
//!
//! A [`Node`] owns a [`TransportLink`] and shares a [`Registries`] value
//! with the other nodes of its process.  Publishing fans out to same-process
//! subscribers first and is then handed to the link; service calls prefer a
//! same-process provider and only go over the link when none exists.
//!
//! Relative names are qualified under the node: node `arm` in namespace
//! `robot` turns `joint_states` into `/robot/arm/joint_states`.  Names
//! starting with `/` are used as given.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use nodebus_types::{BusError, Payload, ServiceType, from_payload, to_payload};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::handle::Registration;
use crate::pubsub::{LocalPublisher, LocalRegistry};
use crate::service::{
    AsyncFn, BlockingFn, DEFAULT_SERVICE_TIMEOUT, DEFAULT_WORKER_POOL_SIZE, HandlerResult,
    PayloadHandler, ServiceClient, ServiceHandler, ServiceRegistry, ServiceServer, WorkerPool,
};
use crate::transport::{LinkConfig, TransportLink};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub namespace: String,
    pub link: LinkConfig,
    /// Timeout used by clients created through the node and by services
    /// answering remote callers.
    pub service_timeout: Duration,
    /// Concurrency limit for blocking service handlers.
    pub worker_pool_size: usize,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
            link: LinkConfig::default(),
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_service_timeout(mut self, timeout: Duration) -> Self {
        self.service_timeout = timeout;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// `/namespace/name`, or `/name` without a namespace.
    pub fn full_name(&self) -> String {
        let name = self.name.trim_matches('/');
        match self.namespace.trim_matches('/') {
            "" => format!("/{name}"),
            namespace => format!("/{namespace}/{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// In-process registries shared by every node of one delivery domain.
///
/// Nodes sharing a `Registries` reach each other's subscribers and services
/// without the broker.  The registries' id is sent as the `uuid` of every
/// outbound message so remote copies of a same-domain publish are skipped.
#[derive(Clone)]
pub struct Registries {
    id: String,
    local: Arc<LocalRegistry>,
    services: Arc<ServiceRegistry>,
}

impl Registries {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            local: Arc::new(LocalRegistry::new()),
            services: Arc::new(ServiceRegistry::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local(&self) -> &Arc<LocalRegistry> {
        &self.local
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Typed publisher created by [`Node::create_publisher`].
pub struct Publisher<T> {
    local: LocalPublisher<T>,
    link: TransportLink,
}

impl<T: Serialize + Send + Sync + 'static> Publisher<T> {
    pub fn topic(&self) -> &str {
        self.local.topic()
    }

    /// Deliver `message` to same-process subscribers, then hand it to the
    /// transport link for every other node.
    ///
    /// # Errors
    ///
    /// [`BusError::TypeMismatch`] if the topic's declared type changed, or
    /// [`BusError::Conversion`] when `message` cannot be serialised.
    pub fn publish(&self, message: &T) -> Result<(), BusError> {
        self.local.publish(message)?;
        let payload = to_payload(message)?;
        self.link.publish(self.local.topic(), payload);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

struct NodeInner {
    full_name: String,
    config: NodeConfig,
    registries: Registries,
    link: TransportLink,
    pool: WorkerPool,
    owned: Mutex<HashMap<u64, Registration>>,
    next_key: AtomicU64,
    stopped: watch::Sender<bool>,
}

/// A named participant on the bus.  Cheap to clone; clones refer to the
/// same node.
///
/// Dropping the last clone releases everything the node registered and
/// disconnects it from the broker, unless a [`Publisher`] or
/// [`ServiceClient`] still holds its transport link.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig, registries: Registries) -> Self {
        let full_name = config.full_name();
        let link = TransportLink::new(full_name.clone(), registries.id().to_string(), config.link.clone());
        let pool = WorkerPool::new(config.worker_pool_size);
        let (stopped, _) = watch::channel(false);
        info!(node = %full_name, domain = %registries.id(), "created node");
        Self {
            inner: Arc::new(NodeInner {
                full_name,
                config,
                registries,
                link,
                pool,
                owned: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(0),
                stopped,
            }),
        }
    }

    /// Fully-qualified node name.
    pub fn name(&self) -> &str {
        &self.inner.full_name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn registries(&self) -> &Registries {
        &self.inner.registries
    }

    pub fn link(&self) -> &TransportLink {
        &self.inner.link
    }

    /// Resolve `name` relative to this node.
    pub fn qualified_name(&self, name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("{}/{}", self.inner.full_name, name)
        }
    }

    fn owned(&self) -> MutexGuard<'_, HashMap<u64, Registration>> {
        self.inner.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep `registration` alive until the caller releases the returned
    /// handle or the node shuts down, whichever comes first.
    fn adopt(&self, registration: Registration) -> Registration {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let name = registration.name().to_string();
        self.owned().insert(key, registration);

        let node: Weak<NodeInner> = Arc::downgrade(&self.inner);
        Registration::new(name, move || {
            let Some(node) = node.upgrade() else {
                return;
            };
            let adopted = node
                .owned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            if let Some(registration) = adopted {
                registration.release();
            }
        })
    }

    // ── Topics ───────────────────────────────────────────────────────────

    /// Declare a publisher of `T` on `topic`.
    pub fn create_publisher<T>(&self, topic: &str) -> Result<Publisher<T>, BusError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let topic = self.qualified_name(topic);
        let local = self.inner.registries.local().advertise::<T>(&topic)?;
        Ok(Publisher {
            local,
            link: self.inner.link.clone(),
        })
    }

    /// Bind `callback` to `topic` for same-process and remote publishers.
    ///
    /// Remote payloads that do not convert into `T` are logged and dropped.
    pub fn create_subscription<T, F>(&self, topic: &str, callback: F) -> Result<Registration, BusError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let topic = self.qualified_name(topic);
        let callback = Arc::new(callback);

        let local_cb = Arc::clone(&callback);
        let local = self
            .inner
            .registries
            .local()
            .subscribe::<T, _>(&topic, move |message| local_cb(message))?;

        let remote_topic = topic.clone();
        let remote = self.inner.link.subscribe(
            &topic,
            Arc::new(move |payload: &Payload| match from_payload::<T>(payload) {
                Ok(message) => callback(&message),
                Err(e) => warn!(topic = %remote_topic, error = %e, "dropping message that does not match subscription type"),
            }),
        );

        Ok(self.adopt(local.chain(remote)))
    }

    // ── Services ─────────────────────────────────────────────────────────

    /// Serve `name` with any [`ServiceHandler`].
    pub fn create_service_with<S, H>(&self, name: &str, handler: H) -> Registration
    where
        S: ServiceType,
        H: ServiceHandler<S>,
    {
        let name = self.qualified_name(name);
        let server = ServiceServer::<S>::new(&name, handler, self.inner.config.service_timeout);
        let (server, local) = self.inner.registries.services().register(server);
        let remote = self
            .inner
            .link
            .register_service(&name, server as Arc<dyn PayloadHandler>);
        self.adopt(local.chain(remote))
    }

    /// Serve `name` with an async handler running on the event loop.
    pub fn create_service<S, F, Fut>(&self, name: &str, handler: F) -> Registration
    where
        S: ServiceType,
        F: Fn(S::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<S::Response>> + Send + 'static,
    {
        self.create_service_with::<S, _>(name, AsyncFn(handler))
    }

    /// Serve `name` with a blocking handler running on the node's worker
    /// pool.
    pub fn create_blocking_service<S, F>(&self, name: &str, handler: F) -> Registration
    where
        S: ServiceType,
        F: Fn(S::Request) -> HandlerResult<S::Response> + Send + Sync + 'static,
    {
        self.create_service_with::<S, _>(name, BlockingFn::new(self.inner.pool.clone(), handler))
    }

    /// Client for service `name`, local provider first, broker otherwise.
    pub fn create_client<S: ServiceType>(&self, name: &str) -> ServiceClient<S> {
        ServiceClient::new(self.qualified_name(name), Arc::clone(self.inner.registries.services()))
            .with_remote(Arc::new(self.inner.link.clone()))
            .with_timeout(self.inner.config.service_timeout)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Begin connecting to the broker in the background.
    pub fn start(&self) {
        self.inner.link.start();
        info!(node = %self.inner.full_name, url = %self.inner.config.link.url(), "node started");
    }

    pub fn is_running(&self) -> bool {
        !*self.inner.stopped.borrow()
    }

    /// Suspend until [`Node::shutdown`] is called.
    pub async fn spin(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        info!(node = %self.inner.full_name, "spinning");
        let _ = stopped.wait_for(|s| *s).await;
        info!(node = %self.inner.full_name, "stopped spinning");
    }

    /// Release every subscription and service of this node, shut the
    /// transport link down and wake [`Node::spin`].
    pub async fn shutdown(&self) {
        if self.inner.stopped.send_replace(true) {
            return;
        }
        let owned: Vec<Registration> = self.owned().drain().map(|(_, r)| r).collect();
        for registration in owned {
            registration.release();
        }
        self.inner.link.shutdown().await;
        info!(node = %self.inner.full_name, "node shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::HandlerError;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Battery {
        battery: u8,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ResetRequest {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ResetResponse {
        ok: bool,
    }

    struct Reset;

    impl ServiceType for Reset {
        type Request = ResetRequest;
        type Response = ResetResponse;
    }

    fn node(name: &str, registries: &Registries) -> Node {
        Node::new(
            NodeConfig::new(name)
                .with_namespace("robot")
                .with_service_timeout(Duration::from_millis(200)),
            registries.clone(),
        )
    }

    #[test]
    fn names_are_qualified_under_the_node() {
        let arm = node("arm", &Registries::new());
        assert_eq!(arm.name(), "/robot/arm");
        assert_eq!(arm.qualified_name("joint_states"), "/robot/arm/joint_states");
        assert_eq!(arm.qualified_name("/telemetry"), "/telemetry");

        let bare = Node::new(NodeConfig::new("/camera/"), Registries::new());
        assert_eq!(bare.name(), "/camera");
    }

    #[tokio::test]
    async fn sibling_nodes_share_local_delivery() {
        let registries = Registries::new();
        let talker = node("talker", &registries);
        let listener = node("listener", &registries);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = listener
            .create_subscription("/telemetry", move |m: &Battery| sink.lock().unwrap().push(m.battery))
            .unwrap();

        let publisher = talker.create_publisher::<Battery>("/telemetry").unwrap();
        publisher.publish(&Battery { battery: 42 }).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn separate_registries_do_not_share_delivery() {
        let talker = node("talker", &Registries::new());
        let listener = node("listener", &Registries::new());

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _sub = listener
            .create_subscription("/telemetry", move |_: &Battery| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        talker
            .create_publisher::<Battery>("/telemetry")
            .unwrap()
            .publish(&Battery { battery: 1 })
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn client_reaches_sibling_service_without_broker() {
        let registries = Registries::new();
        let provider = node("provider", &registries);
        let caller = node("caller", &registries);

        let _svc = provider.create_service::<Reset, _, _>("/reset", |_req| async move {
            Ok::<_, HandlerError>(ResetResponse { ok: true })
        });
        let client = caller.create_client::<Reset>("/reset");

        assert_eq!(client.call(ResetRequest {}).await.unwrap(), ResetResponse { ok: true });
    }

    #[tokio::test]
    async fn blocking_service_is_served_from_worker_pool() {
        let registries = Registries::new();
        let provider = node("provider", &registries);
        let _svc = provider.create_blocking_service::<Reset, _>("reset", |_req| Ok(ResetResponse { ok: false }));

        let client = provider.create_client::<Reset>("reset");
        assert_eq!(client.name(), "/robot/provider/reset");
        assert_eq!(client.call(ResetRequest {}).await.unwrap(), ResetResponse { ok: false });
    }

    #[tokio::test]
    async fn released_service_is_gone() {
        let registries = Registries::new();
        let provider = node("provider", &registries);
        let svc = provider.create_service::<Reset, _, _>("/reset", |_req| async move {
            Ok::<_, HandlerError>(ResetResponse { ok: true })
        });
        assert!(registries.services().contains("/reset"));
        assert_eq!(provider.link().registered_services(), vec!["/reset".to_string()]);

        svc.release();
        assert!(!registries.services().contains("/reset"));
        assert!(provider.link().registered_services().is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_state_and_wakes_spin() {
        let registries = Registries::new();
        let arm = node("arm", &registries);
        let _svc = arm.create_service::<Reset, _, _>("/reset", |_req| async move {
            Ok::<_, HandlerError>(ResetResponse { ok: true })
        });
        let _sub = arm.create_subscription("/telemetry", |_: &Battery| {}).unwrap();

        let spinner = arm.clone();
        let spin = tokio::spawn(async move { spinner.spin().await });
        tokio::task::yield_now().await;

        arm.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), spin).await.unwrap().unwrap();

        assert!(!arm.is_running());
        assert!(!registries.services().contains("/reset"));
        assert_eq!(registries.local().subscriber_count("/telemetry"), 0);
        assert!(arm.link().subscribed_topics().is_empty());
    }
}
