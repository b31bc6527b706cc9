//! In-process request/response services.
//!
//! * [`ServiceHandler`] – the single handler interface.  Every handler
//!   returns a future; blocking closures are adapted onto a bounded
//!   [`WorkerPool`] at registration time through [`BlockingFn`], async
//!   closures run in place through [`AsyncFn`].
//! * [`ServiceServer`] – binds one name to one handler, enforces the call
//!   timeout and validates payload shapes on the remote path.
//! * [`ServiceRegistry`] – name → server map owned by (and shared between)
//!   the nodes of one process.
//! * [`ServiceClient`] – calls a same-process provider when one exists and
//!   falls back to a [`RemoteCaller`] (the transport link) otherwise.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use nodebus_types::{BusError, Payload, ServiceType, from_payload, to_payload};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::handle::Registration;
use crate::pubsub::panic_message;

/// Default timeout applied to service calls.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of blocking handlers allowed to run concurrently.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;

/// Error type returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by application handlers.
pub type HandlerResult<T> = Result<T, HandlerError>;

// ---------------------------------------------------------------------------
// Handler interface
// ---------------------------------------------------------------------------

/// Handler for the typed requests of service `S`.
#[async_trait]
pub trait ServiceHandler<S: ServiceType>: Send + Sync + 'static {
    async fn handle(&self, request: S::Request) -> HandlerResult<S::Response>;
}

/// Adapts an async closure into a [`ServiceHandler`].  Runs in place on the
/// event loop.
pub struct AsyncFn<F>(pub F);

#[async_trait]
impl<S, F, Fut> ServiceHandler<S> for AsyncFn<F>
where
    S: ServiceType,
    F: Fn(S::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<S::Response>> + Send + 'static,
{
    async fn handle(&self, request: S::Request) -> HandlerResult<S::Response> {
        (self.0)(request).await
    }
}

/// Adapts a blocking closure into a [`ServiceHandler`] that runs on a
/// [`WorkerPool`] so it cannot stall the event loop.
pub struct BlockingFn<F> {
    f: Arc<F>,
    pool: WorkerPool,
}

impl<F> BlockingFn<F> {
    pub fn new(pool: WorkerPool, f: F) -> Self {
        Self { f: Arc::new(f), pool }
    }
}

#[async_trait]
impl<S, F> ServiceHandler<S> for BlockingFn<F>
where
    S: ServiceType,
    F: Fn(S::Request) -> HandlerResult<S::Response> + Send + Sync + 'static,
{
    async fn handle(&self, request: S::Request) -> HandlerResult<S::Response> {
        let f = Arc::clone(&self.f);
        self.pool.run(move || f(request)).await?
    }
}

/// Bounded pool for blocking handler work.
///
/// Work runs on Tokio's blocking threads; at most `size` jobs run at once and
/// the rest wait for a permit without blocking the event loop.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a blocking thread and marshal its result back.
    pub async fn run<R, J>(&self, job: J) -> HandlerResult<R>
    where
        R: Send + 'static,
        J: FnOnce() -> R + Send + 'static,
    {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await;
        match joined {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => {
                Err(format!("handler panicked: {}", panic_message(&e.into_panic())).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_POOL_SIZE)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Type-erased handler operating on raw payloads.  This is what the
/// transport link invokes for inbound remote requests.
#[async_trait]
pub trait PayloadHandler: Send + Sync + 'static {
    async fn handle_payload(&self, request: Payload) -> Result<Payload, BusError>;
}

/// One named service bound to one handler.
pub struct ServiceServer<S: ServiceType> {
    name: String,
    handler: Arc<dyn ServiceHandler<S>>,
    timeout: Duration,
}

impl<S: ServiceType> ServiceServer<S> {
    /// `timeout` bounds calls arriving through the transport link; local
    /// callers pass their own.
    pub fn new(name: impl Into<String>, handler: impl ServiceHandler<S>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the handler, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// * [`BusError::ServiceTimeout`] – the handler did not finish in time.
    /// * [`BusError::ServiceHandler`] – the handler returned an error or
    ///   panicked.
    pub async fn call(&self, request: S::Request, timeout: Duration) -> Result<S::Response, BusError> {
        let invocation = AssertUnwindSafe(self.handler.handle(request)).catch_unwind();
        match tokio::time::timeout(timeout, invocation).await {
            Err(_) => {
                warn!(service = %self.name, ?timeout, "service handler timed out");
                Err(BusError::ServiceTimeout {
                    service: self.name.clone(),
                    timeout,
                })
            }
            Ok(Err(panic)) => {
                let message = format!("handler panicked: {}", panic_message(&panic));
                error!(service = %self.name, error = %message, "service handler failed");
                Err(BusError::ServiceHandler {
                    service: self.name.clone(),
                    message,
                })
            }
            Ok(Ok(Err(e))) => {
                error!(service = %self.name, error = %e, "service handler failed");
                Err(BusError::ServiceHandler {
                    service: self.name.clone(),
                    message: e.to_string(),
                })
            }
            Ok(Ok(Ok(response))) => Ok(response),
        }
    }

    /// Validate a raw request, invoke the handler and render the response as
    /// a payload.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidRequest`] / [`BusError::InvalidResponse`] when a
    /// shape does not match `S`, plus everything [`ServiceServer::call`]
    /// returns.
    pub async fn call_payload(&self, request: &Payload, timeout: Duration) -> Result<Payload, BusError> {
        let typed: S::Request = from_payload(request).map_err(|e| BusError::InvalidRequest {
            service: self.name.clone(),
            reason: e.to_string(),
        })?;
        let response = self.call(typed, timeout).await?;
        to_payload(&response).map_err(|e| BusError::InvalidResponse {
            service: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl<S: ServiceType> PayloadHandler for ServiceServer<S> {
    async fn handle_payload(&self, request: Payload) -> Result<Payload, BusError> {
        self.call_payload(&request, self.timeout).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct ServiceEntry {
    id: u64,
    type_name: &'static str,
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn PayloadHandler>,
}

/// In-process service directory.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, ServiceEntry>>,
    next_id: AtomicU64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServiceEntry>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `server` under its name, replacing any previous provider.
    ///
    /// Releasing the returned handle removes the server again, unless it has
    /// since been replaced by another registration.
    pub fn register<S: ServiceType>(
        self: &Arc<Self>,
        server: ServiceServer<S>,
    ) -> (Arc<ServiceServer<S>>, Registration) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = server.name().to_string();
        let server = Arc::new(server);
        let entry = ServiceEntry {
            id,
            type_name: type_name::<S>(),
            typed: Arc::clone(&server) as Arc<dyn Any + Send + Sync>,
            erased: Arc::clone(&server) as Arc<dyn PayloadHandler>,
        };
        if self.lock().insert(name.clone(), entry).is_some() {
            warn!(service = %name, "replacing existing local service provider");
        }
        debug!(service = %name, "registered local service");

        let registry = Arc::downgrade(self);
        let release_name = name.clone();
        let registration = Registration::new(name, move || {
            if let Some(registry) = registry.upgrade() {
                registry.unregister(&release_name, id);
            }
        });
        (server, registration)
    }

    fn unregister(&self, name: &str, id: u64) {
        let mut services = self.lock();
        if services.get(name).is_some_and(|e| e.id == id) {
            services.remove(name);
            debug!(service = %name, "unregistered local service");
        }
    }

    /// Find the typed server registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TypeMismatch`] when a provider exists but serves a
    /// different [`ServiceType`].
    pub fn lookup<S: ServiceType>(&self, name: &str) -> Result<Option<Arc<ServiceServer<S>>>, BusError> {
        let services = self.lock();
        let Some(entry) = services.get(name) else {
            return Ok(None);
        };
        Arc::clone(&entry.typed)
            .downcast::<ServiceServer<S>>()
            .map(Some)
            .map_err(|_| BusError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<S>().to_string(),
                found: entry.type_name.to_string(),
            })
    }

    /// Raw-payload view of the server registered under `name`.
    pub fn payload_handler(&self, name: &str) -> Option<Arc<dyn PayloadHandler>> {
        self.lock().get(name).map(|e| Arc::clone(&e.erased))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Names of every registered service, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Call a same-process service.
    ///
    /// # Errors
    ///
    /// [`BusError::ServiceNotFound`] when nothing is registered under
    /// `name`, plus everything [`ServiceServer::call`] returns.
    pub async fn call<S: ServiceType>(
        &self,
        name: &str,
        request: S::Request,
        timeout: Duration,
    ) -> Result<S::Response, BusError> {
        match self.lookup::<S>(name)? {
            Some(server) => server.call(request, timeout).await,
            None => Err(BusError::ServiceNotFound(name.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Out-of-process service invocation, implemented by the transport link.
#[async_trait]
pub trait RemoteCaller: Send + Sync + 'static {
    async fn call_remote(&self, service: &str, request: Payload, timeout: Duration) -> Result<Payload, BusError>;
}

/// Typed client for service `S`.
pub struct ServiceClient<S: ServiceType> {
    name: String,
    local: Arc<ServiceRegistry>,
    remote: Option<Arc<dyn RemoteCaller>>,
    timeout: Duration,
    _marker: PhantomData<fn() -> S>,
}

impl<S: ServiceType> ServiceClient<S> {
    /// A client that only reaches same-process providers.
    pub fn new(name: impl Into<String>, local: Arc<ServiceRegistry>) -> Self {
        Self {
            name: name.into(),
            local,
            remote: None,
            timeout: DEFAULT_SERVICE_TIMEOUT,
            _marker: PhantomData,
        }
    }

    /// Fall back to `remote` when no local provider exists (builder-style).
    pub fn with_remote(mut self, remote: Arc<dyn RemoteCaller>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Override the default call timeout (builder-style).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call the service with the client's default timeout.
    pub async fn call(&self, request: S::Request) -> Result<S::Response, BusError> {
        self.call_with_timeout(request, self.timeout).await
    }

    /// Call the service, trying a same-process provider first.
    ///
    /// # Errors
    ///
    /// * [`BusError::ServiceNotFound`] – no provider, locally or remotely.
    /// * [`BusError::ServiceTimeout`] – no response within `timeout`.
    /// * [`BusError::ServiceHandler`] – the provider's handler failed.
    /// * [`BusError::InvalidResponse`] – the remote response does not match
    ///   `S::Response`.
    pub async fn call_with_timeout(&self, request: S::Request, timeout: Duration) -> Result<S::Response, BusError> {
        if let Some(server) = self.local.lookup::<S>(&self.name)? {
            debug!(service = %self.name, "calling local service");
            return server.call(request, timeout).await;
        }

        let Some(remote) = &self.remote else {
            return Err(BusError::ServiceNotFound(self.name.clone()));
        };

        debug!(service = %self.name, "no local provider, calling remote service");
        let payload = to_payload(&request).map_err(|e| BusError::InvalidRequest {
            service: self.name.clone(),
            reason: e.to_string(),
        })?;
        let response = remote.call_remote(&self.name, payload, timeout).await?;
        if let Some(err) = BusError::from_error_payload(&self.name, &response) {
            return Err(err);
        }
        from_payload(&response).map_err(|e| BusError::InvalidResponse {
            service: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodebus_types::RawService;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AddRequest {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AddResponse {
        sum: i64,
    }

    struct Add;

    impl ServiceType for Add {
        type Request = AddRequest;
        type Response = AddResponse;
    }

    fn add_server(name: &str) -> ServiceServer<Add> {
        ServiceServer::new(
            name,
            AsyncFn(|req: AddRequest| async move { Ok::<_, HandlerError>(AddResponse { sum: req.a + req.b }) }),
            DEFAULT_SERVICE_TIMEOUT,
        )
    }

    #[tokio::test]
    async fn async_handler_runs() {
        let server = add_server("/add");
        let resp = server.call(AddRequest { a: 2, b: 3 }, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp, AddResponse { sum: 5 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_handler_runs_on_worker_pool() {
        let pool = WorkerPool::new(2);
        let server: ServiceServer<Add> = ServiceServer::new(
            "/add",
            BlockingFn::new(pool, |req: AddRequest| -> HandlerResult<AddResponse> {
                std::thread::sleep(Duration::from_millis(20));
                Ok(AddResponse { sum: req.a * req.b })
            }),
            DEFAULT_SERVICE_TIMEOUT,
        );
        let resp = server.call(AddRequest { a: 4, b: 5 }, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.sum, 20);
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let server: ServiceServer<Add> = ServiceServer::new(
            "/slow",
            AsyncFn(|_req: AddRequest| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, HandlerError>(AddResponse { sum: 0 })
            }),
            DEFAULT_SERVICE_TIMEOUT,
        );
        let started = Instant::now();
        let err = server
            .call(AddRequest { a: 1, b: 1 }, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::ServiceTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn handler_error_is_typed() {
        let server: ServiceServer<Add> = ServiceServer::new(
            "/fail",
            AsyncFn(|_req: AddRequest| async move { Err::<AddResponse, HandlerError>("arm is locked".into()) }),
            DEFAULT_SERVICE_TIMEOUT,
        );
        let err = server.call(AddRequest { a: 1, b: 1 }, Duration::from_secs(1)).await.unwrap_err();
        match err {
            BusError::ServiceHandler { service, message } => {
                assert_eq!(service, "/fail");
                assert!(message.contains("arm is locked"));
            }
            other => panic!("expected handler error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_blocking_handler_is_a_handler_error() {
        let server: ServiceServer<Add> = ServiceServer::new(
            "/panic",
            BlockingFn::new(WorkerPool::new(1), |_req: AddRequest| -> HandlerResult<AddResponse> {
                panic!("gripper fault")
            }),
            DEFAULT_SERVICE_TIMEOUT,
        );
        let err = server.call(AddRequest { a: 1, b: 1 }, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BusError::ServiceHandler { ref message, .. } if message.contains("gripper fault")));
    }

    #[tokio::test]
    async fn payload_path_validates_request_shape() {
        let server = add_server("/add");
        let good = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let resp = server.call_payload(&good, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.get("sum"), Some(&json!(3)));

        let bad = json!({"a": "one"}).as_object().cloned().unwrap();
        let err = server.call_payload(&bad, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn registry_lookup_and_release() {
        let registry = Arc::new(ServiceRegistry::new());
        let (_server, reg) = registry.register(add_server("/add"));
        assert!(registry.contains("/add"));
        assert_eq!(registry.service_names(), vec!["/add".to_string()]);

        let resp = registry
            .call::<Add>("/add", AddRequest { a: 10, b: 1 }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.sum, 11);

        reg.release();
        assert!(!registry.contains("/add"));
        let err = registry
            .call::<Add>("/add", AddRequest { a: 1, b: 1 }, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::ServiceNotFound("/add".to_string()));
    }

    #[tokio::test]
    async fn stale_registration_does_not_remove_replacement() {
        let registry = Arc::new(ServiceRegistry::new());
        let (_first, first_reg) = registry.register(add_server("/add"));
        let (_second, _second_reg) = registry.register(add_server("/add"));
        first_reg.release();
        assert!(registry.contains("/add"));
    }

    #[test]
    fn lookup_with_wrong_schema_is_a_type_mismatch() {
        let registry = Arc::new(ServiceRegistry::new());
        let (_server, _reg) = registry.register(add_server("/add"));
        let err = registry.lookup::<RawService>("/add").err().unwrap();
        assert!(matches!(err, BusError::TypeMismatch { .. }));
    }

    struct EchoRemote;

    #[async_trait]
    impl RemoteCaller for EchoRemote {
        async fn call_remote(&self, service: &str, request: Payload, _timeout: Duration) -> Result<Payload, BusError> {
            match service {
                "/missing" => Ok(BusError::ServiceNotFound(service.to_string()).to_error_payload()),
                "/garbled" => Ok(json!({"sum": "NaN"}).as_object().cloned().unwrap()),
                _ => {
                    let a = request["a"].as_i64().unwrap_or(0);
                    let b = request["b"].as_i64().unwrap_or(0);
                    Ok(json!({"sum": a + b}).as_object().cloned().unwrap())
                }
            }
        }
    }

    #[tokio::test]
    async fn client_prefers_local_provider() {
        let registry = Arc::new(ServiceRegistry::new());
        let (_server, _reg) = registry.register(ServiceServer::<Add>::new(
            "/add",
            AsyncFn(|_req: AddRequest| async move { Ok::<_, HandlerError>(AddResponse { sum: -1 }) }),
            DEFAULT_SERVICE_TIMEOUT,
        ));
        let client = ServiceClient::<Add>::new("/add", Arc::clone(&registry)).with_remote(Arc::new(EchoRemote));
        assert_eq!(client.call(AddRequest { a: 1, b: 2 }).await.unwrap().sum, -1);
    }

    #[tokio::test]
    async fn client_falls_back_to_remote() {
        let registry = Arc::new(ServiceRegistry::new());
        let client = ServiceClient::<Add>::new("/add", registry).with_remote(Arc::new(EchoRemote));
        assert_eq!(client.call(AddRequest { a: 1, b: 2 }).await.unwrap().sum, 3);
    }

    #[tokio::test]
    async fn client_surfaces_remote_errors_and_bad_shapes() {
        let registry = Arc::new(ServiceRegistry::new());
        let missing = ServiceClient::<Add>::new("/missing", Arc::clone(&registry)).with_remote(Arc::new(EchoRemote));
        assert_eq!(
            missing.call(AddRequest { a: 1, b: 2 }).await.unwrap_err(),
            BusError::ServiceNotFound("/missing".to_string())
        );

        let garbled = ServiceClient::<Add>::new("/garbled", registry).with_remote(Arc::new(EchoRemote));
        assert!(matches!(
            garbled.call(AddRequest { a: 1, b: 2 }).await.unwrap_err(),
            BusError::InvalidResponse { .. }
        ));
    }

    #[tokio::test]
    async fn client_without_remote_reports_not_found() {
        let client = ServiceClient::<Add>::new("/add", Arc::new(ServiceRegistry::new()));
        assert_eq!(
            client.call(AddRequest { a: 1, b: 2 }).await.unwrap_err(),
            BusError::ServiceNotFound("/add".to_string())
        );
    }
}
