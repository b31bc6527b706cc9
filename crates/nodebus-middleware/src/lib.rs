//! `nodebus-middleware` – node-side messaging.
//!
//! Everything a process needs to take part in the bus: same-process
//! delivery, the connection to the broker, and the node facade that puts the
//! two together.
//!
//! # Modules
//!
//! - [`pubsub`] – typed, in-process topic fan-out ([`LocalRegistry`]).
//! - [`service`] – in-process request/response with timeouts and a bounded
//!   worker pool for blocking handlers.
//! - [`transport`] – persistent WebSocket link to the broker with reconnect,
//!   state replay and call correlation.
//! - [`node`] – the [`Node`] facade and the shared [`Registries`].
//! - [`params`] – namespaced JSON parameter store.
//! - [`handle`] – scoped [`Registration`] handles.

pub mod handle;
pub mod node;
pub mod params;
pub mod pubsub;
pub mod service;
pub mod transport;

pub use handle::Registration;
pub use node::{Node, NodeConfig, Publisher, Registries};
pub use params::ParameterStore;
pub use pubsub::{LocalPublisher, LocalRegistry};
pub use service::{
    AsyncFn, BlockingFn, HandlerError, HandlerResult, PayloadHandler, RemoteCaller, ServiceClient,
    ServiceHandler, ServiceRegistry, ServiceServer, WorkerPool,
};
pub use transport::{LinkConfig, LinkState, TransportLink};
