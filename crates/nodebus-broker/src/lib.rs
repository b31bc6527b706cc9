//! `nodebus-broker` – the hub every node connects to.
//!
//! - [`broker`] – node presence, topic subscriptions, service ownership and
//!   message routing.
//! - [`server`] – the WebSocket `/nodes` endpoint hosting a [`Broker`].

pub mod broker;
pub mod server;

pub use broker::{Broker, BrokerConfig, BrokerSnapshot, ConnectionHandle, Outgoing};
pub use server::BrokerServer;
