//! `nodebus-types` – shared data contracts for the nodebus messaging core.
//!
//! Everything that crosses a process boundary lives here:
//!
//! - [`TransportMessage`] – the wire envelope exchanged between nodes and the
//!   broker, encoded as a MessagePack map.
//! - [`Payload`] plus [`to_payload`] / [`from_payload`] – the single
//!   conversion boundary between typed Rust values and the generic key/value
//!   data carried by the envelope.
//! - [`ServiceType`] – a typed request/response schema for one service.
//! - [`BusError`] – the error type shared by every crate in the workspace.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Path of the broker's WebSocket endpoint.
pub const NODES_PATH: &str = "/nodes";

/// `node_name` used by the broker on frames it synthesizes itself.
pub const BROKER_NODE_NAME: &str = "node_server";

/// Key under which non-map values are wrapped inside a [`Payload`].
pub const VALUE_KEY: &str = "value";

/// Generic key/value payload carried in [`TransportMessage::data`].
pub type Payload = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Message type
// ---------------------------------------------------------------------------

/// Kind of a [`TransportMessage`].
///
/// Encoded on the wire as a lowercase snake-case string.  Strings that do not
/// name a known kind decode to [`MessageType::Unknown`] so that newer peers
/// can add message kinds without breaking older brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Publish,
    Subscribe,
    Unsubscribe,
    ServiceRequest,
    ServiceResponse,
    ServiceRegister,
    ServiceUnregister,
    NodeAnnounce,
    NodeShutdown,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Publish => "publish",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::ServiceRequest => "service_request",
            MessageType::ServiceResponse => "service_response",
            MessageType::ServiceRegister => "service_register",
            MessageType::ServiceUnregister => "service_unregister",
            MessageType::NodeAnnounce => "node_announce",
            MessageType::NodeShutdown => "node_shutdown",
            MessageType::Unknown => "unknown",
        }
    }

    /// Parse a wire string, ignoring ASCII case.  Never fails; unrecognised
    /// kinds map to [`MessageType::Unknown`].
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "publish" => MessageType::Publish,
            "subscribe" => MessageType::Subscribe,
            "unsubscribe" => MessageType::Unsubscribe,
            "service_request" => MessageType::ServiceRequest,
            "service_response" => MessageType::ServiceResponse,
            "service_register" => MessageType::ServiceRegister,
            "service_unregister" => MessageType::ServiceUnregister,
            "node_announce" => MessageType::NodeAnnounce,
            "node_shutdown" => MessageType::NodeShutdown,
            _ => MessageType::Unknown,
        }
    }

    /// Subscription and registration bookkeeping, as opposed to data traffic.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageType::Subscribe
                | MessageType::Unsubscribe
                | MessageType::ServiceRegister
                | MessageType::ServiceUnregister
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageType::parse(&raw))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Wire-level envelope shared by nodes and the broker.
///
/// `message_id` is only present on service requests and responses; a
/// response always carries the id of the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub msg_type: MessageType,
    /// Fully-qualified name of the sending node.
    pub node_name: String,
    /// Instance id of the sending process.
    pub uuid: String,
    pub topic_or_service: String,
    #[serde(default)]
    pub data: Option<Payload>,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl TransportMessage {
    pub fn new(
        msg_type: MessageType,
        node_name: impl Into<String>,
        uuid: impl Into<String>,
        topic_or_service: impl Into<String>,
    ) -> Self {
        Self {
            msg_type,
            node_name: node_name.into(),
            uuid: uuid.into(),
            topic_or_service: topic_or_service.into(),
            data: None,
            message_id: None,
        }
    }

    /// Attach a payload (builder-style).
    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a correlation id (builder-style).
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Build the SERVICE_RESPONSE answering this request.
    ///
    /// The response keeps the service name and `message_id` of `self`.
    pub fn response(
        &self,
        node_name: impl Into<String>,
        uuid: impl Into<String>,
        data: Payload,
    ) -> Self {
        Self {
            msg_type: MessageType::ServiceResponse,
            node_name: node_name.into(),
            uuid: uuid.into(),
            topic_or_service: self.topic_or_service.clone(),
            data: Some(data),
            message_id: self.message_id.clone(),
        }
    }

    /// Encode as a MessagePack map with named keys.
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        rmp_serde::to_vec_named(self).map_err(|e| BusError::Codec(e.to_string()))
    }

    /// Decode a MessagePack frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        rmp_serde::from_slice(bytes).map_err(|e| BusError::Codec(e.to_string()))
    }

    /// Decode a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, BusError> {
        serde_json::from_str(text).map_err(|e| BusError::Codec(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Payload conversion boundary
// ---------------------------------------------------------------------------

/// Convert a typed value into a [`Payload`].
///
/// Values that do not serialise to a map (numbers, strings, unit, …) are
/// wrapped as `{"value": v}`.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Payload, BusError> {
    match serde_json::to_value(value).map_err(|e| BusError::Conversion(e.to_string()))? {
        Value::Object(map) => Ok(map),
        other => {
            let mut map = Payload::new();
            map.insert(VALUE_KEY.to_string(), other);
            Ok(map)
        }
    }
}

/// Convert a [`Payload`] into a typed value.
///
/// A payload of the single-key form `{"value": v}` that does not match `T`
/// directly is unwrapped and `v` is tried instead.
pub fn from_payload<T: DeserializeOwned>(payload: &Payload) -> Result<T, BusError> {
    match serde_json::from_value::<T>(Value::Object(payload.clone())) {
        Ok(value) => Ok(value),
        Err(e) => match payload.get(VALUE_KEY) {
            Some(inner) if payload.len() == 1 => serde_json::from_value(inner.clone())
                .map_err(|inner_err| BusError::Conversion(inner_err.to_string())),
            _ => Err(BusError::Conversion(e.to_string())),
        },
    }
}

// ---------------------------------------------------------------------------
// Service schema
// ---------------------------------------------------------------------------

/// Typed request/response schema of a service.
///
/// ```
/// use nodebus_types::ServiceType;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct ResetRequest { seed: Option<u64> }
///
/// #[derive(Serialize, Deserialize)]
/// struct ResetResponse { ok: bool }
///
/// struct Reset;
///
/// impl ServiceType for Reset {
///     type Request = ResetRequest;
///     type Response = ResetResponse;
/// }
/// ```
pub trait ServiceType: Send + Sync + 'static {
    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Untyped service whose request and response are raw payload maps.
pub struct RawService;

impl ServiceType for RawService {
    type Request = Payload;
    type Response = Payload;
}

// ---------------------------------------------------------------------------
// Correlation ids
// ---------------------------------------------------------------------------

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Generate a globally unique service-call correlation id of the form
/// `{node_name}_{service_name}_{monotonic_time}_{random_hex}`.
///
/// The id is opaque: nothing in the system parses it.
pub fn new_message_id(node_name: &str, service_name: &str) -> String {
    let elapsed = process_epoch().elapsed().as_secs_f64();
    format!(
        "{node_name}_{service_name}_{elapsed:.6}_{}",
        Uuid::new_v4().simple()
    )
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure category carried inside error payloads as `"error_kind"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unavailable,
    Timeout,
    Handler,
    ConnectionLost,
    TypeMismatch,
    InvalidRequest,
    InvalidResponse,
    Conversion,
    Codec,
    Transport,
    Config,
}

/// Error type shared by the broker, the transport link and the node facade.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service provider for {service} is not available: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("Service call to {service} timed out after {timeout:?}")]
    ServiceTimeout { service: String, timeout: Duration },

    #[error("Service handler for {service} failed: {message}")]
    ServiceHandler { service: String, message: String },

    #[error("Connection to broker lost: {0}")]
    ConnectionLost(String),

    #[error("Type mismatch on {name}: expected {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("Invalid request for {service}: {reason}")]
    InvalidRequest { service: String, reason: String },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },

    #[error("Payload conversion error: {0}")]
    Conversion(String),

    #[error("Wire codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::ServiceNotFound(_) => ErrorKind::NotFound,
            BusError::ServiceUnavailable { .. } => ErrorKind::Unavailable,
            BusError::ServiceTimeout { .. } => ErrorKind::Timeout,
            BusError::ServiceHandler { .. } => ErrorKind::Handler,
            BusError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            BusError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            BusError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            BusError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            BusError::Conversion(_) => ErrorKind::Conversion,
            BusError::Codec(_) => ErrorKind::Codec,
            BusError::Transport(_) => ErrorKind::Transport,
            BusError::Config(_) => ErrorKind::Config,
        }
    }

    /// Render as the structured error payload carried by a SERVICE_RESPONSE:
    /// `{"error": message, "error_kind": kind, "success": false}`.
    pub fn to_error_payload(&self) -> Payload {
        let mut map = Payload::new();
        map.insert("error".to_string(), Value::String(self.to_string()));
        map.insert(
            "error_kind".to_string(),
            serde_json::to_value(self.kind()).unwrap_or(Value::Null),
        );
        map.insert("success".to_string(), Value::Bool(false));
        if let BusError::ServiceTimeout { timeout, .. } = self {
            map.insert(
                "timeout_ms".to_string(),
                Value::from(timeout.as_millis() as u64),
            );
        }
        map
    }

    /// Reconstruct the error carried by a SERVICE_RESPONSE payload, if any.
    ///
    /// Returns `None` when the payload has no `"error"` key or explicitly
    /// reports `"success": true`.  Payloads without an `"error_kind"` are
    /// reported as handler failures.
    pub fn from_error_payload(service: &str, payload: &Payload) -> Option<BusError> {
        let error = payload.get("error")?;
        if payload.get("success") == Some(&Value::Bool(true)) {
            return None;
        }
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let kind = payload
            .get("error_kind")
            .and_then(|k| serde_json::from_value::<ErrorKind>(k.clone()).ok());

        // The message is the Display form of the remote error; keep only its
        // detail so it is not prefixed twice when rendered again here.
        let detail = |prefix: String| match message.strip_prefix(&prefix) {
            Some(rest) => rest.to_string(),
            None => message.clone(),
        };

        let err = match kind {
            Some(ErrorKind::NotFound) => BusError::ServiceNotFound(service.to_string()),
            Some(ErrorKind::Unavailable) => BusError::ServiceUnavailable {
                service: service.to_string(),
                reason: detail(format!("Service provider for {service} is not available: ")),
            },
            Some(ErrorKind::Timeout) => BusError::ServiceTimeout {
                service: service.to_string(),
                timeout: Duration::from_millis(
                    payload.get("timeout_ms").and_then(Value::as_u64).unwrap_or(0),
                ),
            },
            Some(ErrorKind::InvalidRequest) => BusError::InvalidRequest {
                service: service.to_string(),
                reason: detail(format!("Invalid request for {service}: ")),
            },
            _ => BusError::ServiceHandler {
                service: service.to_string(),
                message: detail(format!("Service handler for {service} failed: ")),
            },
        };
        Some(err)
    }
}
