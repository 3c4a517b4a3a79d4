use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrandError};

/// Unique identifier for an executor (graph node) within a workflow.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExecutorId(pub String);

impl ExecutorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a single workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an external-request port declared at graph-build time.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PortId(pub String);

impl PortId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one outstanding external request.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a message sender.
///
/// `External` is the reserved identity for traffic entering the graph from
/// outside (run input and resolved external responses).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorIdentity {
    External,
    Executor { id: ExecutorId },
}

impl ExecutorIdentity {
    pub fn executor(id: impl Into<ExecutorId>) -> Self {
        Self::Executor { id: id.into() }
    }

    pub fn executor_id(&self) -> Option<&ExecutorId> {
        match self {
            Self::External => None,
            Self::Executor { id } => Some(id),
        }
    }
}

impl From<ExecutorId> for ExecutorIdentity {
    fn from(id: ExecutorId) -> Self {
        Self::Executor { id }
    }
}

impl std::fmt::Display for ExecutorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External => write!(f, "<external>"),
            Self::Executor { id } => write!(f, "{}", id),
        }
    }
}

/// Reserved type tag carried by fan-in aggregate deliveries.
pub const FAN_IN_TAG: &str = "strand.fan_in";

/// A message payload together with its declared type tag.
///
/// The payload stays a raw `serde_json::Value` until a consumer materializes
/// it into a concrete type, so values can be queued, checkpointed, and
/// restored without the runtime knowing their Rust types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableValue {
    type_tag: String,
    payload: serde_json::Value,
}

impl PortableValue {
    pub fn new(type_tag: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload,
        }
    }

    /// Wrap a concrete value under the given type tag.
    pub fn from_typed<T: Serialize>(type_tag: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self {
            type_tag: type_tag.into(),
            payload: serde_json::to_value(value)?,
        })
    }

    /// Bundle an ordered list of contributions into a fan-in aggregate.
    pub fn aggregate(values: Vec<PortableValue>) -> Result<Self> {
        Self::from_typed(FAN_IN_TAG, &values)
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn is(&self, type_tag: &str) -> bool {
        self.type_tag == type_tag
    }

    /// Deserialize the payload into a concrete type.
    pub fn materialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(StrandError::from)
    }

    /// Unpack a fan-in aggregate back into its ordered contributions.
    pub fn materialize_batch(&self) -> Result<Vec<PortableValue>> {
        if !self.is(FAN_IN_TAG) {
            return Err(StrandError::TypeMismatch {
                expected: FAN_IN_TAG.to_string(),
                actual: self.type_tag.clone(),
            });
        }
        self.materialize()
    }
}

/// A routable message: payload plus sender identity and optional explicit
/// target. Once routed, the target is always a concrete executor id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message: PortableValue,
    pub source: ExecutorIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ExecutorId>,
}

impl MessageEnvelope {
    pub fn new(message: PortableValue, source: ExecutorIdentity) -> Self {
        Self {
            message,
            source,
            target: None,
        }
    }

    pub fn external(message: PortableValue) -> Self {
        Self::new(message, ExecutorIdentity::External)
    }

    pub fn with_target(mut self, target: ExecutorId) -> Self {
        self.target = Some(target);
        self
    }
}

/// Declaration of an external-request port: its id plus the type tags of the
/// request and response payloads it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPort {
    pub id: PortId,
    pub request_tag: String,
    pub response_tag: String,
}

impl RequestPort {
    pub fn new(
        id: impl Into<String>,
        request_tag: impl Into<String>,
        response_tag: impl Into<String>,
    ) -> Self {
        Self {
            id: PortId::new(id),
            request_tag: request_tag.into(),
            response_tag: response_tag.into(),
        }
    }
}

/// A request posted through a port, awaiting an out-of-band response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub request_id: RequestId,
    pub port: RequestPort,
    pub payload: PortableValue,
}

impl ExternalRequest {
    pub fn new(port: RequestPort, payload: PortableValue) -> Self {
        Self {
            request_id: RequestId::new(),
            port,
            payload,
        }
    }
}

/// The out-of-band answer to an [`ExternalRequest`], addressed by port id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub port_id: PortId,
    pub request_id: RequestId,
    pub payload: PortableValue,
}

impl ExternalResponse {
    pub fn to(request: &ExternalRequest, payload: PortableValue) -> Self {
        Self {
            port_id: request.port.id.clone(),
            request_id: request.request_id.clone(),
            payload,
        }
    }
}

/// Addressing tuple for durable per-executor state.
///
/// A `scope` of `None` is private to the owning executor; named scopes are
/// shared and subject to the single-writer rule.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScopeKey {
    pub executor_id: ExecutorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub key: String,
}

impl ScopeKey {
    pub fn private(executor_id: impl Into<ExecutorId>, key: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            scope: None,
            key: key.into(),
        }
    }

    pub fn shared(
        executor_id: impl Into<ExecutorId>,
        scope: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            executor_id: executor_id.into(),
            scope: Some(scope.into()),
            key: key.into(),
        }
    }
}
