//! Request, Response and Notification envelopes.
//!
//! Every transport binding maps its native representation into these three
//! kinds and back. The correlation ID is the only join key between a request
//! and its response; there is no sequence number and no ordering guarantee.
//!
//! Payloads (`input`, `output`, `data`) are dynamic JSON values. The consumer
//! that knows the expected shape decodes them on demand with the `decode_*`
//! helpers.

use crate::error::{ErrorValue, MeshError, MeshResult};
use crate::ids::new_correlation_id;
use crate::operation::Operation;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serde helper for timestamps as ISO-8601 UTC with millisecond precision.
mod created_ms {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Accept any RFC 3339 timestamp.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

fn decode_payload<T: DeserializeOwned>(value: &Value) -> MeshResult<T> {
    serde_json::from_value(value.clone()).map_err(MeshError::from)
}

/// The three envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
}

/// Progress state of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Which kind of affordance a notification reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffordanceType {
    Event,
    Property,
    /// Action progress update.
    Action,
}

/// A request for an operation on a thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub operation: Operation,
    pub thing_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Value,
    /// Empty only for requests that will never be waited on.
    #[serde(default)]
    pub correlation_id: String,
    /// Authenticated originator, stamped by the first trusted hop.
    #[serde(default)]
    pub sender_id: String,
    #[serde(with = "created_ms")]
    pub created: DateTime<Utc>,
}

impl RequestMessage {
    /// Create a request with a fresh correlation ID.
    pub fn new(
        operation: Operation,
        thing_id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            operation,
            thing_id: thing_id.into(),
            name: name.into(),
            input,
            correlation_id: new_correlation_id(),
            sender_id: String::new(),
            created: Utc::now(),
        }
    }

    /// Replace the correlation ID. An empty ID makes this fire-and-forget.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Set the sender ID.
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    /// Assign a fresh correlation ID if none is set and return it.
    pub fn ensure_correlation_id(&mut self) -> &str {
        if self.correlation_id.is_empty() {
            self.correlation_id = new_correlation_id();
        }
        &self.correlation_id
    }

    /// Decode the input payload into the expected type.
    pub fn decode_input<T: DeserializeOwned>(&self) -> MeshResult<T> {
        decode_payload(&self.input)
    }

    /// Build the single final response for this request.
    ///
    /// `Ok` produces a completed response carrying the output, `Err` a failed
    /// response carrying the error.
    pub fn create_response(&self, result: Result<Value, ErrorValue>) -> ResponseMessage {
        let (output, state, error) = match result {
            Ok(output) => (output, ResponseState::Completed, None),
            Err(err) => (Value::Null, ResponseState::Failed, Some(err)),
        };
        ResponseMessage {
            operation: self.operation.clone(),
            thing_id: self.thing_id.clone(),
            name: self.name.clone(),
            output,
            state,
            error,
            correlation_id: self.correlation_id.clone(),
            sender_id: self.sender_id.clone(),
            created: Utc::now(),
        }
    }

    /// Build a failed response, e.g. when the next hop is unreachable.
    pub fn create_error_response(&self, err: impl Into<ErrorValue>) -> ResponseMessage {
        self.create_response(Err(err.into()))
    }

    /// Build an action-progress notification for this request.
    ///
    /// Intermediate progress travels as notifications because the correlation
    /// engine accepts only one response per correlation ID.
    pub fn create_progress(&self, data: Value) -> NotificationMessage {
        NotificationMessage {
            affordance_type: AffordanceType::Action,
            operation: self.operation.clone(),
            thing_id: self.thing_id.clone(),
            name: self.name.clone(),
            data,
            correlation_id: self.correlation_id.clone(),
            sender_id: self.sender_id.clone(),
            created: Utc::now(),
        }
    }
}

/// The outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub operation: Operation,
    pub thing_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub state: ResponseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorValue>,
    pub correlation_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(with = "created_ms")]
    pub created: DateTime<Utc>,
}

impl ResponseMessage {
    /// True once the request completed or failed.
    pub fn is_final(&self) -> bool {
        matches!(self.state, ResponseState::Completed | ResponseState::Failed)
    }

    /// Decode the output payload into the expected type.
    pub fn decode_output<T: DeserializeOwned>(&self) -> MeshResult<T> {
        decode_payload(&self.output)
    }

    /// Convert into the output value, or the carried error.
    pub fn into_result(self) -> Result<Value, ErrorValue> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.output),
        }
    }
}

/// A one-way event, property update or action progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub affordance_type: AffordanceType,
    pub operation: Operation,
    pub thing_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(with = "created_ms")]
    pub created: DateTime<Utc>,
}

impl NotificationMessage {
    fn new(
        affordance_type: AffordanceType,
        operation: Operation,
        thing_id: impl Into<String>,
        name: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            affordance_type,
            operation,
            thing_id: thing_id.into(),
            name: name.into(),
            data,
            correlation_id: String::new(),
            sender_id: String::new(),
            created: Utc::now(),
        }
    }

    /// An event notification.
    pub fn event(thing_id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self::new(
            AffordanceType::Event,
            Operation::SubscribeEvent,
            thing_id,
            name,
            data,
        )
    }

    /// A property value change notification.
    pub fn property(thing_id: impl Into<String>, name: impl Into<String>, value: Value) -> Self {
        Self::new(
            AffordanceType::Property,
            Operation::ObserveProperty,
            thing_id,
            name,
            value,
        )
    }

    /// Decode the data payload into the expected type.
    pub fn decode_data<T: DeserializeOwned>(&self) -> MeshResult<T> {
        decode_payload(&self.data)
    }
}

/// Any of the three envelope kinds, tagged by `messageType` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum Envelope {
    Request(RequestMessage),
    Response(ResponseMessage),
    Notification(NotificationMessage),
}

impl Envelope {
    /// Which kind this envelope is.
    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Request(_) => MessageType::Request,
            Envelope::Response(_) => MessageType::Response,
            Envelope::Notification(_) => MessageType::Notification,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Envelope::Request(m) => &m.correlation_id,
            Envelope::Response(m) => &m.correlation_id,
            Envelope::Notification(m) => &m.correlation_id,
        }
    }

    pub fn thing_id(&self) -> &str {
        match self {
            Envelope::Request(m) => &m.thing_id,
            Envelope::Response(m) => &m.thing_id,
            Envelope::Notification(m) => &m.thing_id,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Envelope::Request(m) => &m.sender_id,
            Envelope::Response(m) => &m.sender_id,
            Envelope::Notification(m) => &m.sender_id,
        }
    }
}

impl From<RequestMessage> for Envelope {
    fn from(m: RequestMessage) -> Self {
        Envelope::Request(m)
    }
}

impl From<ResponseMessage> for Envelope {
    fn from(m: ResponseMessage) -> Self {
        Envelope::Response(m)
    }
}

impl From<NotificationMessage> for Envelope {
    fn from(m: NotificationMessage) -> Self {
        Envelope::Notification(m)
    }
}

/// Encode an envelope as JSON bytes.
pub fn encode_envelope(envelope: &Envelope) -> MeshResult<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse JSON bytes into an envelope.
pub fn decode_envelope(body: &[u8]) -> MeshResult<Envelope> {
    Ok(serde_json::from_slice(body)?)
}
