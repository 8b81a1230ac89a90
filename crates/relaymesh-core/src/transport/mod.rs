//! Transport binding contract.
//!
//! A binding maps its native wire representation onto the three envelope kinds.
//! Each live connection is exposed as a [`Connection`]; the binding's client
//! and server are ordinary [`Module`](crate::module::Module)s so they slot into
//! any pipeline.
//!
//! Bindings without a push channel (plain request/response protocols) keep the
//! default `send_response` / `send_notification`, which report
//! [`MeshError::NotSupported`] instead of silently dropping data.

pub mod direct;

use async_trait::async_trait;
use relaymesh_types::{
    MeshError, MeshResult, NotificationMessage, RequestMessage, ResponseMessage,
};

pub use direct::{DirectClient, DirectServer};

/// One live connection between a client and a server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Unique ID of this connection.
    fn connection_id(&self) -> &str;

    /// Authenticated ID of the client that opened the connection.
    fn client_id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Send a request to the other side.
    async fn send_request(&self, request: RequestMessage) -> MeshResult<()>;

    /// Send a response to the other side.
    async fn send_response(&self, _response: ResponseMessage) -> MeshResult<()> {
        Err(MeshError::NotSupported("send_response".to_string()))
    }

    /// Send a notification to the other side.
    async fn send_notification(&self, _notification: NotificationMessage) -> MeshResult<()> {
        Err(MeshError::NotSupported("send_notification".to_string()))
    }

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// The agent a thing ID belongs to.
///
/// Things served by an agent are addressed as `"{agent_id}:{thing}"`. A thing
/// ID without a separator addresses the agent itself.
pub fn agent_of(thing_id: &str) -> &str {
    thing_id
        .split_once(':')
        .map(|(agent, _)| agent)
        .unwrap_or(thing_id)
}
