//! The chain contract shared by transports and application modules.
//!
//! A pipeline is a chain of [`Sink`]s: each participant either handles an
//! envelope itself or forwards it to the next sink. The contract makes no
//! assumption about which side of a network connection a participant sits on,
//! which is what lets an agent that dialled out still serve requests
//! (connection reversal).
//!
//! Routing failures (no sink, end of the line) come back as `Err` from the
//! call. Failures of the *operation* itself are delivered as a failed
//! [`ResponseMessage`] through the [`ReplyTo`] callback.

use async_trait::async_trait;
use relaymesh_types::{MeshResult, NotificationMessage, RequestMessage, ResponseMessage};
use std::sync::Arc;

/// Callback that receives the response to a request.
///
/// Invoked at most once, possibly from a different task than the one that
/// issued the request.
pub type ReplyTo = Box<dyn FnOnce(ResponseMessage) -> MeshResult<()> + Send>;

/// Box a closure as a [`ReplyTo`].
pub fn reply_fn<F>(f: F) -> ReplyTo
where
    F: FnOnce(ResponseMessage) -> MeshResult<()> + Send + 'static,
{
    Box::new(f)
}

/// A reply callback that discards the response.
pub fn ignore_reply() -> ReplyTo {
    Box::new(|_| Ok(()))
}

/// The receiving side of a pipeline hop.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Handle a request locally or forward it.
    ///
    /// Returns an error only when the request could neither be handled nor
    /// forwarded.
    async fn handle_request(&self, request: RequestMessage, reply_to: ReplyTo) -> MeshResult<()>;

    /// Pass a notification along. There is no reply path.
    async fn handle_notification(&self, notification: NotificationMessage);

    /// Handle a response that arrived out of band, i.e. not through a `ReplyTo`.
    async fn handle_response(&self, response: ResponseMessage) -> MeshResult<()>;
}

/// A pipeline participant with an identity and a downstream sink.
#[async_trait]
pub trait Module: Sink {
    /// The ID requests use to address this module as their thing.
    fn module_id(&self) -> &str;

    /// Set the downstream sink that receives forwarded envelopes.
    fn set_sink(&self, sink: Arc<dyn Sink>);

    /// Start the module. The default does nothing.
    async fn start(&self) -> MeshResult<()> {
        Ok(())
    }

    /// Stop the module. The default does nothing.
    async fn stop(&self) {}
}
