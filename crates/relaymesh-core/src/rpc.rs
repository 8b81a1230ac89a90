//! Synchronous RPC on top of the sink chain.

use crate::async_result::AsyncResult;
use crate::module::{reply_fn, Sink};
use relaymesh_types::config::normalize_timeout;
use relaymesh_types::{MeshError, MeshResult, RequestMessage, ResponseMessage};
use std::time::Duration;
use tracing::debug;

/// Send `request` into `sink` and wait for its response.
///
/// Assigns a correlation ID when the request has none. Fails when the request
/// could not be sent, when no response arrives within `timeout`, or when the
/// response carries an error. A zero timeout means the default RPC timeout.
///
/// Matching by correlation ID is left to the binding the request crosses,
/// which fires the reply callback from its
/// [`CorrelationEngine`](crate::correlation::CorrelationEngine).
pub async fn forward_request_wait(
    sink: &dyn Sink,
    mut request: RequestMessage,
    timeout: Duration,
) -> MeshResult<ResponseMessage> {
    let correlation_id = request.ensure_correlation_id().to_string();
    let result: AsyncResult<ResponseMessage> = AsyncResult::new();
    let setter = result.clone();

    sink.handle_request(
        request,
        reply_fn(move |response| {
            if !setter.set(response) {
                debug!("Extra response ignored by RPC caller");
            }
            Ok(())
        }),
    )
    .await?;

    let timeout = normalize_timeout(timeout);
    let Some(response) = result.wait(timeout).await else {
        return Err(MeshError::Timeout(correlation_id));
    };
    match response.error {
        Some(err) => Err(MeshError::Remote(err)),
        None => Ok(response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BaseModule;
    use crate::module::{Module, ReplyTo};
    use async_trait::async_trait;
    use relaymesh_types::{NotificationMessage, Operation};
    use serde_json::{json, Value};
    use std::sync::Arc;

    /// Replies later from a spawned task, or never.
    struct DelayedSink {
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Sink for DelayedSink {
        async fn handle_request(&self, request: RequestMessage, reply_to: ReplyTo) -> MeshResult<()> {
            if let Some(delay) = self.delay {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = reply_to(request.create_response(Ok(json!("done"))));
                });
            }
            Ok(())
        }

        async fn handle_notification(&self, _notification: NotificationMessage) {}

        async fn handle_response(&self, _response: ResponseMessage) -> MeshResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rpc_async_reply() {
        let sink = DelayedSink {
            delay: Some(Duration::from_millis(20)),
        };
        let req = RequestMessage::new(Operation::InvokeAction, "t1", "go", Value::Null);
        let resp = forward_request_wait(&sink, req, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.output, json!("done"));
    }

    #[tokio::test]
    async fn test_rpc_timeout() {
        let sink = DelayedSink { delay: None };
        let req = RequestMessage::new(Operation::InvokeAction, "t1", "go", Value::Null);
        let err = forward_request_wait(&sink, req, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_rpc_assigns_correlation_id() {
        let sink = DelayedSink {
            delay: Some(Duration::from_millis(1)),
        };
        let req = RequestMessage::new(Operation::InvokeAction, "t1", "go", Value::Null)
            .with_correlation_id("");
        let resp = forward_request_wait(&sink, req, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!resp.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn test_rpc_failed_response_is_error() {
        let module = BaseModule::new("m1");
        let req = RequestMessage::new(Operation::ReadProperty, "m1", "missing", Value::Null);
        let err = forward_request_wait(&module, req, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            MeshError::Remote(value) => assert_eq!(value.status, 404),
            other => panic!("Expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rpc_send_failure() {
        let module = Arc::new(BaseModule::new("m1"));
        assert_eq!(module.module_id(), "m1");
        let req = RequestMessage::new(Operation::InvokeAction, "other", "go", Value::Null);
        let err = forward_request_wait(module.as_ref(), req, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NoSink { .. }));
    }
}
