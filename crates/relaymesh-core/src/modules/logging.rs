//! Logging module: traces every envelope that passes through, then forwards it.

use crate::base::BaseModule;
use crate::module::{reply_fn, Module, ReplyTo, Sink};
use async_trait::async_trait;
use relaymesh_types::{MeshResult, NotificationMessage, RequestMessage, ResponseMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pass-through module that logs requests, replies, notifications and responses.
pub struct LoggingModule {
    base: BaseModule,
    requests: AtomicU64,
    notifications: AtomicU64,
    responses: AtomicU64,
}

impl LoggingModule {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            base: BaseModule::new(module_id),
            requests: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
            responses: AtomicU64::new(0),
        }
    }

    /// Number of requests seen so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn notification_count(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    pub fn response_count(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for LoggingModule {
    async fn handle_request(&self, request: RequestMessage, reply_to: ReplyTo) -> MeshResult<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        info!(
            operation = %request.operation,
            thing_id = %request.thing_id,
            name = %request.name,
            correlation_id = %request.correlation_id,
            sender_id = %request.sender_id,
            "Request"
        );

        let reply_to = reply_fn(move |response: ResponseMessage| {
            match &response.error {
                Some(err) => warn!(
                    correlation_id = %response.correlation_id,
                    status = err.status,
                    error = %err,
                    "Reply failed"
                ),
                None => debug!(
                    correlation_id = %response.correlation_id,
                    state = ?response.state,
                    "Reply"
                ),
            }
            reply_to(response)
        });

        let result = self.base.handle_request(request, reply_to).await;
        if let Err(e) = &result {
            warn!(error = %e, "Request could not be delivered");
        }
        result
    }

    async fn handle_notification(&self, notification: NotificationMessage) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        debug!(
            affordance = ?notification.affordance_type,
            thing_id = %notification.thing_id,
            name = %notification.name,
            sender_id = %notification.sender_id,
            "Notification"
        );
        self.base.handle_notification(notification).await;
    }

    async fn handle_response(&self, response: ResponseMessage) -> MeshResult<()> {
        self.responses.fetch_add(1, Ordering::Relaxed);
        debug!(
            thing_id = %response.thing_id,
            correlation_id = %response.correlation_id,
            state = ?response.state,
            "Response"
        );
        self.base.handle_response(response).await
    }
}

#[async_trait]
impl Module for LoggingModule {
    fn module_id(&self) -> &str {
        self.base.module_id()
    }

    fn set_sink(&self, sink: Arc<dyn Sink>) {
        self.base.set_sink(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::forward_request_wait;
    use relaymesh_types::{MeshError, Operation};
    use serde_json::{json, Value};
    use std::time::Duration;

    #[tokio::test]
    async fn test_logging_passes_through() {
        let logger = LoggingModule::new("log");
        let app = Arc::new(BaseModule::new("app"));
        app.update_property("mode", json!("eco"));
        logger.set_sink(app.clone());

        let req = RequestMessage::new(Operation::ReadProperty, "app", "mode", Value::Null);
        let resp = forward_request_wait(&logger, req, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.output, json!("eco"));

        logger
            .handle_notification(NotificationMessage::event("app", "started", Value::Null))
            .await;
        assert_eq!(logger.request_count(), 1);
        assert_eq!(logger.notification_count(), 1);
    }

    #[tokio::test]
    async fn test_logging_without_sink_reports_error() {
        let logger = LoggingModule::new("log");
        let req = RequestMessage::new(Operation::InvokeAction, "app", "go", Value::Null);
        let err = forward_request_wait(&logger, req, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NoSink { .. }));

        let resp = RequestMessage::new(Operation::InvokeAction, "log", "go", Value::Null)
            .create_response(Ok(Value::Null));
        logger.handle_response(resp).await.unwrap();
        assert_eq!(logger.response_count(), 1);
    }
}
