//! BaseModule, the reusable default every concrete module starts from.
//!
//! A base module owns a [`PropertyStore`], answers the three property read
//! operations addressed to its own ID, and forwards everything else to its
//! sink. Concrete modules either embed a `BaseModule` and delegate to it, or
//! install a [`RequestHandler`] that runs before the baseline logic.

use crate::module::{Module, ReplyTo, Sink};
use crate::properties::PropertyStore;
use async_trait::async_trait;
use relaymesh_types::{
    ErrorValue, MeshError, MeshResult, NotificationMessage, Operation, RequestMessage,
    ResponseMessage,
};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Intercepts requests before the baseline handling of a [`BaseModule`].
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: RequestMessage, reply_to: ReplyTo) -> MeshResult<()>;
}

/// Default module: property store, property reads, forwarding.
pub struct BaseModule {
    module_id: String,
    properties: PropertyStore,
    sink: RwLock<Option<Arc<dyn Sink>>>,
    request_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
}

impl BaseModule {
    /// Create a module that answers to `module_id`.
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            properties: PropertyStore::new(),
            sink: RwLock::new(None),
            request_handler: RwLock::new(None),
        }
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    /// Set a property value and mark it changed.
    pub fn update_property(&self, name: &str, value: Value) {
        self.properties.update_property(name, value);
    }

    pub fn read_property(&self, name: &str) -> Option<Value> {
        self.properties.read_property(name)
    }

    /// Take the properties changed since the previous call.
    pub fn read_changed_properties(&self) -> std::collections::HashMap<String, Value> {
        self.properties.read_changed_properties()
    }

    /// The current downstream sink, if any.
    pub fn sink(&self) -> Option<Arc<dyn Sink>> {
        self.sink.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drop the downstream sink, e.g. to break a pipeline cycle on shutdown.
    pub fn clear_sink(&self) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Replace the request handler. It runs instead of the baseline logic.
    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self
            .request_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Remove a previously installed request handler.
    pub fn clear_request_handler(&self) {
        *self
            .request_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn request_handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.request_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forward a request to the sink.
    pub async fn forward_request(&self, request: RequestMessage, reply_to: ReplyTo) -> MeshResult<()> {
        let Some(sink) = self.sink() else {
            debug!(
                module = %self.module_id,
                operation = %request.operation,
                thing_id = %request.thing_id,
                "No sink for request"
            );
            return Err(MeshError::NoSink {
                module: self.module_id.clone(),
            });
        };
        sink.handle_request(request, reply_to).await
    }

    /// Forward a notification to the sink, or drop it when there is none.
    pub async fn forward_notification(&self, notification: NotificationMessage) {
        match self.sink() {
            Some(sink) => sink.handle_notification(notification).await,
            None => debug!(
                module = %self.module_id,
                thing_id = %notification.thing_id,
                name = %notification.name,
                "No sink for notification, dropping"
            ),
        }
    }

    /// Forward a response to the sink.
    pub async fn forward_response(&self, response: ResponseMessage) -> MeshResult<()> {
        match self.sink() {
            Some(sink) => sink.handle_response(response).await,
            None => Err(MeshError::EndOfLine {
                thing_id: response.thing_id,
            }),
        }
    }

    /// Answer one of the property read operations from the local store.
    ///
    /// A missing property is reported as a failed response, not a call error.
    fn read_properties_response(&self, request: &RequestMessage) -> ResponseMessage {
        let result = match request.operation {
            Operation::ReadProperty => self
                .properties
                .read_property(&request.name)
                .ok_or_else(|| ErrorValue::from(MeshError::PropertyNotFound(request.name.clone()))),
            Operation::ReadMultipleProperties => request
                .decode_input::<Vec<String>>()
                .map_err(ErrorValue::from)
                .and_then(|names| {
                    serde_json::to_value(self.properties.read_properties(&names))
                        .map_err(|e| ErrorValue::from(MeshError::from(e)))
                }),
            _ => serde_json::to_value(self.properties.read_all_properties())
                .map_err(|e| ErrorValue::from(MeshError::from(e))),
        };
        request.create_response(result)
    }

    /// The baseline request handling, without any installed request handler.
    pub async fn handle_request_default(
        &self,
        request: RequestMessage,
        reply_to: ReplyTo,
    ) -> MeshResult<()> {
        if request.thing_id == self.module_id && request.operation.is_property_read() {
            let response = self.read_properties_response(&request);
            return reply_to(response);
        }
        self.forward_request(request, reply_to).await
    }

    /// Send every changed property to the sink as a property notification.
    ///
    /// Returns the number of notifications sent.
    pub async fn publish_changed_properties(&self) -> usize {
        let changed = self.properties.read_changed_properties();
        let count = changed.len();
        for (name, value) in changed {
            let mut notification = NotificationMessage::property(&self.module_id, name, value);
            notification.sender_id = self.module_id.clone();
            self.forward_notification(notification).await;
        }
        count
    }
}

#[async_trait]
impl Sink for BaseModule {
    async fn handle_request(&self, request: RequestMessage, reply_to: ReplyTo) -> MeshResult<()> {
        if let Some(handler) = self.request_handler() {
            return handler.handle_request(request, reply_to).await;
        }
        self.handle_request_default(request, reply_to).await
    }

    async fn handle_notification(&self, notification: NotificationMessage) {
        self.forward_notification(notification).await;
    }

    async fn handle_response(&self, response: ResponseMessage) -> MeshResult<()> {
        if response.thing_id == self.module_id {
            debug!(
                module = %self.module_id,
                correlation_id = %response.correlation_id,
                "Response reached its owner"
            );
            return Ok(());
        }
        self.forward_response(response).await
    }
}

#[async_trait]
impl Module for BaseModule {
    fn module_id(&self) -> &str {
        &self.module_id
    }

    fn set_sink(&self, sink: Arc<dyn Sink>) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }
}
