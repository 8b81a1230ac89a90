//! Direct in-process binding.
//!
//! A [`DirectServer`] accepts [`DirectClient`] connections over a pair of tokio
//! channels carrying [`Envelope`]s. Both ends are modules:
//!
//! - Envelopes arriving *from* a client enter the server's pipeline through its
//!   sink, with `sender_id` stamped to the client's ID.
//! - Requests the pipeline hands *to* the server are pushed down the connection
//!   of the agent that owns the thing (`"{agent_id}:{thing}"`), even though the
//!   agent dialled in as a client. Its answer comes back over the same
//!   connection and is matched by correlation ID.
//!
//! The client mirrors this: requests it receives from the server go to its own
//! sink (the agent application), requests handed to it go to the server.

use crate::base::BaseModule;
use crate::correlation::CorrelationEngine;
use crate::module::{reply_fn, Module, ReplyTo, Sink};
use crate::transport::{agent_of, Connection};
use async_trait::async_trait;
use dashmap::DashMap;
use relaymesh_types::config::MeshConfig;
use relaymesh_types::ids::new_connection_id;
use relaymesh_types::{
    Envelope, MeshError, MeshResult, NotificationMessage, RequestMessage, ResponseMessage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Queue an envelope from synchronous code such as a reply callback.
fn push(tx: &mpsc::Sender<Envelope>, envelope: Envelope, peer: &str) -> MeshResult<()> {
    match tx.try_send(envelope) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(envelope)) => {
            let tx = tx.clone();
            let peer = peer.to_string();
            tokio::spawn(async move {
                if tx.send(envelope).await.is_err() {
                    debug!(peer = %peer, "Connection closed before queued envelope was sent");
                }
            });
            Ok(())
        }
        Err(TrySendError::Closed(_)) => Err(MeshError::NotConnected(peer.to_string())),
    }
}

async fn send(tx: &mpsc::Sender<Envelope>, envelope: Envelope, peer: &str) -> MeshResult<()> {
    tx.send(envelope)
        .await
        .map_err(|_| MeshError::NotConnected(peer.to_string()))
}

/// Send a request and route its correlated response to `reply_to`.
///
/// The slot is opened before sending so a fast response is buffered rather
/// than lost. If nothing arrives within `timeout`, `reply_to` receives a
/// failed response.
async fn send_with_reply(
    correlation: &CorrelationEngine,
    tx: &mpsc::Sender<Envelope>,
    peer: &str,
    mut request: RequestMessage,
    reply_to: ReplyTo,
    timeout: Duration,
) -> MeshResult<()> {
    let cid = request.ensure_correlation_id().to_string();
    correlation.try_open(&cid)?;
    let on_timeout = request.create_error_response(MeshError::Timeout(cid.clone()));

    if let Err(e) = send(tx, Envelope::Request(request), peer).await {
        correlation.close(&cid);
        return Err(e);
    }
    correlation.wait_with_callback(&cid, timeout, move |response| {
        let response = response.unwrap_or(on_timeout);
        if let Err(e) = reply_to(response) {
            debug!(error = %e, "Reply could not be delivered");
        }
    });
    Ok(())
}

/// Server-side view of one client connection.
pub struct ServerConnection {
    connection_id: String,
    client_id: String,
    tx: mpsc::Sender<Envelope>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl Connection for ServerConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send_request(&self, request: RequestMessage) -> MeshResult<()> {
        send(&self.tx, Envelope::Request(request), &self.client_id).await
    }

    async fn send_response(&self, response: ResponseMessage) -> MeshResult<()> {
        send(&self.tx, Envelope::Response(response), &self.client_id).await
    }

    async fn send_notification(&self, notification: NotificationMessage) -> MeshResult<()> {
        send(&self.tx, Envelope::Notification(notification), &self.client_id).await
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let _ = self.shutdown.send(true);
    }
}

/// Server end of the direct binding.
pub struct DirectServer {
    base: BaseModule,
    config: MeshConfig,
    /// Live connections keyed by client ID. A reconnect replaces the old entry.
    connections: DashMap<String, Arc<ServerConnection>>,
    /// Requests pushed to agents, awaiting their response.
    correlation: CorrelationEngine,
    /// Correlation ID → client that sent the request, until its final response.
    requesters: Arc<DashMap<String, String>>,
    this: Weak<DirectServer>,
}

impl DirectServer {
    /// Create a server module answering to `module_id`.
    pub fn new(module_id: impl Into<String>, config: MeshConfig) -> Arc<Self> {
        let module_id = module_id.into();
        Arc::new_cyclic(|this| Self {
            base: BaseModule::new(module_id),
            config,
            connections: DashMap::new(),
            correlation: CorrelationEngine::new(),
            requesters: Arc::new(DashMap::new()),
            this: this.clone(),
        })
    }

    /// The embedded base module, for the server's own properties.
    pub fn base(&self) -> &BaseModule {
        &self.base
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// IDs of all connected clients.
    pub fn connected_clients(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// The live connection of a client.
    pub fn connection(&self, client_id: &str) -> Option<Arc<dyn Connection>> {
        self.connection_for(client_id)
            .map(|c| c as Arc<dyn Connection>)
    }

    fn connection_for(&self, client_id: &str) -> Option<Arc<ServerConnection>> {
        self.connections.get(client_id).map(|c| Arc::clone(c.value()))
    }

    /// Number of requests pushed to agents that still await a response.
    pub fn pending_requests(&self) -> usize {
        self.correlation.len()
    }

    /// Accept a connection from `client_id`.
    ///
    /// Returns the connection ID, the sender for client → server traffic and
    /// the receiver for server → client traffic.
    fn accept(
        &self,
        client_id: &str,
    ) -> (String, mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        let capacity = self.config.channel_capacity.max(1);
        let (up_tx, mut up_rx) = mpsc::channel::<Envelope>(capacity);
        let (down_tx, down_rx) = mpsc::channel::<Envelope>(capacity);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let conn = Arc::new(ServerConnection {
            connection_id: new_connection_id(client_id),
            client_id: client_id.to_string(),
            tx: down_tx,
            connected: AtomicBool::new(true),
            shutdown: shutdown_tx,
        });
        if let Some(old) = self
            .connections
            .insert(client_id.to_string(), Arc::clone(&conn))
        {
            info!(client_id, old = %old.connection_id, "Client reconnected, closing previous connection");
            old.close();
        }
        info!(client_id, connection_id = %conn.connection_id, "Client connected");

        let server = self.this.clone();
        let task_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    msg = up_rx.recv() => match msg {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };
                let Some(server) = server.upgrade() else { break };
                server.handle_inbound(&task_conn, envelope).await;
            }
            task_conn.connected.store(false, Ordering::Relaxed);
            if let Some(server) = server.upgrade() {
                server.remove_connection(&task_conn);
            }
            info!(
                client_id = %task_conn.client_id,
                connection_id = %task_conn.connection_id,
                "Client disconnected"
            );
        });

        (conn.connection_id.clone(), up_tx, down_rx)
    }

    fn remove_connection(&self, conn: &ServerConnection) {
        let removed = self
            .connections
            .remove_if(&conn.client_id, |_, c| c.connection_id == conn.connection_id);
        if removed.is_some() {
            self.requesters.retain(|_, client| client != &conn.client_id);
        }
    }

    /// Dispatch one envelope received from a client.
    async fn handle_inbound(&self, conn: &Arc<ServerConnection>, envelope: Envelope) {
        match envelope {
            Envelope::Request(mut request) => {
                request.sender_id = conn.client_id.clone();
                let Some(server) = self.this.upgrade() else {
                    return;
                };
                let conn = Arc::clone(conn);
                // Own task so a slow handler never stalls this connection.
                tokio::spawn(async move {
                    server.handle_client_request(&conn, request).await;
                });
            }
            Envelope::Response(mut response) => {
                response.sender_id = conn.client_id.clone();
                if self
                    .correlation
                    .handle_response(response.clone(), self.config.response_buffer())
                {
                    return;
                }
                // Not a reply to a pushed request: pass it along out of band.
                if let Err(e) = self.base.forward_response(response).await {
                    debug!(client_id = %conn.client_id, error = %e, "Unrouted response dropped");
                }
            }
            Envelope::Notification(mut notification) => {
                notification.sender_id = conn.client_id.clone();
                self.base.forward_notification(notification).await;
            }
        }
    }

    async fn handle_client_request(&self, conn: &ServerConnection, request: RequestMessage) {
        let fallback = request.clone();
        let cid = request.correlation_id.clone();
        if !cid.is_empty() {
            self.requesters.insert(cid.clone(), conn.client_id.clone());
        }
        let tx = conn.tx.clone();
        let peer = conn.client_id.clone();
        let requesters = Arc::clone(&self.requesters);
        let reply_to = reply_fn(move |response| {
            if response.is_final() {
                requesters.remove(&response.correlation_id);
            }
            push(&tx, Envelope::Response(response), &peer)
        });

        if let Err(e) = self.base.handle_request(request, reply_to).await {
            self.requesters.remove(&cid);
            debug!(
                client_id = %conn.client_id,
                thing_id = %fallback.thing_id,
                error = %e,
                "Client request could not be routed"
            );
            let response = fallback.create_error_response(e);
            if let Err(e) = push(&conn.tx, Envelope::Response(response), &conn.client_id) {
                debug!(error = %e, "Error response could not be delivered");
            }
        }
    }
}

#[async_trait]
impl Sink for DirectServer {
    /// Push a request to the agent that owns the addressed thing.
    async fn handle_request(&self, request: RequestMessage, reply_to: ReplyTo) -> MeshResult<()> {
        if request.thing_id == self.base.module_id() {
            if request.operation.is_property_read() {
                return self.base.handle_request_default(request, reply_to).await;
            }
            return Err(MeshError::UnhandledOperation {
                operation: request.operation.to_string(),
                thing_id: request.thing_id,
            });
        }
        let agent_id = agent_of(&request.thing_id).to_string();
        let Some(conn) = self.connection_for(&agent_id) else {
            return Err(MeshError::NotConnected(agent_id));
        };
        debug!(
            agent_id = %agent_id,
            operation = %request.operation,
            thing_id = %request.thing_id,
            "Pushing request to agent"
        );
        send_with_reply(
            &self.correlation,
            &conn.tx,
            &agent_id,
            request,
            reply_to,
            self.config.rpc_timeout(),
        )
        .await
    }

    /// Broadcast to every connected client except the one that sent it.
    async fn handle_notification(&self, notification: NotificationMessage) {
        let targets: Vec<Arc<ServerConnection>> = self
            .connections
            .iter()
            .filter(|e| e.key() != &notification.sender_id)
            .map(|e| Arc::clone(e.value()))
            .collect();
        for conn in targets {
            if let Err(e) = conn.send_notification(notification.clone()).await {
                debug!(client_id = %conn.client_id, error = %e, "Notification not delivered");
            }
        }
    }

    /// Deliver an out-of-band response to the client that made the request.
    ///
    /// The target comes from the server's own record of who sent the request,
    /// never from a field of the response.
    async fn handle_response(&self, response: ResponseMessage) -> MeshResult<()> {
        if response.thing_id == self.base.module_id() {
            return Ok(());
        }
        let conn = self
            .requesters
            .get(&response.correlation_id)
            .and_then(|requester| self.connection_for(requester.value()));
        let Some(conn) = conn else {
            return Err(MeshError::EndOfLine {
                thing_id: response.thing_id,
            });
        };
        if response.is_final() {
            self.requesters.remove(&response.correlation_id);
        }
        conn.send_response(response).await
    }
}

#[async_trait]
impl Module for DirectServer {
    fn module_id(&self) -> &str {
        self.base.module_id()
    }

    fn set_sink(&self, sink: Arc<dyn Sink>) {
        self.base.set_sink(sink);
    }

    async fn stop(&self) {
        let conns: Vec<Arc<ServerConnection>> = self
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for conn in conns {
            conn.close();
        }
        self.connections.clear();
        self.requesters.clear();
        self.correlation.close_all();
        self.base.clear_sink();
        info!(module = %self.base.module_id(), "Direct server stopped");
    }
}

/// Client end of the direct binding.
///
/// As a consumer, requests handed to it travel to the server and their
/// responses come back correlated. As an agent, requests the server pushes to
/// it are passed to its own sink and answered over the same connection.
pub struct DirectClient {
    base: BaseModule,
    connection_id: String,
    tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    correlation: CorrelationEngine,
    config: MeshConfig,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl DirectClient {
    /// Connect to `server` as `client_id`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(server: &DirectServer, client_id: &str) -> Arc<Self> {
        let (connection_id, tx, mut rx) = server.accept(client_id);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = Arc::new(Self {
            base: BaseModule::new(client_id),
            connection_id,
            tx: Mutex::new(Some(tx)),
            correlation: CorrelationEngine::new(),
            config: server.config.clone(),
            connected: AtomicBool::new(true),
            shutdown: shutdown_tx,
        });

        let weak = Arc::downgrade(&client);
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };
                let Some(client) = weak.upgrade() else { break };
                client.handle_inbound(envelope).await;
            }
            if let Some(client) = weak.upgrade() {
                client.mark_disconnected();
            }
        });
        client
    }

    /// The embedded base module, for the client's own properties.
    pub fn base(&self) -> &BaseModule {
        &self.base
    }

    /// Number of requests sent to the server that still await a response.
    pub fn pending_requests(&self) -> usize {
        self.correlation.len()
    }

    fn sender(&self) -> MeshResult<mpsc::Sender<Envelope>> {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MeshError::NotConnected(self.base.module_id().to_string()))
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            info!(client_id = %self.base.module_id(), "Disconnected from server");
        }
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.correlation.close_all();
    }

    /// Close the connection. Pending requests are released immediately.
    pub fn disconnect(&self) {
        self.mark_disconnected();
        let _ = self.shutdown.send(true);
    }

    async fn handle_inbound(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Request(request) => {
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    client.handle_server_request(request).await;
                });
            }
            Envelope::Response(response) => {
                if self
                    .correlation
                    .handle_response(response.clone(), self.config.response_buffer())
                {
                    return;
                }
                if let Err(e) = self.base.forward_response(response).await {
                    debug!(error = %e, "Unrouted response dropped");
                }
            }
            Envelope::Notification(notification) => {
                self.base.forward_notification(notification).await;
            }
        }
    }

    /// Serve a request the server pushed over this connection.
    async fn handle_server_request(&self, request: RequestMessage) {
        let tx = match self.sender() {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "Request from server arrived after disconnect");
                return;
            }
        };
        let fallback = request.clone();
        let reply_tx = tx.clone();
        let reply_to = reply_fn(move |response| push(&reply_tx, Envelope::Response(response), "server"));

        if let Err(e) = self.base.handle_request(request, reply_to).await {
            debug!(
                client_id = %self.base.module_id(),
                thing_id = %fallback.thing_id,
                error = %e,
                "Pushed request could not be handled"
            );
            if let Err(e) = push(&tx, Envelope::Response(fallback.create_error_response(e)), "server") {
                debug!(error = %e, "Error response could not be delivered");
            }
        }
    }
}

#[async_trait]
impl Connection for DirectClient {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn client_id(&self) -> &str {
        self.base.module_id()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send_request(&self, request: RequestMessage) -> MeshResult<()> {
        send(&self.sender()?, Envelope::Request(request), "server").await
    }

    async fn send_response(&self, response: ResponseMessage) -> MeshResult<()> {
        send(&self.sender()?, Envelope::Response(response), "server").await
    }

    async fn send_notification(&self, notification: NotificationMessage) -> MeshResult<()> {
        send(&self.sender()?, Envelope::Notification(notification), "server").await
    }

    fn close(&self) {
        self.disconnect();
    }
}

#[async_trait]
impl Sink for DirectClient {
    /// Send a request to the server; the response is routed to `reply_to`.
    ///
    /// Property reads addressed to this client are answered locally.
    async fn handle_request(&self, request: RequestMessage, reply_to: ReplyTo) -> MeshResult<()> {
        if request.thing_id == self.base.module_id() && request.operation.is_property_read() {
            return self.base.handle_request_default(request, reply_to).await;
        }
        let tx = self.sender()?;
        send_with_reply(
            &self.correlation,
            &tx,
            "server",
            request,
            reply_to,
            self.config.rpc_timeout(),
        )
        .await
    }

    /// Publish a notification to the server.
    async fn handle_notification(&self, notification: NotificationMessage) {
        if let Err(e) = self.send_notification(notification).await {
            warn!(client_id = %self.base.module_id(), error = %e, "Notification not sent");
        }
    }

    /// Send an out-of-band response to the server, unless it is addressed here.
    async fn handle_response(&self, response: ResponseMessage) -> MeshResult<()> {
        if response.thing_id == self.base.module_id() {
            return self.base.handle_response(response).await;
        }
        self.send_response(response).await
    }
}

#[async_trait]
impl Module for DirectClient {
    fn module_id(&self) -> &str {
        self.base.module_id()
    }

    fn set_sink(&self, sink: Arc<dyn Sink>) {
        self.base.set_sink(sink);
    }

    async fn stop(&self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::forward_request_wait;
    use relaymesh_types::Operation;
    use serde_json::{json, Value};
    use std::time::Duration;

    const SEC: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let server = DirectServer::new("hub", MeshConfig::default());
        let client = DirectClient::connect(&server, "consumer1");
        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.connected_clients(), vec!["consumer1".to_string()]);
        assert!(client.is_connected());
        assert!(client.connection_id().starts_with("consumer1-"));

        client.disconnect();
        assert!(!client.is_connected());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 0);

        let req = RequestMessage::new(Operation::ReadProperty, "hub", "x", Value::Null);
        let err = forward_request_wait(client.as_ref(), req, SEC).await.unwrap_err();
        assert!(matches!(err, MeshError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_consumer_reads_server_property() {
        let server = DirectServer::new("hub", MeshConfig::default());
        server.base().update_property("version", json!("1.0"));
        let client = DirectClient::connect(&server, "consumer1");

        let req = RequestMessage::new(Operation::ReadProperty, "hub", "version", Value::Null);
        let resp = forward_request_wait(client.as_ref(), req, SEC).await.unwrap();
        assert_eq!(resp.output, json!("1.0"));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_unroutable_request_returns_error_response() {
        let server = DirectServer::new("hub", MeshConfig::default());
        let client = DirectClient::connect(&server, "consumer1");

        // The server has no sink, so the client gets a failed response back.
        let req = RequestMessage::new(Operation::InvokeAction, "nowhere:thing", "go", Value::Null);
        let err = forward_request_wait(client.as_ref(), req, SEC).await.unwrap_err();
        match err {
            MeshError::Remote(value) => assert_eq!(value.status, 503),
            other => panic!("Expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_to_unknown_agent_fails() {
        let server = DirectServer::new("hub", MeshConfig::default());
        let req = RequestMessage::new(Operation::InvokeAction, "ghost:lamp", "on", Value::Null);
        let err = server
            .handle_request(req, crate::module::ignore_reply())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NotConnected(ref a) if a == "ghost"));
    }

    #[tokio::test]
    async fn test_server_stop_disconnects_clients() {
        let server = DirectServer::new("hub", MeshConfig::default());
        let client = DirectClient::connect(&server, "agent1");
        server.stop().await;
        assert_eq!(server.connection_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_client_answers_its_own_property_reads() {
        let server = DirectServer::new("hub", MeshConfig::default());
        let client = DirectClient::connect(&server, "agent1");
        client.base().update_property("battery", json!(80));
        client.disconnect();

        // Answered without the server, which is no longer reachable.
        let req = RequestMessage::new(Operation::ReadProperty, "agent1", "battery", Value::Null);
        let resp = forward_request_wait(client.as_ref(), req, SEC).await.unwrap();
        assert_eq!(resp.output, json!(80));

        let req = RequestMessage::new(Operation::InvokeAction, "agent1", "reboot", Value::Null);
        let err = forward_request_wait(client.as_ref(), req, SEC).await.unwrap_err();
        assert!(matches!(err, MeshError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_client_accepts_responses_addressed_to_itself() {
        let server = DirectServer::new("hub", MeshConfig::default());
        let client = DirectClient::connect(&server, "agent1");
        client.disconnect();

        let own = RequestMessage::new(Operation::InvokeAction, "agent1", "go", Value::Null)
            .create_response(Ok(Value::Null));
        client.handle_response(own).await.unwrap();

        let other = RequestMessage::new(Operation::InvokeAction, "agent2:lamp", "go", Value::Null)
            .create_response(Ok(Value::Null));
        assert!(client.handle_response(other).await.is_err());
    }

    #[tokio::test]
    async fn test_out_of_band_response_without_requester_is_end_of_line() {
        let server = DirectServer::new("hub", MeshConfig::default());
        let _victim = DirectClient::connect(&server, "consumer1");
        let resp = RequestMessage::new(Operation::InvokeAction, "agent1:lamp", "on", Value::Null)
            .with_sender("consumer1")
            .create_response(Ok(Value::Null));
        // The sender field alone never selects a connection.
        let err = server.handle_response(resp).await.unwrap_err();
        assert!(matches!(err, MeshError::EndOfLine { .. }));
    }
}
