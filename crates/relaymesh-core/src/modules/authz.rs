//! Role-based authorization of requests.
//!
//! Only looks at the stamped `sender_id`, the `operation` and the `thing_id`.
//! A denied request is answered with a failed response (403) through the reply
//! path; it is not a routing error.

use crate::base::BaseModule;
use crate::module::{Module, ReplyTo, Sink};
use async_trait::async_trait;
use dashmap::DashMap;
use relaymesh_types::{
    MeshError, MeshResult, NotificationMessage, Operation, RequestMessage, ResponseMessage,
};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Client roles with hierarchical permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientRole {
    /// Read and observe only.
    Viewer = 0,
    /// Can also invoke and cancel actions.
    Operator = 1,
    /// Can also write properties.
    Manager = 2,
    /// Everything, including non-standard operations.
    Admin = 3,
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRole::Viewer => write!(f, "viewer"),
            ClientRole::Operator => write!(f, "operator"),
            ClientRole::Manager => write!(f, "manager"),
            ClientRole::Admin => write!(f, "admin"),
        }
    }
}

impl ClientRole {
    /// Parse a role name. Unknown names get the least privilege.
    pub fn from_str_role(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "admin" => ClientRole::Admin,
            "manager" => ClientRole::Manager,
            "operator" => ClientRole::Operator,
            _ => ClientRole::Viewer,
        }
    }
}

/// Minimum role required for an operation.
fn required_role(operation: &Operation) -> ClientRole {
    match operation {
        Operation::ReadProperty
        | Operation::ReadMultipleProperties
        | Operation::ReadAllProperties
        | Operation::ObserveProperty
        | Operation::UnobserveProperty
        | Operation::ObserveAllProperties
        | Operation::UnobserveAllProperties
        | Operation::SubscribeEvent
        | Operation::UnsubscribeEvent
        | Operation::SubscribeAllEvents
        | Operation::UnsubscribeAllEvents
        | Operation::QueryAction => ClientRole::Viewer,
        Operation::InvokeAction | Operation::CancelAction => ClientRole::Operator,
        Operation::WriteProperty | Operation::WriteMultipleProperties => ClientRole::Manager,
        Operation::Other(_) => ClientRole::Admin,
    }
}

/// Chain module that checks each request against the sender's role.
pub struct AuthzModule {
    base: BaseModule,
    roles: DashMap<String, ClientRole>,
}

impl AuthzModule {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            base: BaseModule::new(module_id),
            roles: DashMap::new(),
        }
    }

    /// Create a module with `(client_id, role_name)` assignments.
    pub fn with_roles<I, S>(module_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        let module = Self::new(module_id);
        for (client, role) in roles {
            module.set_role(client.as_ref(), ClientRole::from_str_role(role.as_ref()));
        }
        module
    }

    /// Assign a role to a client.
    pub fn set_role(&self, client_id: &str, role: ClientRole) {
        info!(client_id, role = %role, "Assigned client role");
        self.roles.insert(client_id.to_string(), role);
    }

    pub fn remove_role(&self, client_id: &str) {
        self.roles.remove(client_id);
    }

    pub fn role_of(&self, client_id: &str) -> Option<ClientRole> {
        self.roles.get(client_id).map(|r| *r)
    }

    /// Check whether `sender_id` may perform the request.
    pub fn authorize(&self, request: &RequestMessage) -> MeshResult<()> {
        if request.sender_id.is_empty() {
            return Err(MeshError::Unauthorized(
                "request has no authenticated sender".to_string(),
            ));
        }
        let Some(role) = self.role_of(&request.sender_id) else {
            return Err(MeshError::Unauthorized(format!(
                "client '{}' has no role",
                request.sender_id
            )));
        };
        let required = required_role(&request.operation);
        if role < required {
            return Err(MeshError::Unauthorized(format!(
                "client '{}' with role '{}' cannot {} on '{}' (requires '{}')",
                request.sender_id, role, request.operation, request.thing_id, required
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for AuthzModule {
    async fn handle_request(&self, request: RequestMessage, reply_to: ReplyTo) -> MeshResult<()> {
        if let Err(e) = self.authorize(&request) {
            warn!(
                sender_id = %request.sender_id,
                operation = %request.operation,
                thing_id = %request.thing_id,
                "Request denied"
            );
            return reply_to(request.create_error_response(e));
        }
        self.base.handle_request(request, reply_to).await
    }

    async fn handle_notification(&self, notification: NotificationMessage) {
        self.base.handle_notification(notification).await;
    }

    async fn handle_response(&self, response: ResponseMessage) -> MeshResult<()> {
        self.base.handle_response(response).await
    }
}

#[async_trait]
impl Module for AuthzModule {
    fn module_id(&self) -> &str {
        self.base.module_id()
    }

    fn set_sink(&self, sink: Arc<dyn Sink>) {
        self.base.set_sink(sink);
    }
}
