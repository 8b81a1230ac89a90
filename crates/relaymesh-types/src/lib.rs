//! Core types for the relaymesh messaging core.
//!
//! This crate defines the Request/Response/Notification envelope model shared by
//! every module and transport binding, along with the error taxonomy and
//! configuration types. It contains no async code and no routing logic.

pub mod config;
pub mod error;
pub mod ids;
pub mod messages;
pub mod operation;

pub use error::{ErrorValue, MeshError, MeshResult};
pub use messages::{
    AffordanceType, Envelope, MessageType, NotificationMessage, RequestMessage, ResponseMessage,
    ResponseState,
};
pub use operation::Operation;
