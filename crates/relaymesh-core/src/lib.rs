//! relaymesh core: correlation and module chaining for RRN envelopes.
//!
//! Every transport client, transport server and application module implements
//! the same [`Sink`]/[`Module`] contract, so pipelines compose the same way no
//! matter which side dialled the underlying connection.
//!
//! ## Architecture
//!
//! - **CorrelationEngine**: matches asynchronous responses to pending requests
//! - **AsyncResult**: one-shot value used to await a reply callback
//! - **Sink / Module**: the chain contract; **BaseModule** is the reusable default
//! - **forward_request_wait**: synchronous RPC on top of the chain
//! - **modules**: logging and authorization chain modules
//! - **transport**: the binding contract and the in-process `direct` binding
//! - **config** / **telemetry**: TOML config loading and tracing setup

pub mod async_result;
pub mod base;
pub mod config;
pub mod correlation;
pub mod module;
pub mod modules;
pub mod properties;
pub mod rpc;
pub mod telemetry;
pub mod transport;

pub use async_result::AsyncResult;
pub use base::{BaseModule, RequestHandler};
pub use correlation::CorrelationEngine;
pub use module::{ignore_reply, reply_fn, Module, ReplyTo, Sink};
pub use properties::PropertyStore;
pub use rpc::forward_request_wait;
