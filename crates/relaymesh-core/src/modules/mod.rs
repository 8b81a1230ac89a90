//! Chain modules that sit between transports and application modules.

pub mod authz;
pub mod logging;

pub use authz::{AuthzModule, ClientRole};
pub use logging::LoggingModule;
