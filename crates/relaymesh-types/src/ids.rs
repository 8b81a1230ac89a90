//! Identifier generation.

use uuid::Uuid;

/// Generate a fresh, globally unique correlation ID.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a connection ID scoped to a client.
///
/// A client may hold several connections at once, so the client ID alone is
/// not unique.
pub fn new_connection_id(client_id: &str) -> String {
    format!("{client_id}-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_connection_id_prefix() {
        let id = new_connection_id("agent-1");
        assert!(id.starts_with("agent-1-"));
    }
}
