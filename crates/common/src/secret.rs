//! Secret types for values that must never reach a log line.
//!
//! Re-exports [`secrecy`] so every crate in the workspace redacts the same way.
//! `SecretString` implements `Debug` with redaction, so a config struct that
//! derives or hand-writes `Debug` cannot leak the coordination-store URL or the
//! token signing secret through `{:?}` or a tracing field.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let secret = SecretString::from("token-signing-key");
//! assert!(!format!("{secret:?}").contains("token-signing-key"));
//! assert_eq!(secret.expose_secret(), "token-signing-key");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_string_debug_is_redacted() {
        let secret = SecretString::from("redis://:password@localhost:6379");
        let debug = format!("{secret:?}");
        assert!(!debug.contains("password"));
        assert!(debug.contains("REDACTED"));
    }
}
