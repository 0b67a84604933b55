//! Common utilities and types shared across the signaling components.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for signed payload tokens (call join tokens, session tokens)
pub mod jwt;
