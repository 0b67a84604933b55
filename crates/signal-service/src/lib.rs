//! Signal Service Library
//!
//! Call signaling and push-notification delivery for a chat backend. Every
//! process is stateless: coordination state lives in a shared Redis store,
//! so any process can serve any socket and any process can drive any call.
//!
//! # Architecture
//!
//! ```text
//! store (Redis / in-memory)
//! └── sched: Lock, DelayQueue, Queue (mailbox)
//!     ├── call
//!     │   ├── CallManager (one per call, guarded by the manager lock)
//!     │   ├── Monitor (one per process, cleans up after dead managers)
//!     │   ├── CallSession (one per call WebSocket)
//!     │   └── CallService (create / join / hang up)
//!     └── notification
//!         ├── NotificationSession (one per resumable session)
//!         └── NotificationSender (fan-out to a user's sessions)
//! ```
//!
//! # Modules
//!
//! - [`store`] - Coordination store trait with Redis and in-memory backends
//! - [`sched`] - Distributed lock, deadline queue and mailbox primitives
//! - [`call`] - Call state machine, crash recovery and call sessions
//! - [`notification`] - Resumable push sessions
//! - [`repositories`] - Call rows and login lookups
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing codes
//! - [`observability`] - Metrics and health endpoints
//! - [`api`] - HTTP call API
//! - [`ws`] - WebSocket upgrade handlers

#[macro_use]
mod macros;

pub mod api;
pub mod call;
pub mod config;
pub mod errors;
pub mod notification;
pub mod observability;
pub mod repositories;
pub mod sched;
pub mod store;
pub mod ws;
