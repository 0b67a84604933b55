//! Cross-process scheduling primitives built on the coordination store.
//!
//! - [`Lock`]: leased mutual exclusion with owner-token release
//! - [`DelayQueue`]: deadline-ordered delivery of scheduled messages
//! - [`Queue`]: single-consumer FIFO mailbox with ack-to-advance

pub mod delay_queue;
pub mod lock;
pub mod message;
pub mod queue;

pub use delay_queue::DelayQueue;
pub use lock::Lock;
pub use message::{DelayMessage, Message};
pub use queue::{MailboxState, Queue};
