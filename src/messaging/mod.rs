//! # Messaging Module
//!
//! Point-to-point queue backend seam. Provider adapters implement
//! [`QueueBackend`]; the in-memory backend is the reference implementation
//! used by tests and local development.

pub mod backend;
pub mod errors;
pub mod in_memory;

pub use backend::{QueueBackend, QueueId, QueuePage, ReceivedMessage};
pub use errors::{BackendError, BackendResult};
pub use in_memory::InMemoryQueueBackend;
