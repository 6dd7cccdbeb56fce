#![allow(clippy::doc_markdown)] // Allow technical terms like TTL, URL in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Fanout Core Rust
//!
//! Topic publish/subscribe emulated on top of point-to-point queue backends.
//!
//! ## Overview
//!
//! Many managed queueing services deliver each message to exactly one
//! consumer and have no native multicast primitive. This crate exposes topic
//! semantics on such a backend: every subscriber of a topic receives every
//! message published to it, including messages from an external one-shot
//! event source that can only target a single queue.
//!
//! ## Architecture
//!
//! A topic is backed by one **primary** queue named after the topic plus one
//! **replica** queue per additional subscriber. Publishing sends a copy into
//! every queue. Each subscription polls its own queue. For topics flagged as
//! event-sourced, the subscription on the primary re-sends what it receives
//! to every replica.
//!
//! ## Key Features
//!
//! - **Fan-out Publish**: parallel sends into every queue of a topic
//! - **Dynamic Subscribers**: each subscribe allocates a dedicated queue
//! - **Topology Discovery**: queues created by other processes are found
//!   through a 5 second read-through cache
//! - **Throttling Resilience**: fixed-interval retry of whole operations
//! - **Crash Recovery**: event-source flags persist as queue tags
//! - **Cooperative Cancellation**: subscriptions stop promptly on
//!   unsubscribe, topic deletion and shutdown
//!
//! ## Module Organization
//!
//! - [`messaging`] - Queue backend abstraction and in-memory backend
//! - [`pubsub`] - Topology, publisher, subscriptions and the service facade
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup and helpers
//! - [`constants`] - Naming, tagging and default values
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fanout_core::config::PubSubConfig;
//! use fanout_core::messaging::InMemoryQueueBackend;
//! use fanout_core::pubsub::{ignore_errors, QueuePubSub};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! fanout_core::logging::init_structured_logging();
//!
//! let backend = Arc::new(InMemoryQueueBackend::new());
//! let pubsub = QueuePubSub::new(backend, PubSubConfig::default()).await?;
//!
//! for _ in 0..3 {
//!     pubsub
//!         .subscribe(
//!             "orders",
//!             |topic: String, message: String| async move {
//!                 println!("{topic}: {message}");
//!                 Ok(())
//!             },
//!             ignore_errors(),
//!         )
//!         .await?;
//! }
//!
//! // Delivered to all three subscribers
//! pubsub.publish("orders", "order-created").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod pubsub;

pub use config::{ConfigManager, PubSubConfig};
pub use error::{PubSubError, PubSubResult};
pub use messaging::{
    BackendError, BackendResult, InMemoryQueueBackend, QueueBackend, QueueId, QueuePage,
    ReceivedMessage,
};
pub use pubsub::{
    ignore_errors, ErrorCallback, MessageHandler, QueuePubSub, SubscriptionHandle,
    SubscriptionState,
};
