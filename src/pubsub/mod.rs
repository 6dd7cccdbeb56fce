//! # Pub/Sub Emulation Layer
//!
//! Topic semantics on a point-to-point, single-consumer queue backend.
//!
//! ## Components (leaves first)
//!
//! - [`naming`] - primary and replica queue names
//! - [`topology_cache`] - time-bounded topic → queue-set view
//! - [`topology`] - creates queues and owns the topic → queue-set mapping
//! - [`retry`] - fixed-interval retry on throttling
//! - [`publisher`] - fan-out publish into every queue of a topic
//! - [`event_source`] - topics fed by an external one-shot event source
//! - [`subscription`] - one polling loop per subscriber queue, with
//!   forwarding from the primary for event-sourced topics
//! - [`service`] - the [`QueuePubSub`] facade tying it all together

pub mod event_source;
pub mod handler;
pub mod naming;
pub mod publisher;
pub mod retry;
pub mod service;
pub mod shutdown;
pub mod subscription;
pub mod topology;
pub mod topology_cache;

pub use event_source::EventSourceRegistry;
pub use handler::{ignore_errors, ErrorCallback, MessageHandler};
pub use publisher::FanoutPublisher;
pub use retry::RetryPolicy;
pub use service::QueuePubSub;
pub use shutdown::ShutdownSignal;
pub use subscription::{SubscriptionHandle, SubscriptionState, SubscriptionStats};
pub use topology::TopologyManager;
pub use topology_cache::TopologyCache;
