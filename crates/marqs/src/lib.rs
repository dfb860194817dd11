//! MarQS: a multitenant, fair-share, concurrency-bounded message broker over
//! Redis.
//!
//! Messages are queued per (environment, queue, optional concurrency key)
//! into child ZSETs scored by enqueue time. A parent "queue of queues" ZSET
//! indexes every non-empty child by its oldest member, and dequeues make a
//! weighted, age-aware random choice across a window of the longest-waiting
//! children. Delivery is at-least-once: each dequeue grants a visibility
//! lease, and background requeue workers return expired leases to their
//! queue. Three nested concurrency ceilings (queue, environment,
//! organization) bound in-flight work at every scope.
//!
//! All multi-structure transitions run as server-side Lua scripts, so every
//! state change is atomic; see [`broker::Marqs`] for the operation surface.

mod broker;
pub use broker::{Marqs, MarqsBuilder};

pub mod config;
pub use config::MarqsConfig;

pub mod global;

mod keys;
pub use keys::{sanitize_queue_name, DefaultKeyProducer, KeyProducer};

mod message;
pub use message::{MessagePayload, MESSAGE_VERSION};

mod requeuer;
mod scripts;

pub mod strategy;
pub use strategy::{QueuePriorityStrategy, SimpleWeightedChoiceStrategy};

pub mod telemetry;

mod tenant;
pub use tenant::{EnvironmentType, TenantEnvironment};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("failed to serialize message payload")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Protocol(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
