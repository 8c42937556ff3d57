//! Publish/subscribe fan-out for committed updates
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   fan-in task   ┌──────────────┐   one task per   ┌─────────────┐
//! │ Publisher  │───────────────▶│              │   subscriber     │ Subscriber  │
//! └────────────┘                 │  shared      │─────────────────▶│             │
//! ┌────────────┐   fan-in task   │  queue       │                  ├─────────────┤
//! │ Publisher  │───────────────▶│  (EventBus)  │─────────────────▶│ Subscriber  │
//! └────────────┘                 └──────────────┘                  └─────────────┘
//! ```
//!
//! `publish_event` returns only after the bus loop has taken the event, so a
//! publisher feels backpressure when nobody is listening. Subscriber calls are
//! fire-and-forget relative to the bus loop; their errors are logged.

pub mod bus;
pub mod publisher;

pub use bus::{EventBus, SharedEventBus, Subscriber};
pub use publisher::Publisher;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Publisher {0} is already attached to a bus")]
    AlreadyAttached(String),

    #[error("Event bus is already running")]
    AlreadyRunning,
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;
