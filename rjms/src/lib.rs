#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use rjms::broker::Broker;
//! use rjms::condition::Never;
//! use rjms::conf::Settings;
//! use rjms::types::{Destination, Message};
//! use rjms::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = Broker::new(Settings::default());
//!     broker.start()?;
//!
//!     let queue = Destination::queue("orders");
//!     let consumer = broker.create_consumer(&queue, Some("region = 'eu'"), false, None)?;
//!     broker.publish(Message::new(queue, "hello").with_property("region", "eu"))?;
//!
//!     if let Some(handle) = consumer.receive(&Never)? {
//!         broker.acknowledge(handle)?;
//!     }
//!     Ok(())
//! }
//! ```

/// Entry point
pub mod broker; // Managers wired together, background tasks
pub mod context; // Shared collaborators

/// Message distribution
pub mod cache; // Queue and topic destination caches
pub mod consumer; // Consumer endpoints
pub mod consumer_mgr; // Consumer and durable subscription registry
pub mod destination_mgr; // Destination and cache lifecycle
pub mod message; // References, handles and the message cache
pub mod message_mgr; // Message ingress
pub mod queue; // Ordered queues

/// Collaborators
pub mod connection; // Connection liveness
pub mod lease; // Expiry leases and the lease timer
pub mod selector; // Message selectors
pub mod store; // Persistence and transactions
pub mod xa; // Global transaction log

/// Support
pub mod condition; // Cancellation conditions for receive
pub mod error; // Error taxonomy
pub mod logger; // slog drain and log bridge
pub mod stats; // Engine statistics
pub mod topic; // Topic names and wildcards
pub mod types; // Destinations, messages, ordering

pub use error::{BrokerError, Result};
pub use rjms_conf as conf;
pub use rjms_utils as utils;
