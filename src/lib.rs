//! An embeddable peer-to-peer message bus: point-to-point sends with
//! optional durable queueing and retry, topic publish/subscribe with
//! TTL-renewed subscriptions, and reply correlation — all carried over a
//! pluggable HTTP transport.
//!
//! Start with [`config::BusConfig`] and [`bus::BusBuilder`]:
//!
//! ```no_run
//! # async fn doc() -> Result<(), peerbus::error::BusError> {
//! use peerbus::bus::BusBuilder;
//! use peerbus::config::BusConfig;
//!
//! let config: BusConfig = serde_json::from_str("{}").unwrap();
//! let bus = BusBuilder::new(config).build().await?;
//! bus.dispose();
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod handler;
pub mod ids;
pub mod inbound;
pub mod message;
pub mod naming;
pub mod queue;
pub mod reply_hub;
pub mod serialization;
pub mod subscription;
pub mod transport;

pub use bus::{Bus, BusBuilder, SendOptions};
pub use error::{BusError, BusResult};
pub use message::{Headers, Importance, Message};
