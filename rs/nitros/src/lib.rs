//! # NitROS: Brokerless LAN Publish/Subscribe
//!
//! `nitros` is a lightweight messaging fabric for robotics-style workloads
//! on a local network. A process declares itself the [Publisher] of a named
//! topic; any number of [Subscriber]s on the same LAN find it automatically
//! over mDNS and receive a stream of typed messages. There is no broker and
//! no central registry.
//!
//! ## Design
//!
//! - **Typed messages**: every message is a [Value] — a structured record,
//!   or a dense numeric array carried through a binary sidechannel.
//! - **Lossy compression**: camera-like topics can use JPEG and
//!   point-cloud-like topics a quantizing LZ4 codec, selected per topic via
//!   [Compression].
//! - **Backpressure by dropping**: a slow subscriber never stalls a fast
//!   publisher. The publisher skips subscribers whose sockets are backed up,
//!   and each subscriber delivers only the most recent payload to its
//!   callback.
//! - **Self-healing**: subscribers reconnect with exponential backoff when a
//!   publisher restarts.
//!
//! ## Example
//!
//! ```no_run
//! use nitros::{Publisher, PublisherConfig, Subscriber, SubscriberConfig, Value};
//!
//! # fn main() -> Result<(), nitros::Error> {
//! let publisher = Publisher::new("chatter", PublisherConfig::default())?;
//! publisher.send("hello");
//!
//! let _subscriber = Subscriber::new(
//! 	"chatter",
//! 	|value: Value| println!("{value}"),
//! 	SubscriberConfig::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod log;
mod publisher;
mod subscriber;
mod worker;

pub mod coding;
pub mod compress;
pub mod discovery;
pub mod transport;

pub use coding::{ArrayValue, Dtype, Value};
pub use compress::Compression;
pub use error::*;
pub use publisher::*;
pub use subscriber::*;
