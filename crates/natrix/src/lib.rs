//! An asynchronous client for the NATS publish/subscribe protocol.
//!
//! The client keeps one long-lived TCP connection to a NATS server, supervises it across
//! transient failures, and multiplexes any number of publishers, subscribers and
//! request/response exchanges over that single socket. Outbound frames are built into
//! pooled buffers and coalesced into batched socket writes; inbound bytes stream through
//! an incremental zero-copy parser and fan out to bounded per-subscription inboxes.
//!
//! Every async operation is cancelled by dropping its future: a publish dropped while
//! awaiting queue capacity takes nothing from the buffer pool, and a dropped request
//! removes its pending-reply slot synchronously.
//!
//! ```no_run
//! use natrix::{Client, ClientConfig};
//!
//! # async fn demo() -> natrix::Result<()> {
//! let client = Client::new(ClientConfig::default());
//! client.connect().await?;
//!
//! let mut updates = client.subscribe("orders.>").await?;
//! client.publish("orders.eu", b"fresh").await?;
//! if let Some(msg) = updates.next().await {
//! 	println!("{}: {:?}", msg.subject, msg.payload);
//! }
//!
//! let reply = client.request("time.service", b"now?").await?;
//! # drop(reply);
//! client.dispose().await;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod codec;
pub mod config;
mod dispatcher;
pub mod error;
mod pool;
pub mod proto;
mod receiver;
mod registry;
mod request;
mod sender;
mod stats;
mod subscription;

pub use client::{Client, ClientEvent, ClientStatus};
pub use codec::{JsonCodec, PayloadCodec};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use proto::{HeaderMap, Message, ServerInfo, Subject};
pub use stats::ClientStats;
pub use subscription::Subscription;
