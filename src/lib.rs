//! # docwire-client
//!
//! Rust client SDK for Docwire data subscriptions: a long-lived worker that
//! opens a dedicated TCP connection to a database node, negotiates the
//! subscription protocol, and delivers server-pushed document batches with
//! at-least-once semantics.
//!
//! ## Architecture
//!
//! - **Transport**: plain TCP or TLS, selected by the endpoint URL scheme
//! - **Wire**: back-to-back JSON objects in both directions, no delimiters
//! - **Pipeline**: the next batch is read while the previous one is being
//!   processed and acknowledged
//! - **Resilience**: topology-aware redirects and bounded-error reconnect
//!
//! ## Example
//!
//! ```ignore
//! use docwire_client::{SubscriptionOptions, SubscriptionWorker};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = SubscriptionOptions::builder("orders-feed").build()?;
//!     let worker: SubscriptionWorker<Order> =
//!         SubscriptionWorker::builder("northwind", topology, options).build();
//!
//!     worker.on_batch(|batch, completion| {
//!         for item in batch.items() {
//!             process(item.document()?);
//!         }
//!         completion.done();
//!     });
//!
//!     worker.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod error;
pub mod events;
pub mod options;
pub mod protocol;
pub mod replication;
pub mod topology;
pub mod transport;

mod worker;

pub use batch::{Revision, SubscriptionBatch, SubscriptionItem};
pub use error::{Result, SubscriberError, SubscriptionError};
pub use events::{BatchCompletion, EventKind, ListenerId};
pub use options::{SubscriptionOptions, SubscriptionStrategy};
pub use topology::{TcpConnectionInfo, TopologyNode, TopologyProvider};
pub use worker::{SubscriptionWorker, SubscriptionWorkerBuilder};
