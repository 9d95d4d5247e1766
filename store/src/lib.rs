//! Store node for a coordination-free log cluster.
//!
//! Every node in the cluster is equal. A node stores segments of log records
//! replicated to it by ingest nodes, and answers client queries and live
//! streams by asking every store node, itself included, over the same
//! internal HTTP API.
//!
//! # Architecture
//!
//! - [`gather::QueryGatherer`] fans a query out to all store nodes and merges
//!   the partial [`QueryResult`]s. Nodes that fail are counted, not fatal.
//! - [`multiplex::StreamMultiplexer`] keeps one sub-stream per store node
//!   open behind a single client stream, following membership changes.
//! - [`replicate::replicate`] turns a pushed batch of records into exactly one
//!   committed segment, or none.
//!
//! These talk to the rest of the node through two traits:
//! [`peer::PeerDirectory`] for membership and [`storage::LogStore`] for the
//! local segments.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use store::clock::SystemClock;
//! use store::config::Config;
//! use store::peer::{Peer, PeerType, StaticPeers};
//! use store::server::{AppState, StoreServer};
//! use store::storage::create_store;
//!
//! let config = Config::default();
//! let store = create_store(&config.storage).await?;
//! let peers = Arc::new(StaticPeers::new(
//!     Peer::new(config.advertise_addr(), PeerType::Store),
//!     vec![],
//! ));
//! let state = AppState::new(store, peers, Arc::new(SystemClock), &config)?;
//! StoreServer::new(state, config.port).run().await?;
//! ```

pub mod clock;
pub mod config;
mod error;
pub mod gather;
pub mod model;
pub mod multiplex;
pub mod peer;
pub mod query;
pub mod replicate;
pub mod server;
pub mod storage;

pub use error::{Error, Result};
pub use model::{Record, RecordId};
pub use query::{QueryParams, QueryRequest, QueryResult};
