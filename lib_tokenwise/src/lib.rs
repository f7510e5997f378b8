//! # TokenWise monitoring engine
//!
//! The live half of TokenWise: it owns the set of tracked wallets for one token,
//! refreshes that set from the chain on a long interval, produces transaction
//! events on a short one, and fans every update out to the connected observers.
//!
//! ## Layout
//!
//! - **`retrieve`**: the JSON-RPC client and its retry policy.
//! - **`connections`**: the `Store` trait plus in-memory and Postgres backends.
//! - **`ingestors`**: pluggable transaction event sources.
//! - **`core`**: subscriber registry, discovery, monitor loop and lifecycle.
//!
//! The `servers` crate wires these together behind axum.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod connections;
pub mod core;
pub mod error;
pub mod ingestors;
pub mod model;
pub mod retrieve;

// Re-export the pieces the server touches most.
pub use connections::store::Store;
pub use connections::store_memory::MemoryStore;
pub use core::{Discovery, Lifecycle, Monitor, MonitorSettings, SubscriberRegistry};
pub use error::{RpcError, StoreError};
pub use retrieve::{RetryPolicy, RpcClient};
