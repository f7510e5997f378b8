//! # Retrieve Module
//!
//! Everything that talks to the RPC Source.
//!
//! - **`retry`**: the single retry policy applied to every call.
//! - **`rpc_client`**: JSON-RPC 2.0 envelope handling over a pluggable transport.
//! - **`solana`**: typed helpers for the handful of Solana methods the engine uses.

pub mod retry;
pub mod rpc_client;
pub mod solana;

pub use retry::RetryPolicy;
pub use rpc_client::{HttpTransport, RpcClient, RpcTransport};
pub use solana::{MintInfo, TokenAccount};
