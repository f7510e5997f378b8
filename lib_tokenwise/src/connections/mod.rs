//! # Connections Module
//!
//! Persistence backends behind the `Store` trait.
//!
//! - **`store`**: the trait itself.
//! - **`store_memory`**: lock-guarded in-process collections.
//! - **`store_postgres`**: `deadpool-postgres` backed tables (feature `postgres`).

pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;

pub use store::Store;
pub use store_memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use store_postgres::PgStore;
