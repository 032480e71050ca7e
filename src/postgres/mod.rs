// ABOUTME: PostgreSQL connection and catalog helpers
// ABOUTME: Re-exports connect functions and table metadata loaders

pub mod catalog;
pub mod connection;

pub use catalog::{load_foreign_keys, load_table_metadata, TableMetadata};
pub use connection::{cancel_query, connect, connect_with_retry, init_tls_policy};
