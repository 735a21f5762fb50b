// ABOUTME: PostgreSQL plumbing for the primary store and PostgreSQL mirrors
// ABOUTME: Connection management and the primary-key record fetcher

pub mod connection;
pub mod fetcher;

pub use connection::{classify_query_error, connect, init_tls_policy, ManagedClient};
pub use fetcher::PgRecordSource;
