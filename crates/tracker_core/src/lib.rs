pub mod aggregate;
pub mod config;
pub mod error;
pub mod fetch;
pub mod identity;
pub mod ingest;
pub mod mailbox;
pub mod mention;
pub mod pipeline;
pub mod schema;
pub mod store;
pub mod vote;
