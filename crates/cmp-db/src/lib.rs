//! Certificate life-cycle persistence on SurrealDB.
//!
//! This crate provides:
//! - Connection management ([`DbManager`], [`DbConfig`])
//! - Schema initialization and migrations ([`run_migrations`])
//! - Repository implementations of the `cmp-core` traits, bundled in
//!   [`SurrealStore`]
//! - The serialized audit-chain writer shared by every repository that
//!   commits life-cycle transitions ([`AuditChainWriter`])
//! - Error types ([`DbError`])

mod chain;
mod connection;
mod error;
pub mod repository;
mod schema;
mod store;

pub use chain::AuditChainWriter;
pub use connection::{DbConfig, DbManager};
pub use error::DbError;
pub use schema::run_migrations;
pub use store::SurrealStore;
