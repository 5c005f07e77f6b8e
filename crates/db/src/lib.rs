//! `db` crate — Postgres persistence for the deployment pipeline.
//!
//! Provides a connection pool, typed row structs, and repository functions
//! for every table in the schema. [`PgStores`] and [`PgAuditSink`] plug the
//! repositories into the `ports` traits the engine runs against. No business
//! logic lives here.

pub mod error;
pub mod pool;
pub mod repository;
pub mod models;
pub mod mapping;
pub mod stores;

pub use pool::{create_pool, run_migrations, DbPool, PoolConfig};
pub use error::DbError;
pub use stores::{PgAuditSink, PgStores};
