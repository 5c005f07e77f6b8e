//! Repository functions — one function per database operation.
//!
//! Every function takes a `&DbPool` (or a connection, when it has to run
//! inside a caller's transaction) and returns a `Result<T, DbError>`.
//! No business logic, no domain types — pure SQL.

pub mod pipelines;
pub mod stages;
pub mod snapshots;
pub mod instances;
pub mod devices;
pub mod teams;
pub mod audit;
