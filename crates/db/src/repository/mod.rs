//! Repository functions — one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic, no domain types beyond the stored documents.

pub mod integrations;
pub mod snapshots;
