//! SQL-backed job stores for quiver.
//!
//! Two backends behind cargo features: `sqlite` for an embedded single-file
//! store and `postgres` for a shared server database. Both persist the
//! rate-limit ledger alongside the jobs, so a
//! [`quiver_core::StoredRateLimiter`] keeps its envelope across restarts.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PgJobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;
