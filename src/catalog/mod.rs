//! Authenticated access to the catalog: resources, permissions, events and
//! locks, plus the token session shared by all of them.

mod client;
mod lock;
mod session;

pub use client::{CatalogClient, TryLockOutcome, DATASOURCE_KIND, ETL_JOB_KIND};
pub use lock::LockGuard;
pub use session::{Session, SessionManager, SharedSession};
