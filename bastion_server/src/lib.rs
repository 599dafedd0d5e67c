//! Bastion Server - Abuse-mitigation core for a job-board platform
//!
//! - Block registry keyed by client IP with at most one active block each
//! - Behavioral fraud scoring that blocks automatically
//! - Request gate in front of every route (fail-open)
//! - Periodic expiry sweep and tracking GC

pub mod abuse;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;

pub use abuse::Guard;
pub use error::GuardError;
