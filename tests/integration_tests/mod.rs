//! Integration tests module
//!
//! End-to-end tests of the lease protocol against the in-memory store:
//! - Claim, heartbeat, takeover and release between instances
//! - Several collector runners sharing one table
//! - Processing errors, escalation and store outages

pub mod error_scenarios;
pub mod fixtures;
pub mod lease_lifecycle;
pub mod rebalance_test;
