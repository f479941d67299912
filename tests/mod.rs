//! Test suite for schedsync
//!
//! Engine-level tests drive a `RealtimeManager` through the loopback
//! transport; property tests cover the version and single-pending invariants.

pub mod common;
pub mod integration;
pub mod property;
