//! Integration tests against the public engine API

mod conflicts;
mod offline_sync;
mod persistence;
