//! Integration test suite for hive.
//!
//! These tests drive the swarm manager and git sync against an
//! in-memory sandbox fake, exercising the full instance lifecycle from
//! spawn through reconciliation, collection, and sync.
//!
//! No network calls are made; the fake scripts command results by
//! substring match, so the tests are safe to run in CI.

mod fixtures;

mod lifecycle;
mod sync;
