//! Sandbox instance lifecycle: provisioning, setup, launch, reconciliation.

pub mod manager;

pub use manager::{build_prompt, CollectedResult, SpawnOptions, SwarmManager};
