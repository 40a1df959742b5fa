pub mod cleanup;
pub mod commands;
pub mod config;
pub mod distribute;
pub mod error;
pub mod gitsync;
pub mod instance;
pub mod log;
pub mod sandbox;
pub mod state;
pub mod swarm;
pub mod tasks;

pub use error::{Error, Result};
pub use instance::{GitOptions, InstanceStatus, SourceType, SwarmInstance};
pub use state::{StateStore, SwarmState};
pub use tasks::{Task, TaskStatus};
