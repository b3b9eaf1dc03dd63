//! Pull Agent Library
//!
//! Pull-based deployment agent: keeps a Docker Compose application in sync
//! with a git branch, rolls back failed deployments and drives canary
//! rollouts.

pub mod app;
pub mod authn;
pub mod canary;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod notify;
pub mod server;
pub mod storage;
pub mod triggers;
pub mod utils;
pub mod workers;
