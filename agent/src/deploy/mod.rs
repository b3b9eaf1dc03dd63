//! Deployment module

pub mod command;
pub mod docker;
pub mod git;
pub mod health;
pub mod orchestrator;
pub mod rollback;

pub use orchestrator::{DeployRequest, Orchestrator, TriggerOutcome};
