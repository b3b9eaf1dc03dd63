//! Progressive (canary) delivery

pub mod backend;
pub mod config;
pub mod controller;
pub mod fsm;
pub mod metrics;
pub mod rollout;

pub use controller::CanaryController;
