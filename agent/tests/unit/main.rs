//! Integration tests for the pull agent

mod fakes;
mod test_canary;
mod test_orchestrator;
mod test_persistence;
