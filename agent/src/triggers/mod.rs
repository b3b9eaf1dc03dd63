//! Deployment trigger sources

pub mod poll;
pub mod webhook;
