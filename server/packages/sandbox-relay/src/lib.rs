//! Sandbox lifecycle and agent relay core.

pub mod cli;
pub mod config;
pub mod project_state;
pub mod provider;
pub mod provisioning;
pub mod registry;
pub mod relay;
pub mod router;
