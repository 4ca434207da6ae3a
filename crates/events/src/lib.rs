//! Deployment lifecycle events
//!
//! This crate provides the event bus and the event types published while
//! deployments move through their phases.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
