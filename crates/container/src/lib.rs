//! In-process dependency scheduler.
//!
//! Services are installed under a [`ServiceName`](deploy_core::ServiceName)
//! with declared dependencies and an optional parent. The container starts a
//! service once its mode is [`Mode::Active`], every dependency is
//! [`ServiceState::Up`] and its parent is up; it stops dependents and children
//! before the services they rely on. Start and stop callbacks run on spawned
//! tokio tasks.
//!
//! - [`ServiceContainer`] - the registry and scheduler
//! - [`Service`] - start/stop callbacks implemented by scheduled work
//! - [`ServiceBuilder`] / [`ServiceTarget`] - installation
//! - [`StartContext`] / [`StopContext`] - what a callback sees

mod builder;
mod container;
mod error;
mod service;
mod state;

pub use builder::{ServiceBuilder, ServiceTarget};
pub use container::{ServiceContainer, ServiceSnapshot};
pub use error::{ContainerError, Result};
pub use service::{Service, ServiceValue, StartContext, StartError, StopContext};
pub use state::{Mode, ServiceState};
