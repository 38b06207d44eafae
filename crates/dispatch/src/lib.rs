//! Container dispatch for Cairn.
//!
//! A dispatcher polls the control plane's container queue, locks queued
//! work, and keeps exactly one runner per container across a fleet of
//! dispatchers. Runners receive container record updates through a
//! single-slot mailbox that coalesces intermediate states when they fall
//! behind.

pub mod api;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod throttle;
pub mod tracker;

pub use api::{Authorization, Container, ContainerPage, ContainerState, ControlPlane, Filter};
pub use client::RestControlPlane;
pub use dispatcher::{Dispatcher, RunnerFn};
pub use error::{Error, Result};
pub use throttle::Throttle;
pub use tracker::RunTracker;
