//! roomgate: on-demand sandbox containers behind dynamically published
//! nginx routes.
//!
//! A session asks for a route; the [`orchestrator::AllocationRegistry`]
//! hands out a warm container from the [`orchestrator::PoolManager`] (or
//! launches one), the [`proxy::RoutePublisher`] makes it reachable, and the
//! [`orchestrator::Reaper`] retires it once heartbeats stop.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod naming;
pub mod orchestrator;
pub mod proxy;
pub mod runtime;
pub mod store;

pub use config::ControllerConfig;
