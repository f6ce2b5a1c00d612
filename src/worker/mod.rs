//! Job execution against routers and hosts.
//!
//! - [`JobExecutor`]: routes a dispatched job to its path and reports the outcome
//! - [`quick`]: tag-isolated verdict engine
//! - [`detailed`]: exclusive-lock forward chain measurement
//! - [`hosts`]: create-then-lease and release-then-destroy for shared hosts
//!   and neighbor bindings
//! - [`reconciler`]: periodic sweep of dead or expired registry entries
//!
//! # Cleanup
//!
//! Both paths run their cleanup whether the job succeeded, failed or was
//! cancelled. Cleanup never raises: anything it cannot remove is logged and
//! the job is flagged with lingering artifacts for the reconciler to catch.

pub mod detailed;
pub mod executor;
pub mod hosts;
pub mod quick;
pub mod reconciler;

pub use executor::{JobExecutor, WorkerContext};
pub use hosts::SharedHosts;
pub use reconciler::{ReconcileSummary, Reconciler};
