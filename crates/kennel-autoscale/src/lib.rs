//! kennel-autoscale — keeps a warm pool of idle cluster instances.
//!
//! Reads the cached instance records from the state store, counts the
//! joined instances that are currently idle, and either launches new
//! instances or retires the longest-idle ones.
//!
//! # Sizing Algorithm
//!
//! ```text
//! idle = active instances with idle_since set, oldest first
//! warm = autoscale.warm_instances
//!
//! if |idle| < warm:
//!     if no launch marker or now - marker > launch_timeout:
//!         launch (warm - |idle|) instances
//!         marker = now
//!
//! if |idle| > warm:
//!     for each instance in idle whose idle age > idle_timeout,
//!     up to (|idle| - warm) of them:
//!         deregister + terminate
//! ```
//!
//! The launch marker is a backoff window: while a batch is still joining
//! the cluster it does not count as idle yet, so a second batch would
//! over-provision.
//!
//! [`Provisioner`] is the launch primitive shared with the dispatcher,
//! which uses it to request instances earmarked for a specific task.

pub mod provisioner;
pub mod scaler;

pub use provisioner::Provisioner;
pub use scaler::{AutoscaleConfig, Autoscaler, ResizeOutcome, ScaleDecision};
