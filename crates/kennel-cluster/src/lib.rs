//! kennel-cluster — the control-plane contract Kennel schedules against.
//!
//! [`ClusterClient`] is the seam between the scheduler and whatever runs
//! containers: it lists and describes container instances, describes task
//! definitions and tasks, runs tasks, and launches, deregisters and
//! terminates compute instances.
//!
//! [`SimulatedCluster`] is an in-memory implementation. It backs the
//! daemon's standalone mode and every test in the workspace.

pub mod client;
pub mod error;
pub mod simulated;
pub mod types;

pub use client::{ClusterClient, describe_all_instances};
pub use error::{ClusterError, ClusterResult};
pub use simulated::{CallCounts, SimulatedCluster, SimulationConfig};
pub use types::*;
