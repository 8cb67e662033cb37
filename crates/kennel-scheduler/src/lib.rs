//! kennel-scheduler — keeps submitted tasks moving onto the cluster.
//!
//! Each tick of the [`ControlLoop`] runs three steps in order:
//!
//! - [`Reconciler`] overwrites cached instance and task records with the
//!   cluster's descriptions
//! - [`Dispatcher`] tries to start every queued or waiting task, asking the
//!   [`AdmissionController`] for capacity and requesting an earmarked
//!   instance when there is none
//! - the autoscaler keeps the warm pool at its target size
//!
//! [`Submitter`] is the entry point for new tasks: it validates a request,
//! records the task, and enqueues a dispatch job that the queue worker hands
//! back to [`ControlLoop::handle_job`].
//!
//! # Architecture
//!
//! ```text
//! Submitter ──► StateStore ◄── Reconciler ◄── ClusterClient
//!     │             ▲                              ▲
//!     ▼             │                              │
//!  JobQueue ──► ControlLoop ──► Dispatcher ────────┤
//!                   │              ├── AdmissionController
//!                   │              └── Provisioner ┤
//!                   └─────────► Autoscaler ────────┘
//! ```

pub mod admission;
pub mod control_loop;
pub mod dispatcher;
pub mod error;
pub mod reconciler;
pub mod submit;

pub use admission::{AdmissionController, Requirements};
pub use control_loop::{ControlLoop, TickReport};
pub use dispatcher::{DispatchOutcome, DispatchReport, Dispatcher};
pub use error::{SchedulerError, SchedulerResult};
pub use reconciler::{ReconcileReport, Reconciler};
pub use submit::{STARTED_BY, Submission, Submitter, TaskRequest, initial_schedule};
