//! kennel-queue — delayed, prioritized work items for the scheduler.
//!
//! Jobs are a closed set ([`Job`]): dispatching one task, or resizing the
//! cluster. A job is saved with an optional delay and a priority; the worker
//! loop ([`JobQueue::process`]) hands due jobs to a handler, highest
//! priority first, then FIFO. A delayed job competes once its delay elapses.
//!
//! Delivery is at-least-once from the handler's point of view, so handlers
//! must be idempotent.

pub mod error;
pub mod job;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use job::{Job, Priority};
pub use queue::{JobBuilder, JobId, JobQueue, QueuedJob};
