//! kennel-api — REST API for Kennel.
//!
//! Provides axum route handlers for submitting tasks and inspecting the
//! scheduler's cached task and instance records.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Liveness banner |
//! | POST | `/api/v1/tasks` | Submit a task (202, or 400 on validation failure) |
//! | GET | `/api/v1/tasks/{id}` | Get a task record |
//! | GET | `/api/v1/instances` | List cached instance records |
//! | POST | `/api/v1/cluster/resize` | Enqueue an immediate autoscale pass (202) |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use kennel_queue::JobQueue;
use kennel_scheduler::Submitter;
use kennel_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub queue: JobQueue,
    pub submitter: Submitter,
}

/// Build the complete API router.
pub fn build_router(store: StateStore, queue: JobQueue, submitter: Submitter) -> Router {
    let api_state = ApiState {
        store,
        queue,
        submitter,
    };

    let api_routes = Router::new()
        .route("/tasks", post(handlers::submit_task))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/instances", get(handlers::list_instances))
        .route("/cluster/resize", post(handlers::resize_cluster))
        .with_state(api_state);

    Router::new()
        .route("/", get(handlers::banner))
        .nest("/api/v1", api_routes)
}
