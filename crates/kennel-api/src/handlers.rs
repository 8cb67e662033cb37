//! REST API handlers.
//!
//! Reads go straight to the `StateStore`; submissions go through the
//! `Submitter`. Every response uses the same JSON envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{debug, warn};

use kennel_queue::{Job, Priority};
use kennel_scheduler::{SchedulerError, TaskRequest};
use kennel_state::{TaskId, epoch_millis};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// GET /
pub async fn banner() -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({ "message": "HELLO? YES, THIS IS KENNEL." }))
}

// ── Tasks ──────────────────────────────────────────────────────

/// POST /api/v1/tasks
pub async fn submit_task(
    State(state): State<ApiState>,
    Json(request): Json<TaskRequest>,
) -> impl IntoResponse {
    match state.submitter.submit(request, epoch_millis()).await {
        Ok(submission) => (StatusCode::ACCEPTED, ApiResponse::ok(submission)).into_response(),
        Err(SchedulerError::Validation(msg)) => {
            debug!(error = %msg, "task request rejected");
            error_response(&msg, StatusCode::BAD_REQUEST).into_response()
        }
        Err(e) => {
            warn!(error = %e, "task submission failed");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
) -> impl IntoResponse {
    match state.store.get_task(&id) {
        Ok(Some(task)) => ApiResponse::ok(task).into_response(),
        Ok(None) => error_response("task not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_instances() {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Cluster ────────────────────────────────────────────────────

/// POST /api/v1/cluster/resize
pub async fn resize_cluster(State(state): State<ApiState>) -> impl IntoResponse {
    let saved = state
        .queue
        .create(Job::ClusterResize)
        .priority(Priority::High)
        .remove_on_complete(true)
        .save()
        .await;
    match saved {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({ "job_id": job_id })),
        )
            .into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use kennel_queue::JobQueue;
    use kennel_scheduler::Submitter;
    use kennel_state::*;

    use crate::build_router;

    fn test_router() -> (StateStore, JobQueue, axum::Router) {
        let store = StateStore::open_in_memory().unwrap();
        let queue = JobQueue::new();
        let submitter = Submitter::new(
            store.clone(),
            queue.clone(),
            "default".to_string(),
            Duration::from_secs(180),
        );
        let router = build_router(store.clone(), queue.clone(), submitter);
        (store, queue, router)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_task(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/tasks")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn banner_answers() {
        let (_, _, router) = test_router();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let resp = router.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["message"], "HELLO? YES, THIS IS KENNEL.");
    }

    #[tokio::test]
    async fn submit_then_get_task() {
        let (store, queue, router) = test_router();

        let resp = router
            .clone()
            .oneshot(post_task(serde_json::json!({
                "task_definition": "worker:1",
                "container_name": "w",
                "command": ["run"],
                "environment": { "MODE": "batch" }
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "queued");
        let id = json["data"]["task_id"].as_str().unwrap().to_string();

        let task_id: TaskId = id.parse().unwrap();
        assert!(store.is_active_task(&id).unwrap());
        assert_eq!(queue.len().await, 1);

        let req = Request::builder()
            .uri(format!("/api/v1/tasks/{task_id}"))
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["launch_spec"]["environment"]["MODE"], "batch");
    }

    #[tokio::test]
    async fn invalid_submission_is_bad_request() {
        let (store, _, router) = test_router();

        let resp = router
            .oneshot(post_task(serde_json::json!({
                "task_definition": "worker:1",
                "container_name": "w"
            })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("command"));
        assert!(store.list_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let (_, _, router) = test_router();
        let req = Request::builder()
            .uri(format!("/api/v1/tasks/{}", TaskId::new_v4()))
            .body(Body::empty())
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn instances_are_listed() {
        let (store, _, router) = test_router();
        store
            .register_pending_instance(&InstanceRecord::pending("i-1", 0, None))
            .unwrap();
        let req = Request::builder()
            .uri("/api/v1/instances")
            .body(Body::empty())
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"][0]["instance_id"], "i-1");
    }

    #[tokio::test]
    async fn resize_enqueues_job() {
        let (_, queue, router) = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/cluster/resize")
            .body(Body::empty())
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let job = queue.try_next().await.unwrap();
        assert_eq!(job.job, Job::ClusterResize);
        assert_eq!(job.priority, Priority::High);
    }

    #[tokio::test]
    async fn resize_on_closed_queue_is_unavailable() {
        let (_, queue, router) = test_router();
        queue.close().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/cluster/resize")
            .body(Body::empty())
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
