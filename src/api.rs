//! HTTP control surface: the only external mutation path.
//!
//! Responses are plain text except `/job`, which returns the job record
//! as JSON. `/job` reads the local store and may therefore be stale on
//! followers; every mutation funnels through the replicated log on the
//! leader.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::consensus::command::{self, LogEvent};
use crate::consensus::RaftNode;
use crate::error::CoordError;
use crate::store::{Job, JobStatus, JobStore};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<JobStore>,
    pub raft: Arc<RaftNode>,
    pub cluster_size: u32,
    pub apply_timeout: std::time::Duration,
}

/// Fields a client may supply when submitting a parent job. Everything
/// else on the job record is derived.
#[derive(Debug, Deserialize)]
struct SubmitRequest {
    id: String,
    #[serde(rename = "type")]
    job_type: String,
}

/// Partial job update; absent fields keep their stored values.
#[derive(Debug, Deserialize)]
struct UpdateRequest {
    id: String,
    status: Option<JobStatus>,
    result_url: Option<String>,
    started_at: Option<i64>,
    updated_at: Option<i64>,
    retry_count: Option<u32>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/submit", post(submit_handler))
        .route("/update", post(update_handler))
        .route("/job", get(job_handler))
        .route("/join", get(join_handler))
        .with_state(state)
}

/// Serve the control API until the shutdown token fires.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "starting control api");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Map a `CoordError` onto the HTTP surface: unknown jobs are client
/// errors, everything else (leadership, timeout, replication) is a 500
/// carrying the error class in the body.
fn error_response(err: CoordError) -> Response {
    let status = match &err {
        CoordError::JobNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

async fn submit_handler(State(state): State<ApiState>, body: String) -> Response {
    let request: SubmitRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad request: {e}")).into_response(),
    };
    if request.id.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing job id".to_string()).into_response();
    }

    let parent = Job {
        id: request.id.clone(),
        job_type: request.job_type,
        status: JobStatus::Pending,
        worker_id: String::new(),
        result_url: String::new(),
        started_at: 0,
        updated_at: 0,
        retry_count: 0,
    };
    let event = LogEvent::SubmitParent {
        job_id: request.id.clone(),
        job: Some(parent),
        cluster_size: state.cluster_size,
    };
    let data = match command::encode(&event) {
        Ok(data) => data,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("encode error: {e}"),
            )
                .into_response()
        }
    };

    match state.raft.apply(data, state.apply_timeout).await {
        Ok(_) => (
            StatusCode::OK,
            format!(
                "Parent job {} split into {} sub-jobs",
                request.id, state.cluster_size
            ),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn update_handler(State(state): State<ApiState>, body: String) -> Response {
    let request: UpdateRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad request: {e}")).into_response(),
    };

    // Read-merge-enqueue: overlay the supplied fields on the stored job.
    // Two racing updates are serialized by the log; the last one wins.
    let Some(mut job) = state.store.get(&request.id) else {
        return error_response(CoordError::JobNotFound(request.id));
    };
    if let Some(status) = request.status {
        job.status = status;
    }
    if let Some(result_url) = request.result_url {
        if !result_url.is_empty() {
            job.result_url = result_url;
        }
    }
    if let Some(started_at) = request.started_at {
        job.started_at = started_at;
    }
    if let Some(updated_at) = request.updated_at {
        job.updated_at = updated_at;
    }
    if let Some(retry_count) = request.retry_count {
        job.retry_count = retry_count;
    }

    let event = LogEvent::SetJob {
        job_id: job.id.clone(),
        job: Some(job),
    };
    let data = match command::encode(&event) {
        Ok(data) => data,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("encode error: {e}"),
            )
                .into_response()
        }
    };

    match state.raft.apply(data, state.apply_timeout).await {
        Ok(_) => (StatusCode::OK, "Job updated successfully".to_string()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn job_handler(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("id") else {
        return (StatusCode::BAD_REQUEST, "missing id parameter".to_string()).into_response();
    };
    match state.store.get(id) {
        Some(job) => Json(job).into_response(),
        None => error_response(CoordError::JobNotFound(id.clone())),
    }
}

async fn join_handler(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(node_id), Some(raft_addr)) = (params.get("nodeID"), params.get("raftAddr")) else {
        return (
            StatusCode::BAD_REQUEST,
            "missing nodeID or raftAddr".to_string(),
        )
            .into_response();
    };

    tracing::info!(node_id = %node_id, raft_addr = %raft_addr, "received join request");

    match state
        .raft
        .add_voter(node_id, raft_addr, state.apply_timeout)
        .await
    {
        Ok(()) => (StatusCode::OK, "Node joined successfully".to_string()).into_response(),
        Err(e) => error_response(e),
    }
}
