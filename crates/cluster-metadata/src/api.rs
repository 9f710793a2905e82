//! Metadata query API.
//!
//! Thin HTTP layer over [`MetadataQuery`]: every handler maps the query
//! outcome to a status code and records the response in [`ApiMetrics`].
//!
//! | route | handler |
//! |---|---|
//! | `GET /api/v1/tags/pod/{node}/{ns}/{pod}` | `getPodMetadata` |
//! | `GET /api/v1/tags/pod/{node}` | `getPodMetadataForNode` |
//! | `GET /api/v1/tags/pod` | `getAllMetadata` |
//! | `GET /api/v1/tags/node/{node}` | `getNodeMetadata` |

use crate::aggregator::MetadataQuery;
use crate::error::ControllerError;
use crate::metrics::ApiMetrics;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const GET_POD_METADATA: &str = "getPodMetadata";
const GET_POD_METADATA_FOR_NODE: &str = "getPodMetadataForNode";
const GET_ALL_METADATA: &str = "getAllMetadata";
const GET_NODE_METADATA: &str = "getNodeMetadata";

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    /// Metadata cache being served
    pub metadata: Arc<dyn MetadataQuery>,
    /// Request counter
    pub metrics: ApiMetrics,
}

impl ApiState {
    /// Creates handler state over `metadata`.
    pub fn new(metadata: Arc<dyn MetadataQuery>, metrics: ApiMetrics) -> Self {
        Self { metadata, metrics }
    }
}

/// Builds the API router, including `/metrics` and `/healthz`.
pub fn router(state: ApiState) -> Router {
    let tags = Router::new()
        .route("/pod", get(get_all_metadata))
        .route("/pod/{node}", get(get_pod_metadata_for_node))
        .route("/pod/{node}/{ns}/{pod}", get(get_pod_metadata))
        .route("/node/{node}", get(get_node_metadata));

    Router::new()
        .nest("/api/v1/tags", tags)
        .route("/metrics", get(get_metrics))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `router` on `listener` until `shutdown` fires, then drains
/// in-flight requests.
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<(), ControllerError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Metadata API listening on {}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("Metadata API stopped");
    Ok(())
}

fn reply(metrics: &ApiMetrics, handler: &str, status: StatusCode, body: impl IntoResponse) -> Response {
    metrics.record(handler, status);
    (status, body).into_response()
}

fn json_reply<T: Serialize>(metrics: &ApiMetrics, handler: &str, status: StatusCode, payload: &T) -> Response {
    match serde_json::to_vec(payload) {
        Ok(body) => reply(
            metrics,
            handler,
            status,
            ([(header::CONTENT_TYPE, "application/json")], body),
        ),
        Err(e) => {
            let err = ControllerError::from(e);
            error!("{}: could not encode the response: {}", handler, err);
            reply(metrics, handler, StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn collaborator_failure(metrics: &ApiMetrics, handler: &str, err: &ControllerError) -> Response {
    error!("{}: {}", handler, err);
    reply(metrics, handler, StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn get_pod_metadata(
    State(state): State<ApiState>,
    Path((node, ns, pod)): Path<(String, String, String)>,
) -> Response {
    match state.metadata.pod_tags(&node, &ns, &pod) {
        Ok(Some(tags)) if !tags.is_empty() => json_reply(&state.metrics, GET_POD_METADATA, StatusCode::OK, &tags),
        Ok(_) => reply(
            &state.metrics,
            GET_POD_METADATA,
            StatusCode::NOT_FOUND,
            format!(
                "Could not find associated metadata mapped to the pod: {}/{} on node: {}",
                ns, pod, node
            ),
        ),
        Err(e) => collaborator_failure(&state.metrics, GET_POD_METADATA, &e),
    }
}

async fn get_pod_metadata_for_node(State(state): State<ApiState>, Path(node): Path<String>) -> Response {
    match state.metadata.pods_on_node(&node) {
        Ok(node_pods) => {
            if let Some(warning) = &node_pods.warning {
                warn!("{}", warning);
            }
            json_reply(&state.metrics, GET_POD_METADATA_FOR_NODE, StatusCode::OK, &node_pods.pods)
        }
        Err(e) => collaborator_failure(&state.metrics, GET_POD_METADATA_FOR_NODE, &e),
    }
}

async fn get_all_metadata(State(state): State<ApiState>) -> Response {
    match state.metadata.all() {
        Ok(all) if all.is_partial() => {
            warn!(
                "Serving partial cluster metadata, {} nodes failed: {}",
                all.errors.len(),
                all.errors.keys().cloned().collect::<Vec<_>>().join(", ")
            );
            json_reply(&state.metrics, GET_ALL_METADATA, StatusCode::SERVICE_UNAVAILABLE, &all)
        }
        Ok(all) => json_reply(&state.metrics, GET_ALL_METADATA, StatusCode::OK, &all),
        Err(e) => collaborator_failure(&state.metrics, GET_ALL_METADATA, &e),
    }
}

async fn get_node_metadata(State(state): State<ApiState>, Path(node): Path<String>) -> Response {
    match state.metadata.node_labels(&node) {
        Ok(Some(labels)) if !labels.is_empty() => {
            json_reply(&state.metrics, GET_NODE_METADATA, StatusCode::OK, &labels)
        }
        Ok(_) => reply(
            &state.metrics,
            GET_NODE_METADATA,
            StatusCode::NOT_FOUND,
            format!("Could not find labels on the node: {}", node),
        ),
        Err(e) => collaborator_failure(&state.metrics, GET_NODE_METADATA, &e),
    }
}

async fn get_metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}
