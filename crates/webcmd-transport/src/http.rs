//! HTTP request surface.
//!
//! Routes:
//! - `GET /events` - agent WebSocket upgrade
//! - `GET /node/{node}/cmd/{cmd}?args=..&timeout=..` - run on one node
//! - `GET /cmd/{cmd}?args=..&timeout=..` - broadcast, first answer wins
//! - `GET /nodes` - connected node identities

use std::{future::Future, net::SocketAddr};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use webcmd_broker::{BrokerHandle, CommandError};
use webcmd_core::CommandResult;

use crate::websocket::events_handler;

const CONTENT_TYPE: &str = "text/plain;charset=utf-8";

/// Query parameters of a command request.
#[derive(Debug, Default, Deserialize)]
pub struct CommandQuery {
    /// Whitespace separated arguments.
    #[serde(default)]
    pub args: Option<String>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl CommandQuery {
    fn split_args(&self) -> Vec<String> {
        self.args
            .as_deref()
            .map(|args| args.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Build the broker's router.
#[must_use]
pub fn router(broker: BrokerHandle) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .route("/node/{node}/cmd/{cmd}", get(node_command))
        .route("/cmd/{cmd}", get(broadcast_command))
        .route("/nodes", get(list_nodes))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Serve the router on `listener` until `shutdown` resolves.
///
/// # Errors
/// Returns error if the server fails.
pub async fn serve<F>(listener: TcpListener, broker: BrokerHandle, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(broker).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn node_command(
    State(broker): State<BrokerHandle>,
    Path((node, cmd)): Path<(String, String)>,
    Query(query): Query<CommandQuery>,
) -> Response {
    run(&broker, node, cmd, &query).await
}

async fn broadcast_command(
    State(broker): State<BrokerHandle>,
    Path(cmd): Path<String>,
    Query(query): Query<CommandQuery>,
) -> Response {
    run(&broker, String::new(), cmd, &query).await
}

async fn list_nodes(State(broker): State<BrokerHandle>) -> Response {
    match broker.nodes().await {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn run(broker: &BrokerHandle, node: String, cmd: String, query: &CommandQuery) -> Response {
    let pending = match broker
        .send_command(node, cmd, query.split_args(), query.timeout)
        .await
    {
        Ok(pending) => pending,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };
    let id = pending.id().to_string();

    let outcome = pending.wait().await;
    if let Err(e) = &outcome {
        tracing::warn!(%id, "No result: {e}");
    }
    outcome_response(outcome)
}

fn outcome_response(outcome: Result<CommandResult, CommandError>) -> Response {
    match outcome {
        Ok(result) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], result.data).into_response(),
        Err(e) => {
            let status = match e {
                CommandError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
                CommandError::NodeNotFound(_) | CommandError::NoNodesConnected => StatusCode::NOT_FOUND,
                CommandError::DuplicateId(_) => StatusCode::CONFLICT,
                CommandError::BrokerClosed => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, [(header::CONTENT_TYPE, CONTENT_TYPE)], e.to_string()).into_response()
        }
    }
}
