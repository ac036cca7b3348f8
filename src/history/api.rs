//! HTTP surface for the workflow history
//!
//! - `GET /v1/workflow/history`: filtered, sorted, paginated instances
//! - `GET /v1/workflow/history/{id}`: one instance with its task graph
//! - `GET /metrics`: Prometheus text exposition
//! - `GET /health`: liveness and bus connectivity
//!
//! With an engine attached, the workflow control routes of
//! [`crate::workflow::api`] are served too.

use super::{HistoryError, HistoryQuery, HistoryStore};
use crate::error::sanitize_error_message;
use crate::observability::metrics::metrics;
use crate::workflow::WorkflowEngine;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::Filter;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    agent: String,
    bus_connected: bool,
    uptime_seconds: u64,
}

pub(crate) fn error_reply(status: StatusCode, error: impl ToString) -> Response {
    warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            error: sanitize_error_message(&error.to_string()),
        }),
        status,
    )
    .into_response()
}

fn history_error_reply(e: HistoryError) -> Response {
    match e {
        HistoryError::InvalidQuery(_) => error_reply(StatusCode::BAD_REQUEST, e),
        other => {
            tracing::error!(error = %other, "History query failed");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, other)
        }
    }
}

async fn list_history(
    store: Arc<dyn HistoryStore>,
    params: HashMap<String, String>,
) -> Result<Response, Infallible> {
    let query = match HistoryQuery::from_params(&params) {
        Ok(query) => query,
        Err(e) => return Ok(history_error_reply(e)),
    };
    Ok(match store.query(&query).await {
        Ok(page) => warp::reply::json(&page).into_response(),
        Err(e) => history_error_reply(e),
    })
}

async fn get_history(store: Arc<dyn HistoryStore>, id: String) -> Result<Response, Infallible> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            format!("'{id}' is not a valid instance id"),
        ));
    };
    Ok(match store.get_one(id, true).await {
        Ok(Some(record)) => warp::reply::json(&record).into_response(),
        Ok(None) => error_reply(StatusCode::NOT_FOUND, format!("Instance {id} not found")),
        Err(e) => history_error_reply(e),
    })
}

/// History query server
pub struct HistoryServer {
    agent_name: String,
    port: u16,
    store: Arc<dyn HistoryStore>,
    engine: Option<WorkflowEngine>,
}

impl HistoryServer {
    pub fn new(agent_name: &str, port: u16, store: Arc<dyn HistoryStore>) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            port,
            store,
            engine: None,
        }
    }

    /// Also serve instance, template and registry control
    pub fn with_engine(mut self, engine: WorkflowEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, without binding a socket
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone + Send + Sync + 'static
    {
        let list_store = self.store.clone();
        let list_route = warp::path!("v1" / "workflow" / "history")
            .and(warp::get())
            .and(warp::query::<HashMap<String, String>>())
            .and_then(move |params| list_history(list_store.clone(), params));

        let get_store = self.store.clone();
        let get_route = warp::path!("v1" / "workflow" / "history" / String)
            .and(warp::get())
            .and_then(move |id| get_history(get_store.clone(), id));

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async move {
                let body = metrics().get_metrics().to_prometheus();
                Ok::<_, Infallible>(warp::reply::with_header(
                    body,
                    "content-type",
                    "text/plain; version=0.0.4",
                ))
            });

        let agent_name = self.agent_name.clone();
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let agent = agent_name.clone();
                async move {
                    let snapshot = metrics().get_metrics();
                    let response = HealthResponse {
                        status: if snapshot.transport.connected {
                            "healthy"
                        } else {
                            "degraded"
                        },
                        agent,
                        bus_connected: snapshot.transport.connected,
                        uptime_seconds: snapshot.uptime_seconds,
                    };
                    Ok::<_, Infallible>(warp::reply::json(&response))
                }
            });

        list_route
            .or(get_route)
            .or(metrics_route)
            .or(health_route)
            .or(crate::workflow::api::routes(self.engine.clone()))
            .with(
                warp::cors()
                    .allow_any_origin()
                    .allow_methods(["GET", "PUT", "DELETE"]),
            )
    }

    /// Serve until the future is dropped
    pub async fn run(self) {
        tracing::info!(port = self.port, "Starting history API server");
        warp::serve(self.routes()).run(([0, 0, 0, 0], self.port)).await;
    }
}
