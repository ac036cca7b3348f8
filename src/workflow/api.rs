//! HTTP control surface of the workflow engine
//!
//! Mounted next to the history routes when the server has an engine:
//!
//! - `GET|PUT /v1/workflow/instances`, `GET|DELETE /v1/workflow/instances/{id}`
//! - `GET|PUT /v1/workflow/templates`, `GET|DELETE /v1/workflow/templates/{id}`
//! - `GET|PUT /v1/workflow/regexes`, `GET|DELETE /v1/workflow/regexes/{id}`
//! - `GET|PUT /v1/workflow/lookups`, `GET|DELETE /v1/workflow/lookups/{id}`

use super::{EngineError, WorkflowEngine, WorkflowTemplate};
use crate::history::api::error_reply;
use crate::protocol::Payload;
use crate::rules::{LookupEntry, RegexEntry};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::Filter;

/// Body of `PUT /v1/workflow/instances`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInstance {
    /// Template id
    pub id: String,
    #[serde(default)]
    pub inputs: Payload,
}

fn engine_error_reply(e: EngineError) -> Response {
    let status = match &e {
        EngineError::UnknownTemplate(_) | EngineError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        EngineError::Validation(_) | EngineError::Registry(_) => StatusCode::BAD_REQUEST,
        EngineError::AlreadyTerminal(_) => StatusCode::CONFLICT,
        EngineError::History(_) | EngineError::Stopped => {
            tracing::error!(error = %e, "Workflow request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_reply(status, e)
}

fn json_or_404<T: Serialize>(found: Result<Option<T>, EngineError>, what: &str) -> Response {
    match found {
        Ok(Some(value)) => warp::reply::json(&value).into_response(),
        Ok(None) => error_reply(StatusCode::NOT_FOUND, format!("{what} not found")),
        Err(e) => engine_error_reply(e),
    }
}

fn json_or_error<T: Serialize>(result: Result<T, EngineError>) -> Response {
    match result {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e) => engine_error_reply(e),
    }
}

fn parse_instance_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| {
        error_reply(
            StatusCode::BAD_REQUEST,
            format!("'{id}' is not a valid instance id"),
        )
    })
}

async fn start_instance(engine: WorkflowEngine, body: StartInstance) -> Result<Response, Infallible> {
    Ok(match engine.instantiate(&body.id, body.inputs).await {
        Ok(instance) => {
            warp::reply::with_status(warp::reply::json(&instance), StatusCode::CREATED).into_response()
        }
        Err(e) => engine_error_reply(e),
    })
}

async fn get_instance(engine: WorkflowEngine, id: String) -> Result<Response, Infallible> {
    let id = match parse_instance_id(&id) {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    Ok(json_or_404(engine.get(id).await, &format!("Instance {id}")))
}

async fn cancel_instance(engine: WorkflowEngine, id: String) -> Result<Response, Infallible> {
    let id = match parse_instance_id(&id) {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    Ok(json_or_error(engine.cancel(id).await))
}

async fn put_template(engine: WorkflowEngine, template: WorkflowTemplate) -> Result<Response, Infallible> {
    Ok(json_or_error(engine.put_template(template).await))
}

async fn put_regex(engine: WorkflowEngine, entry: RegexEntry) -> Result<Response, Infallible> {
    Ok(json_or_error(engine.put_regex(entry.clone()).await.map(|()| entry)))
}

async fn put_lookup(engine: WorkflowEngine, entry: LookupEntry) -> Result<Response, Infallible> {
    Ok(json_or_error(engine.put_lookup(entry.clone()).await.map(|()| entry)))
}

/// Workflow control routes; without an engine every request falls through
pub fn routes(engine: Option<WorkflowEngine>) -> BoxedFilter<(Response,)> {
    let Some(engine) = engine else {
        return warp::any()
            .and_then(|| async { Err::<Response, _>(warp::reject::not_found()) })
            .boxed();
    };
    let with_engine = warp::any().map(move || engine.clone());

    let list_instances = warp::path!("v1" / "workflow" / "instances")
        .and(warp::get())
        .and(with_engine.clone())
        .and_then(|engine: WorkflowEngine| async move {
            Ok::<_, Infallible>(json_or_error(engine.active().await))
        });
    let start = warp::path!("v1" / "workflow" / "instances")
        .and(warp::put())
        .and(with_engine.clone())
        .and(warp::body::json())
        .and_then(start_instance);
    let get_one = warp::path!("v1" / "workflow" / "instances" / String)
        .and(warp::get())
        .and(with_engine.clone())
        .and_then(|id, engine| get_instance(engine, id));
    let cancel = warp::path!("v1" / "workflow" / "instances" / String)
        .and(warp::delete())
        .and(with_engine.clone())
        .and_then(|id, engine| cancel_instance(engine, id));

    let list_templates = warp::path!("v1" / "workflow" / "templates")
        .and(warp::get())
        .and(with_engine.clone())
        .and_then(|engine: WorkflowEngine| async move {
            Ok::<_, Infallible>(json_or_error(engine.templates().await))
        });
    let upsert_template = warp::path!("v1" / "workflow" / "templates")
        .and(warp::put())
        .and(with_engine.clone())
        .and(warp::body::json())
        .and_then(put_template);
    let get_template = warp::path!("v1" / "workflow" / "templates" / String)
        .and(warp::get())
        .and(with_engine.clone())
        .and_then(|id: String, engine: WorkflowEngine| async move {
            Ok::<_, Infallible>(json_or_404(engine.template(&id).await, &format!("Template '{id}'")))
        });
    let delete_template = warp::path!("v1" / "workflow" / "templates" / String)
        .and(warp::delete())
        .and(with_engine.clone())
        .and_then(|id: String, engine: WorkflowEngine| async move {
            Ok::<_, Infallible>(json_or_404(engine.remove_template(&id).await, &format!("Template '{id}'")))
        });

    let list_regexes = warp::path!("v1" / "workflow" / "regexes")
        .and(warp::get())
        .and(with_engine.clone())
        .and_then(|engine: WorkflowEngine| async move {
            Ok::<_, Infallible>(json_or_error(engine.registry().await.map(|registry| registry.regexes())))
        });
    let upsert_regex = warp::path!("v1" / "workflow" / "regexes")
        .and(warp::put())
        .and(with_engine.clone())
        .and(warp::body::json())
        .and_then(put_regex);
    let get_regex = warp::path!("v1" / "workflow" / "regexes" / String)
        .and(warp::get())
        .and(with_engine.clone())
        .and_then(|id: String, engine: WorkflowEngine| async move {
            let found = engine
                .registry()
                .await
                .map(|registry| registry.regex(&id).cloned());
            Ok::<_, Infallible>(json_or_404(found, &format!("Regex '{id}'")))
        });
    let delete_regex = warp::path!("v1" / "workflow" / "regexes" / String)
        .and(warp::delete())
        .and(with_engine.clone())
        .and_then(|id: String, engine: WorkflowEngine| async move {
            Ok::<_, Infallible>(json_or_404(engine.remove_regex(&id).await, &format!("Regex '{id}'")))
        });

    let list_lookups = warp::path!("v1" / "workflow" / "lookups")
        .and(warp::get())
        .and(with_engine.clone())
        .and_then(|engine: WorkflowEngine| async move {
            Ok::<_, Infallible>(json_or_error(engine.registry().await.map(|registry| registry.lookups())))
        });
    let upsert_lookup = warp::path!("v1" / "workflow" / "lookups")
        .and(warp::put())
        .and(with_engine.clone())
        .and(warp::body::json())
        .and_then(put_lookup);
    let get_lookup = warp::path!("v1" / "workflow" / "lookups" / String)
        .and(warp::get())
        .and(with_engine.clone())
        .and_then(|id: String, engine: WorkflowEngine| async move {
            let found = engine
                .registry()
                .await
                .map(|registry| registry.lookup(&id).cloned());
            Ok::<_, Infallible>(json_or_404(found, &format!("Lookup '{id}'")))
        });
    let delete_lookup = warp::path!("v1" / "workflow" / "lookups" / String)
        .and(warp::delete())
        .and(with_engine)
        .and_then(|id: String, engine: WorkflowEngine| async move {
            Ok::<_, Infallible>(json_or_404(engine.remove_lookup(&id).await, &format!("Lookup '{id}'")))
        });

    let instances = list_instances
        .or(start)
        .unify()
        .or(get_one)
        .unify()
        .or(cancel)
        .unify();
    let templates = list_templates
        .or(upsert_template)
        .unify()
        .or(get_template)
        .unify()
        .or(delete_template)
        .unify();
    let regexes = list_regexes
        .or(upsert_regex)
        .unify()
        .or(get_regex)
        .unify()
        .or(delete_regex)
        .unify();
    let lookups = list_lookups
        .or(upsert_lookup)
        .unify()
        .or(get_lookup)
        .unify()
        .or(delete_lookup)
        .unify();

    instances
        .or(templates)
        .unify()
        .or(regexes)
        .unify()
        .or(lookups)
        .unify()
        .boxed()
}
