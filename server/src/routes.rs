//! HTTP route handlers
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Form, OriginalUri, Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use envdeploy_core::users::User;

use crate::flash;
use crate::gateway;
use crate::state::{AppState, Inner, RequestUser};

pub fn router(state: AppState) -> Router {
    let base_path = state.0.base_path.clone();

    let inner = Router::new()
        .route("/", get(list_jobs))
        .route("/deploy/:id", post(deploy))
        .route("/jobs/:id", get(job_detail))
        .route("/jobs/:id/log", get(job_log))
        .route("/jobs/:id/kill", post(job_kill))
        .route("/jobs/:id/remove", post(job_remove))
        .route("/enter/:id/*rest", get(gateway_entry).post(gateway_entry).put(gateway_entry)
            .delete(gateway_entry).patch(gateway_entry).head(gateway_entry))
        .nest_service("/static", ServeDir::new(state.0.static_dir.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if base_path.is_empty() {
        inner
    } else {
        Router::new().nest(&base_path, inner)
    }
}

fn link(state: &Inner, path: &str) -> String {
    format!("{}{}", state.base_path, path)
}

async fn list_jobs(State(state): State<AppState>, user: RequestUser, jar: CookieJar) -> Response {
    let (jar, flash_messages) = flash::take(jar);
    let state = &state.0;

    #[derive(serde::Serialize)]
    struct JobInfo {
        id: String,
        owner: String,
        running: bool,
    }

    let jobs: Vec<JobInfo> = state
        .supervisor
        .registry()
        .snapshot()
        .into_iter()
        .filter(|job| state.admins.can_access_job(&user.0, &job.owner))
        .map(|job| JobInfo {
            id: job.id.clone(),
            owner: job.owner.as_str().to_string(),
            running: job.is_started() && !job.is_finished(),
        })
        .collect();

    let mut ctx = tera::Context::new();
    ctx.insert("flash_messages", &flash_messages);
    ctx.insert("jobs", &jobs);
    ctx.insert("deployables", &state.deployables.current());

    render(state, "list", &ctx, jar)
}

#[derive(Deserialize)]
struct KillForm {
    signal: i32,
}

async fn deploy(
    State(state): State<AppState>,
    user: RequestUser,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Response {
    let inner = &state.0;
    let Some(deployable) = envdeploy_core::config::find(&inner.deployables.current(), &id).cloned() else {
        return (StatusCode::NOT_FOUND, "environment not found").into_response();
    };

    let owner = user.0.clone();
    let supervisor = inner.supervisor.clone();
    let result =
        tokio::task::spawn_blocking(move || supervisor.deploy(&deployable, owner)).await;

    match result {
        Ok(Ok(job)) => {
            let jar = flash::set_one(jar, "success", "Deployment successful");
            (jar, Redirect::to(&link(inner, &format!("/jobs/{}", job.id)))).into_response()
        }
        Ok(Err(e)) => {
            let jar = flash::set_one(jar, "error", e.to_string());
            (jar, Redirect::to(&link(inner, "/"))).into_response()
        }
        Err(e) => {
            log::error!("deploy task panicked: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

async fn job_detail(
    State(state): State<AppState>,
    user: RequestUser,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Response {
    let inner = &state.0;
    let Some(job) = inner.supervisor.registry().lookup(&id) else {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    };
    if !inner.admins.can_access_job(&user.0, &job.owner) {
        return forbidden();
    }

    let (jar, flash_messages) = flash::take(jar);

    #[derive(serde::Serialize)]
    struct JobView {
        id: String,
        owner: String,
        running: bool,
        finished: bool,
    }

    let mut ctx = tera::Context::new();
    ctx.insert("flash_messages", &flash_messages);
    ctx.insert(
        "job",
        &JobView {
            id: job.id.clone(),
            owner: job.owner.as_str().to_string(),
            running: job.is_started() && !job.is_finished(),
            finished: job.is_finished(),
        },
    );

    render(inner, "job_detail", &ctx, jar)
}

async fn job_log(State(state): State<AppState>, user: RequestUser, Path(id): Path<String>) -> Response {
    let inner = &state.0;
    let Some(job) = inner.supervisor.registry().lookup(&id) else {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    };
    if !inner.admins.can_access_job(&user.0, &job.owner) {
        return forbidden();
    }

    match tokio::fs::read(&job.stderr_path).await {
        Ok(contents) => (
            [("content-type", "text/plain; charset=utf-8")],
            contents,
        )
            .into_response(),
        Err(e) => (StatusCode::NOT_FOUND, format!("could not read job log: {e}")).into_response(),
    }
}

async fn job_kill(
    State(state): State<AppState>,
    user: RequestUser,
    jar: CookieJar,
    Path(id): Path<String>,
    Form(form): Form<KillForm>,
) -> Response {
    let inner = &state.0;
    let Some(job) = inner.supervisor.registry().lookup(&id) else {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    };
    if !inner.admins.can_access_job(&user.0, &job.owner) {
        return forbidden();
    }

    let Some(signal) = nix::sys::signal::Signal::try_from(form.signal).ok() else {
        return (StatusCode::BAD_REQUEST, "unrecognized signal number").into_response();
    };

    let jar = match inner.supervisor.send_signal(&job, signal) {
        Ok(()) => flash::set_one(jar, "success", format!("Job {} was sent signal {}", job.id, form.signal)),
        Err(e) => flash::set_one(jar, "error", format!("could not signal job: {e}")),
    };

    (jar, Redirect::to(&link(inner, &format!("/jobs/{}", job.id)))).into_response()
}

async fn job_remove(
    State(state): State<AppState>,
    user: RequestUser,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Response {
    let inner = &state.0;
    let Some(job) = inner.supervisor.registry().lookup(&id) else {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    };
    if !inner.admins.can_access_job(&user.0, &job.owner) {
        return forbidden();
    }

    match inner.supervisor.remove(&job.id) {
        Ok(()) => {
            let jar = flash::set_one(jar, "success", format!("Job {} removed", job.id));
            (jar, Redirect::to(&link(inner, "/"))).into_response()
        }
        Err(e) => {
            let jar = flash::set_one(jar, "error", format!("Job {} could not be removed: {e}", job.id));
            (jar, Redirect::to(&link(inner, &format!("/jobs/{}", job.id)))).into_response()
        }
    }
}

async fn gateway_entry(
    State(state): State<AppState>,
    user: RequestUser,
    Path((id, _rest)): Path<(String, String)>,
    OriginalUri(original_uri): OriginalUri,
    req: Request<Body>,
) -> Response {
    let inner = &state.0;
    let Some(job) = inner.supervisor.registry().lookup(&id) else {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    };
    if !inner.admins.can_access_job(&user.0, &job.owner) {
        return forbidden();
    }

    let mut req = req;
    *req.uri_mut() = original_uri;

    gateway::proxy(&job, req).await.into_response()
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        "forbidden. you are not the job owner, neither are you an administrator",
    )
        .into_response()
}

fn render(state: &Inner, name: &str, ctx: &tera::Context, jar: CookieJar) -> Response {
    match state.templates.render(&format!("{name}.html"), ctx) {
        Ok(body) => (jar, axum::response::Html(body)).into_response(),
        Err(e) => {
            log::warn!("executing template {name}: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}
