//! Shared application state and the request-user extractor
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;

use envdeploy_core::config::Deployable;
use envdeploy_core::users::{AdminSet, User};

use crate::supervisor::Supervisor;
use crate::templates::Templates;

/// Deployables configuration, re-read from disk on every access in debug
/// mode, matching `getDeployables()` in the reference implementation
pub struct DeployablesStore {
    path: PathBuf,
    debug: bool,
    inner: RwLock<Vec<Deployable>>,
}

impl DeployablesStore {
    pub fn load(path: PathBuf, debug: bool) -> anyhow::Result<Self> {
        let initial = envdeploy_core::config::read_deployables(&path)?;
        Ok(Self {
            path,
            debug,
            inner: RwLock::new(initial),
        })
    }

    pub fn current(&self) -> Vec<Deployable> {
        if self.debug {
            match envdeploy_core::config::read_deployables(&self.path) {
                Ok(fresh) => *self.inner.write().unwrap() = fresh,
                Err(e) => log::warn!("error reading {}: {e}", self.path.display()),
            }
        }
        self.inner.read().unwrap().clone()
    }
}

#[derive(Clone)]
pub struct AppState(pub Arc<Inner>);

pub struct Inner {
    pub supervisor: Supervisor,
    pub deployables: DeployablesStore,
    pub admins: AdminSet,
    pub mock_user: Option<User>,
    pub base_path: String,
    pub templates: Templates,
    pub static_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl FromRef<AppState> for AppState {
    fn from_ref(state: &AppState) -> Self {
        state.clone()
    }
}

/// The already-authenticated caller, identified the same way the reference
/// implementation does: a `--mockuser` override for local testing, falling
/// back to the `X-Forwarded-User` header an upstream auth proxy is expected
/// to set
pub struct RequestUser(pub User);

impl FromRequestParts<AppState> for RequestUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = if let Some(mock) = &state.0.mock_user {
            mock.clone()
        } else {
            let header = parts
                .headers
                .get("X-Forwarded-User")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            User::new(header)
        };

        if user.is_empty() {
            return Err((StatusCode::FORBIDDEN, "forbidden"));
        }

        Ok(RequestUser(user))
    }
}
