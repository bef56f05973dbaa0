//! HTTP boot service
//!
//! - `GET /boot.ipxe` chains every iPXE client to `/ipxe` with its identity
//! - `GET /ipxe` serves the matching profile's boot script, behind the
//!   boot dispatch filter
//! - `/assets/*` serves kernels and initrds from `<root>/assets`

use crate::config::{HostBootConfig, SharedState};
use crate::dispatch::{boot_dispatch, DispatchState};
use crate::error::Result;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use netboot_ipxe::{chain_script, profile_script, BootMenu, BootSelection, FileProfileStore};
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

/// State of the profile handlers
#[derive(Debug, Clone)]
pub struct BootContext {
    profiles: Arc<FileProfileStore>,
    base_url: Arc<str>,
}

impl BootContext {
    pub fn new(profiles: FileProfileStore, base_url: impl Into<String>) -> Self {
        Self {
            profiles: Arc::new(profiles),
            base_url: base_url.into().into(),
        }
    }
}

/// Router of the boot service for `config`
pub fn router(config: &HostBootConfig, shared: &SharedState) -> Result<Router> {
    let base_url = format!("http://{}:{}", config.server_ip, config.ports.http);
    let context = BootContext::new(FileProfileStore::new(&config.root), base_url);
    let dispatch = DispatchState::new(
        BootMenu::new(config.ports.http)?,
        config.server_ip.into(),
        &config.controlplane,
        shared.records.clone(),
    );

    Ok(boot_router(context, dispatch)
        .nest_service("/assets", ServeDir::new(config.assets_root()))
        .layer(TraceLayer::new_for_http()))
}

/// Boot routes without static assets or tracing
pub fn boot_router(context: BootContext, dispatch: DispatchState) -> Router {
    Router::new()
        .route("/boot.ipxe", get(boot_script))
        .route(
            "/ipxe",
            get(profile).layer(from_fn_with_state(dispatch, boot_dispatch)),
        )
        .with_state(context)
}

fn ipxe_script(script: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        script,
    )
        .into_response()
}

async fn boot_script(State(context): State<BootContext>) -> Response {
    ipxe_script(chain_script(&context.base_url))
}

async fn profile(
    State(context): State<BootContext>,
    Query(selection): Query<BootSelection>,
) -> Response {
    let profiles = context.profiles.clone();
    let lookup = tokio::task::spawn_blocking(move || profiles.lookup(&selection)).await;

    match lookup {
        Ok(Ok(Some(profile))) => {
            debug!(profile = %profile.id, "Serving profile");
            ipxe_script(profile_script(&profile))
        }
        Ok(Ok(None)) => StatusCode::NOT_FOUND.into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "Profile lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            error!(error = %e, "Profile lookup task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
