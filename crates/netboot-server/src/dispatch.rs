//! Boot dispatch filter
//!
//! Wraps the `/ipxe` profile handler. The handler's response is buffered
//! first and then inspected:
//!
//! - `404` means no profile matched, so the machine gets the interactive
//!   boot menu instead.
//! - `200` is relayed as is; if the machine booted as `init` or
//!   `controlplane` its address is first registered under the control-plane
//!   name.
//! - Anything else is relayed untouched.

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use netboot_dns::DnsRecordStore;
use netboot_ipxe::{BootMenu, BootSelection};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A fully buffered response of the wrapped handler
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedResponse {
    pub async fn capture(response: Response) -> Result<Self, axum::Error> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await?;
        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    /// Rebuild the response exactly as captured
    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// What to send back for one boot request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    RenderMenu,
    /// Relay the captured response, registering `elect` first when set
    Relay { elect: Option<Ipv4Addr> },
}

/// Choose between the menu and the captured response
pub fn decide(captured: &CapturedResponse, selection: &BootSelection) -> Dispatch {
    match captured.status {
        StatusCode::NOT_FOUND => Dispatch::RenderMenu,
        StatusCode::OK => Dispatch::Relay {
            elect: selection.controlplane_candidate(),
        },
        _ => Dispatch::Relay { elect: None },
    }
}

/// State of the dispatch middleware
#[derive(Clone)]
pub struct DispatchState {
    menu: Arc<BootMenu>,
    server_ip: IpAddr,
    controlplane: Arc<str>,
    records: Arc<DnsRecordStore>,
}

impl std::fmt::Debug for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchState")
            .field("server_ip", &self.server_ip)
            .field("controlplane", &self.controlplane)
            .finish_non_exhaustive()
    }
}

impl DispatchState {
    pub fn new(
        menu: BootMenu,
        server_ip: IpAddr,
        controlplane: &str,
        records: Arc<DnsRecordStore>,
    ) -> Self {
        Self {
            menu: Arc::new(menu),
            server_ip,
            controlplane: controlplane.into(),
            records,
        }
    }
}

/// Middleware applying [`decide`] to the wrapped handler's response
pub async fn boot_dispatch(
    State(state): State<DispatchState>,
    request: Request,
    next: Next,
) -> Response {
    let uri = request.uri().clone();
    let response = next.run(request).await;

    let captured = match CapturedResponse::capture(response).await {
        Ok(captured) => captured,
        Err(e) => {
            error!(uri = %uri, error = %e, "Failed to buffer boot response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let selection = match Query::<BootSelection>::try_from_uri(&uri) {
        Ok(Query(selection)) => selection,
        Err(e) => {
            warn!(query = ?uri.query(), error = %e, "Failed to decode boot selection");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match decide(&captured, &selection) {
        Dispatch::RenderMenu => match state.menu.render(state.server_ip) {
            Ok(menu) => {
                info!(mac = ?selection.mac, uuid = ?selection.uuid, "No profile, serving boot menu");
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    menu,
                )
                    .into_response()
            }
            Err(e) => {
                error!(error = %e, "Failed to render boot menu");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Dispatch::Relay { elect } => {
            if let Some(ip) = elect {
                state.records.register(&state.controlplane, ip).await;
                info!(
                    name = %state.controlplane,
                    ip = %ip,
                    role = selection.boot_type.as_str(),
                    "Registered control-plane node"
                );
            }
            captured.into_response()
        }
    }
}
