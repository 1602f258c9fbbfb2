//! Captive portal HTTP surface.
//!
//! Serves the portal page, the scan and connect endpoints consumed by its
//! JavaScript, and the redirect targets that operating systems probe to
//! detect a captive network. Blocking backend work is bridged through
//! `spawn_blocking`; the handlers themselves never touch nmcli text.

use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tera::{Context, Tera};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::backend::{ConnectionResult, NetworkBackend};
use crate::config::PortalConfig;
use crate::gateway::PortalGateway;

lazy_static! {
    pub static ref TEMPLATES: Tera = {
        let mut tera = match Tera::new("templates/**/*") {
            Ok(t) => t,
            Err(e) => {
                eprintln!("Template parsing error: {}", e);
                std::process::exit(1);
            }
        };
        tera.autoescape_on(vec![".html"]);
        tera
    };
}

/// Shared handler state: the backend for read-only queries, the gateway for
/// anything that mutates connection state, and the static config.
pub struct PortalState {
    pub backend: Arc<dyn NetworkBackend>,
    pub gateway: PortalGateway,
    pub config: PortalConfig,
}

/// Paths operating systems request to decide whether they are behind a
/// captive portal. All of them get an empty redirect to the portal root.
const DETECTION_PATHS: [&str; 6] = [
    "/generate_204",
    "/ncsi.txt",
    "/connecttest.txt",
    "/redirect",
    "/hotspot-detect.html",
    "/library/test/success.html",
];

pub async fn run_server(state: Arc<PortalState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/", get(index_handler))
        .route("/scan", get(scan_handler))
        .route("/connect", post(connect_handler))
        .route("/success", get(success_handler));
    for path in DETECTION_PATHS {
        app = app.route(path, get(detection_handler));
    }
    let app = app
        .fallback(fallback_handler)
        .layer(cors)
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.portal_port);
    info!(%addr, "portal server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn index_handler() -> Response {
    render("index.html", Context::new())
}

async fn scan_handler(State(state): State<Arc<PortalState>>) -> impl IntoResponse {
    let backend = Arc::clone(&state.backend);
    let networks = match tokio::task::spawn_blocking(move || backend.scan()).await {
        Ok(Ok(networks)) => networks,
        // The portal page can always retry; a failed scan is an empty list.
        Ok(Err(err)) => {
            warn!(error = %err, "scan failed");
            Vec::new()
        }
        Err(err) => {
            error!(error = %err, "scan task failed");
            Vec::new()
        }
    };
    Json(networks)
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub ssid: String,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ConnectionResult>,
}

async fn connect_handler(
    State(state): State<Arc<PortalState>>,
    Json(request): Json<ConnectRequest>,
) -> Json<ConnectResponse> {
    if request.ssid.trim().is_empty() {
        return Json(ConnectResponse {
            success: false,
            message: "SSID is required".to_string(),
            data: None,
        });
    }

    let shared = Arc::clone(&state);
    let result = tokio::task::spawn_blocking(move || {
        shared
            .gateway
            .request_connect(&request.ssid, request.password.as_deref())
    })
    .await;

    match result {
        Ok(result) if result.success => Json(ConnectResponse {
            success: true,
            message: format!("Successfully connected to {}", result.ssid),
            data: Some(result),
        }),
        Ok(result) => {
            let message = result
                .failure_reason
                .map(|r| r.user_message())
                .unwrap_or("Failed to connect to the network. Please try again.")
                .to_string();
            Json(ConnectResponse {
                success: false,
                message,
                data: None,
            })
        }
        Err(err) => {
            error!(error = %err, "connect task failed");
            Json(ConnectResponse {
                success: false,
                message: "Failed to connect to the network. Please try again.".to_string(),
                data: None,
            })
        }
    }
}

/// Post-connect page. The connection info is fetched fresh per request
/// rather than kept in a shared global, so it can never go stale.
async fn success_handler(State(state): State<Arc<PortalState>>) -> Response {
    let backend = Arc::clone(&state.backend);
    let active = tokio::task::spawn_blocking(move || backend.active_connection()).await;

    match active {
        Ok(Ok(Some(info))) => {
            let mut context = Context::new();
            context.insert("ssid", &info.ssid);
            context.insert("ip_address", info.ip_address.as_deref().unwrap_or("unknown"));
            context.insert("signal_strength", &info.signal_strength.unwrap_or(0));
            render("success.html", context)
        }
        _ => Redirect::temporary("/").into_response(),
    }
}

async fn detection_handler(uri: Uri) -> Redirect {
    info!(path = %uri.path(), "captive portal detection probe");
    Redirect::temporary("/")
}

async fn fallback_handler(uri: Uri) -> Redirect {
    info!(path = %uri.path(), "unknown path, redirecting to portal");
    Redirect::temporary("/")
}

fn render(name: &str, context: Context) -> Response {
    match TEMPLATES.render(name, &context) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!(template = name, error = %e, "template render error");
            (StatusCode::INTERNAL_SERVER_ERROR, "Template error").into_response()
        }
    }
}
