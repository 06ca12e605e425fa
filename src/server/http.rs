//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. One connection task per
//! accepted socket; routing is a match over (method, path).

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Args;
use crate::consent::ConsentEngine;
use crate::repo::ConsentRepository;
use crate::routes;
use crate::types::CovenantError;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub engine: Arc<ConsentEngine>,
    pub repo: Arc<dyn ConsentRepository>,
    /// True when the repository is MongoDB-backed
    pub persistent: bool,
}

impl AppState {
    pub fn new(
        args: Args,
        engine: Arc<ConsentEngine>,
        repo: Arc<dyn ConsentRepository>,
        persistent: bool,
    ) -> Self {
        Self {
            args,
            engine,
            repo,
            persistent,
        }
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<(), CovenantError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Covenant listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - running on the in-memory repository");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        // Liveness probe
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            routes::health_check(Arc::clone(&state))
        }

        (Method::GET, "/version") => routes::version_info(),

        // CORS preflight
        (Method::OPTIONS, _) => preflight_response(),

        // Service-to-service exchange API
        (Method::POST, "/v1/consents/exchange/import") => {
            routes::handle_start_import(req, Arc::clone(&state)).await
        }
        (Method::POST, "/v1/consents/exchange/export") => {
            routes::handle_start_export(req, Arc::clone(&state)).await
        }
        (Method::POST, "/v1/consents/exchange/token") => {
            routes::handle_attach_token(req, Arc::clone(&state)).await
        }
        (Method::POST, "/v1/consents/exchange/validate") => {
            routes::handle_verify_token(req, Arc::clone(&state)).await
        }
        (Method::POST, "/v1/consents/exchange/account") => {
            routes::handle_verify_account(req, Arc::clone(&state)).await
        }
        (Method::POST, "/v1/consents/interop/verify") => {
            routes::handle_interop_verify(req, Arc::clone(&state)).await
        }

        // Exchange status follow: /v1/consents/{id}/status
        (Method::GET, p)
            if p.starts_with("/v1/consents/") && p.ends_with("/status") =>
        {
            let consent_id = p
                .strip_prefix("/v1/consents/")
                .and_then(|s| s.strip_suffix("/status"))
                .unwrap_or("")
                .to_string();
            routes::handle_consent_status(req, &consent_id, Arc::clone(&state)).await
        }

        // Browser-facing email validation link
        (Method::GET, p) if p.starts_with("/consents/email/validation/") => {
            let token = p
                .strip_prefix("/consents/email/validation/")
                .unwrap_or("")
                .to_string();
            routes::handle_email_validation(&token, Arc::clone(&state)).await
        }

        _ => not_found_response(&path),
    };

    Ok(response)
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
