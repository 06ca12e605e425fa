//! HTTP routes for Covenant

pub mod consents;
pub mod email;
pub mod health;

pub use consents::{
    handle_attach_token, handle_consent_status, handle_interop_verify, handle_start_export,
    handle_start_import, handle_verify_account, handle_verify_token,
};
pub use email::handle_email_validation;
pub use health::{health_check, version_info};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::{CovenantError, Result};

/// Serialize a value as a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(value)
        .unwrap_or_else(|_| r#"{"error":"internal-error","message":"Serialization failed"}"#.into());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Map a protocol error onto its JSON envelope
pub fn error_response(err: &CovenantError) -> Response<Full<Bytes>> {
    let mut body = serde_json::json!({
        "error": err.kind(),
        "message": err.to_string(),
    });
    if let Some(code) = err.code() {
        body["code"] = serde_json::Value::String(code.to_string());
    }

    Response::builder()
        .status(err.status_code())
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Collect and deserialize a JSON request body
pub async fn read_json_body<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let body = req
        .collect()
        .await
        .map_err(|e| CovenantError::Http(format!("Failed to read request body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&body)
        .map_err(|e| CovenantError::Http(format!("Invalid JSON body: {}", e)))
}
