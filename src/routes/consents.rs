//! Consent exchange API handlers
//!
//! Service backends drive the protocol through these JSON endpoints. Every
//! handler under /v1/consents authenticates the caller by service key before
//! touching the engine.

use std::sync::Arc;

use bson::oid::ObjectId;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::authenticate_service;
use crate::consent::engine::{DatatypeSelection, StartExportRequest, StartImportRequest, StartOutcome};
use crate::routes::{error_response, json_response, read_json_body};
use crate::server::AppState;
use crate::types::{CovenantError, Result};

#[derive(Deserialize)]
struct DatatypeSelectionBody {
    #[serde(alias = "_id")]
    id: String,
    checked: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartImportBody {
    service_export: String,
    purpose: String,
    email_import: String,
    email_export: String,
    user_key: String,
    datatypes: Vec<DatatypeSelectionBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartExportBody {
    purpose: String,
    email_import: Option<String>,
    email_export: String,
    user_key: String,
    datatypes: Vec<DatatypeSelectionBody>,
    #[serde(default)]
    is_new_account: bool,
    interop_service: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachTokenBody {
    consent_id: String,
    token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyTokenBody {
    consent_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyAccountBody {
    consent_id: String,
    user_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteropVerifyBody {
    signed_consent: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    consent_id: String,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    signed_consent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirection_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation_email: Option<String>,
}

impl StartResponse {
    fn from_outcome(outcome: StartOutcome) -> (StatusCode, Self) {
        match outcome {
            StartOutcome::EmailPending { consent_id, email } => (
                StatusCode::ACCEPTED,
                Self {
                    consent_id: consent_id.to_hex(),
                    state: "emailPending",
                    signed_consent: None,
                    redirection_url: None,
                    validation_email: Some(email),
                },
            ),
            StartOutcome::AwaitingAccount {
                consent_id,
                redirection_url,
            } => (
                StatusCode::ACCEPTED,
                Self {
                    consent_id: consent_id.to_hex(),
                    state: "awaitingAccount",
                    signed_consent: None,
                    redirection_url,
                    validation_email: None,
                },
            ),
            StartOutcome::Delivered {
                consent_id,
                signed_consent,
                redirection_url,
            } => (
                StatusCode::OK,
                Self {
                    consent_id: consent_id.to_hex(),
                    state: "delivered",
                    signed_consent: Some(signed_consent),
                    redirection_url,
                    validation_email: None,
                },
            ),
        }
    }
}

fn parse_object_id(raw: &str, what: &str) -> Result<ObjectId> {
    ObjectId::parse_str(raw)
        .map_err(|_| CovenantError::invalid("EBADID", format!("Invalid {} id: {}", what, raw)))
}

fn parse_selections(raw: &[DatatypeSelectionBody]) -> Result<Vec<DatatypeSelection>> {
    raw.iter()
        .map(|s| {
            Ok(DatatypeSelection {
                id: parse_object_id(&s.id, "datatype")?,
                checked: s.checked,
            })
        })
        .collect()
}

/// POST /v1/consents/exchange/import
pub async fn handle_start_import(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let result = async {
        let caller = authenticate_service(state.repo.as_ref(), req.headers()).await?;
        let body: StartImportBody = read_json_body(req).await?;

        let request = StartImportRequest {
            service_export: body.service_export,
            purpose: parse_object_id(&body.purpose, "purpose")?,
            email_import: body.email_import,
            email_export: body.email_export,
            user_key: body.user_key,
            datatypes: parse_selections(&body.datatypes)?,
        };

        info!(service = %caller.name, "import exchange requested");
        state.engine.start_import_exchange(&caller, request).await
    }
    .await;

    match result {
        Ok(outcome) => {
            let (status, response) = StartResponse::from_outcome(outcome);
            json_response(status, &response)
        }
        Err(e) => error_response(&e),
    }
}

/// POST /v1/consents/exchange/export
pub async fn handle_start_export(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let result = async {
        let caller = authenticate_service(state.repo.as_ref(), req.headers()).await?;
        let body: StartExportBody = read_json_body(req).await?;

        let interop_service = body
            .interop_service
            .as_deref()
            .map(|raw| parse_object_id(raw, "interop service"))
            .transpose()?;

        let request = StartExportRequest {
            purpose: parse_object_id(&body.purpose, "purpose")?,
            email_import: body.email_import,
            email_export: body.email_export,
            user_key: body.user_key,
            datatypes: parse_selections(&body.datatypes)?,
            is_new_account: body.is_new_account,
            interop_service,
        };

        info!(service = %caller.name, "export exchange requested");
        state.engine.start_export_exchange(&caller, request).await
    }
    .await;

    match result {
        Ok(outcome) => {
            let (status, response) = StartResponse::from_outcome(outcome);
            json_response(status, &response)
        }
        Err(e) => error_response(&e),
    }
}

/// POST /v1/consents/exchange/token
pub async fn handle_attach_token(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let result = async {
        let caller = authenticate_service(state.repo.as_ref(), req.headers()).await?;
        let body: AttachTokenBody = read_json_body(req).await?;
        let consent_id = parse_object_id(&body.consent_id, "consent")?;

        state
            .engine
            .attach_token(&caller, &consent_id, &body.token)
            .await
    }
    .await;

    match result {
        Ok((consent_id, service_import)) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "consentId": consent_id.to_hex(),
                "serviceImport": service_import,
                "state": "tokenAttached",
            }),
        ),
        Err(e) => error_response(&e),
    }
}

/// POST /v1/consents/exchange/validate
pub async fn handle_verify_token(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let result = async {
        let _caller = authenticate_service(state.repo.as_ref(), req.headers()).await?;
        let body: VerifyTokenBody = read_json_body(req).await?;
        let consent_id = parse_object_id(&body.consent_id, "consent")?;

        state.engine.verify_token_and_user_identity(&consent_id).await
    }
    .await;

    match result {
        Ok(verification) => {
            let datatypes: Vec<_> = verification
                .datatypes
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "name": d.name,
                        "table": d.table,
                        "fields": d.fields,
                    })
                })
                .collect();
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "verified": true,
                    "userImport": {
                        "email": verification.user_import.email,
                        "userServiceId": verification.user_import.user_service_id,
                    },
                    "userExport": {
                        "email": verification.user_export.email,
                        "userServiceId": verification.user_export.user_service_id,
                    },
                    "dataImportEndpoint": verification.data_import_endpoint,
                    "datatypes": datatypes,
                }),
            )
        }
        Err(e) => error_response(&e),
    }
}

/// POST /v1/consents/exchange/account
pub async fn handle_verify_account(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let result = async {
        let caller = authenticate_service(state.repo.as_ref(), req.headers()).await?;
        let body: VerifyAccountBody = read_json_body(req).await?;
        let consent_id = parse_object_id(&body.consent_id, "consent")?;

        state
            .engine
            .verify_consent_on_account_creation(&caller, &consent_id, &body.user_key)
            .await
    }
    .await;

    match result {
        Ok(consent_id) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "consentId": consent_id.to_hex(),
                "state": "delivered",
            }),
        ),
        Err(e) => error_response(&e),
    }
}

/// POST /v1/consents/interop/verify
pub async fn handle_interop_verify(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let result = async {
        let _caller = authenticate_service(state.repo.as_ref(), req.headers()).await?;
        let body: InteropVerifyBody = read_json_body(req).await?;
        state.engine.verify_interop_consent(&body.signed_consent).await
    }
    .await;

    match result {
        Ok(data_import_url) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "verified": true,
                "dataImportUrl": data_import_url,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /v1/consents/{id}/status
pub async fn handle_consent_status(
    req: Request<Incoming>,
    consent_id: &str,
    state: Arc<AppState>,
) -> Response<Full<Bytes>> {
    let result = async {
        let _caller = authenticate_service(state.repo.as_ref(), req.headers()).await?;
        let consent_id = parse_object_id(consent_id, "consent")?;
        state.engine.consent_status(&consent_id).await
    }
    .await;

    match result {
        Ok(status) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "consentId": status.consent_id.to_hex(),
                "followCode": status.follow_code,
                "text": status.text,
                "verified": status.verified,
                "consented": status.consented,
                "flow": status.flow,
                "timestamp": status.timestamp.try_to_rfc3339_string().unwrap_or_default(),
            }),
        ),
        Err(e) => error_response(&e),
    }
}
