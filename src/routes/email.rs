//! Browser-facing email validation pages
//!
//! The validation link mailed to the person lands here. The outcome pages
//! are plain HTML since the visitor is a person, not a service backend.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use tracing::error;

use crate::consent::engine::{EmailValidationOutcome, ExchangeSummary};
use crate::server::AppState;
use crate::types::CovenantError;

/// GET /consents/email/validation/{token}
pub async fn handle_email_validation(token: &str, state: Arc<AppState>) -> Response<Full<Bytes>> {
    match state.engine.validate_email_token(token).await {
        Ok(EmailValidationOutcome::AlreadyValidated) => html_response(
            StatusCode::OK,
            page(
                "Email already validated",
                "<p>This validation link has already been used. If you did not complete \
                 the exchange yourself, please contact the service that requested it.</p>",
            ),
        ),
        Ok(EmailValidationOutcome::Expired) => html_response(
            StatusCode::GONE,
            page(
                "Validation link expired",
                "<p>This validation link has expired. Please restart the data exchange \
                 to receive a new one.</p>",
            ),
        ),
        Ok(EmailValidationOutcome::Confirmed(summary)) => {
            html_response(StatusCode::OK, summary_page(&summary))
        }
        Err(e) => {
            error!(error = %e, "email validation failed");
            let status = match &e {
                CovenantError::Dependency { .. } => StatusCode::FAILED_DEPENDENCY,
                _ => e.status_code(),
            };
            html_response(
                status,
                page(
                    "Something went wrong",
                    "<p>We could not complete the exchange. Please try the link again later \
                     or restart the exchange.</p>",
                ),
            )
        }
    }
}

fn summary_page(summary: &ExchangeSummary) -> String {
    let mut rows = String::new();
    for (name, authorized) in &summary.datatypes {
        let decision = if *authorized { "authorized" } else { "declined" };
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>",
            escape(name),
            decision
        ));
    }

    let purpose = summary
        .purpose
        .as_deref()
        .map(escape)
        .unwrap_or_else(|| "-".to_string());

    page(
        "Exchange confirmed",
        &format!(
            "<p>Your consent has been confirmed and delivered.</p>\
             <table>\
             <tr><th>Importing service</th><td>{}</td></tr>\
             <tr><th>Exporting service</th><td>{}</td></tr>\
             <tr><th>Purpose</th><td>{}</td></tr>\
             <tr><th>Email (import)</th><td>{}</td></tr>\
             <tr><th>Email (export)</th><td>{}</td></tr>\
             </table>\
             <h2>Datatypes</h2>\
             <table><tr><th>Name</th><th>Decision</th></tr>{}</table>",
            escape(&summary.service_import),
            escape(&summary.service_export),
            purpose,
            escape(&summary.email_import),
            escape(&summary.email_export),
            rows
        ),
    )
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title>\
         <style>body{{font-family:sans-serif;max-width:40em;margin:3em auto;padding:0 1em}}\
         table{{border-collapse:collapse}}th,td{{border:1px solid #ccc;padding:.3em .6em;text-align:left}}</style>\
         </head><body><h1>{title}</h1>{body}</body></html>"
    )
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn html_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_neutralizes_markup() {
        assert_eq!(escape("<b>&\"x\"</b>"), "&lt;b&gt;&amp;&quot;x&quot;&lt;/b&gt;");
    }

    #[test]
    fn summary_includes_parties_and_decisions() {
        let summary = ExchangeSummary {
            service_import: "alpha".into(),
            service_export: "beta".into(),
            purpose: Some("research".into()),
            email_import: "a@example.com".into(),
            email_export: "b@example.com".into(),
            created_at: bson::DateTime::now(),
            datatypes: vec![("steps".into(), true), ("heart rate".into(), false)],
        };
        let html = summary_page(&summary);
        assert!(html.contains("alpha"));
        assert!(html.contains("heart rate"));
        assert!(html.contains("declined"));
    }
}
