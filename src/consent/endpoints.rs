//! Endpoint resolution
//!
//! Each delivery picks the URL to call from the identifier's per-kind
//! override list, falling back to the service's published default. With more
//! than one override the target service must match one of them explicitly.

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::db::schemas::{IdentifierDoc, ServiceDoc};
use crate::types::{CovenantError, Result};

/// The four endpoint roles a partner backend exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointKind {
    ConsentImport,
    ConsentExport,
    DataImport,
    DataExport,
}

impl EndpointKind {
    /// Wire name, matching the serde form
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::ConsentImport => "consentImport",
            EndpointKind::ConsentExport => "consentExport",
            EndpointKind::DataImport => "dataImport",
            EndpointKind::DataExport => "dataExport",
        }
    }

    fn default_url(self, service: &ServiceDoc) -> Option<&str> {
        let urls = &service.urls;
        match self {
            EndpointKind::ConsentImport => urls.consent_import.as_deref(),
            EndpointKind::ConsentExport => urls.consent_export.as_deref(),
            EndpointKind::DataImport => urls.data_import.as_deref(),
            EndpointKind::DataExport => urls.data_export.as_deref(),
        }
    }
}

/// Resolve the URL for one endpoint kind.
///
/// Priority: with multiple overrides, the one scoped to `target_service`
/// wins and a missing match is an error; with exactly one non-empty
/// override, that URL wins; otherwise the service default applies.
pub fn resolve_endpoint(
    identifier: &IdentifierDoc,
    target_service: &ObjectId,
    default_service: &ServiceDoc,
    kind: EndpointKind,
) -> Result<String> {
    if let Some(overrides) = identifier.endpoints.get(&kind) {
        if overrides.len() > 1 {
            return overrides
                .iter()
                .find(|o| o.service_id.as_ref() == Some(target_service))
                .map(|o| o.url.clone())
                .ok_or_else(|| {
                    CovenantError::NotFound(format!(
                        "No {} endpoint defined for service {}",
                        kind.as_str(),
                        target_service.to_hex()
                    ))
                });
        }

        if let Some(first) = overrides.first() {
            if !first.url.is_empty() {
                return Ok(first.url.clone());
            }
        }
    }

    kind.default_url(default_service)
        .map(String::from)
        .ok_or_else(|| {
            CovenantError::NotFound(format!(
                "The {} endpoint is not configured for service {}",
                kind.as_str(),
                default_service.name
            ))
        })
}
