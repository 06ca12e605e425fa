//! Outbound consent delivery
//!
//! Signed envelopes are POSTed to partner backends. One attempt with a
//! bounded timeout; a failure surfaces as a dependency error carrying the
//! target URL so the caller can see which partner misbehaved.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{CovenantError, Result};

/// Body POSTed to a partner backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryBody {
    pub signed_consent: String,

    /// Export-side consent endpoint, included on the attach-token relay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_export_url: Option<String>,

    /// Import-side data endpoint, included on the attach-token relay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_import_url: Option<String>,
}

impl DeliveryBody {
    pub fn new(signed_consent: String) -> Self {
        Self {
            signed_consent,
            service_export_url: None,
            data_import_url: None,
        }
    }
}

/// Outbound POST seam, mocked in tests
#[async_trait]
pub trait ConsentDelivery: Send + Sync {
    async fn deliver(&self, url: &str, body: &DeliveryBody) -> Result<()>;
}

/// reqwest-backed delivery client
pub struct HttpDelivery {
    client: reqwest::Client,
}

impl HttpDelivery {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CovenantError::Config(format!("HTTP client build failed: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ConsentDelivery for HttpDelivery {
    async fn deliver(&self, url: &str, body: &DeliveryBody) -> Result<()> {
        debug!(url, "delivering signed consent");

        let response = self.client.post(url).json(body).send().await.map_err(|e| {
            warn!(url, error = %e, "consent delivery failed");
            CovenantError::Dependency {
                url: url.to_string(),
                detail: e.to_string(),
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(url, %status, "partner rejected consent delivery");
            return Err(CovenantError::Dependency {
                url: url.to_string(),
                detail: format!("partner responded with status {}", status),
            });
        }

        Ok(())
    }
}
