//! Registered third-party service schema
//!
//! Services are the parties on either side of a consent exchange. Each one
//! authenticates with its service key and publishes the default endpoints
//! partner backends are reached at.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for services
pub const SERVICE_COLLECTION: &str = "services";

/// Authentication style a service uses for its end users
pub mod auth_method {
    /// Token-based (pre-registered AuthenticationInfo required)
    pub const TOKEN: i32 = 0;
    /// Email-verification based
    pub const EMAIL: i32 = 1;
}

/// Default endpoint URLs published by a service
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUrls {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_import: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_export: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_import: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_export: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,

    /// Where new users register an account with the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_use: Option<String>,
}

/// Service document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ServiceDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at, is_deleted)
    #[serde(default)]
    pub metadata: Metadata,

    /// Service name (unique)
    pub name: String,

    /// Short description shown to end users
    #[serde(default)]
    pub description: String,

    /// API credential presented in the x-service-key header
    pub service_key: String,

    /// Published endpoint URLs
    #[serde(default)]
    pub urls: ServiceUrls,

    /// End-user authentication style (see [`auth_method`])
    #[serde(default)]
    pub auth_method: i32,

    /// Whether this service acts as a data processor for another
    #[serde(default)]
    pub is_processing: bool,
}

impl IntoIndexes for ServiceDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "name": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("service_name_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "service_key": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("service_key_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ServiceDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
