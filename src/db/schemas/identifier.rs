//! Per-service identity schema
//!
//! An identifier is one person's presence at one service. Identifiers are
//! later merged under a single user by the reconciliation step.

use std::collections::HashMap;

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::consent::endpoints::EndpointKind;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for identifiers
pub const IDENTIFIER_COLLECTION: &str = "identifiers";

/// Per-identifier endpoint override, optionally scoped to a partner service
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOverride {
    /// Partner service this override applies to; None means any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ObjectId>,

    #[serde(default)]
    pub url: String,
}

/// Identifier document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct IdentifierDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Service this identity lives at
    pub service: ObjectId,

    /// Email address at that service
    pub email: String,

    /// The service's own id for this user
    #[serde(default)]
    pub user_service_id: String,

    /// Opaque key the service uses to look the user up
    #[serde(default)]
    pub user_key: String,

    /// Whether this email has been verified through an exchange
    #[serde(default)]
    pub email_verified: bool,

    /// Owning user, once reconciled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<ObjectId>,

    /// Endpoint overrides, keyed by endpoint kind
    #[serde(default)]
    pub endpoints: HashMap<EndpointKind, Vec<EndpointOverride>>,
}

impl IntoIndexes for IdentifierDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "service": 1, "email": 1 },
                Some(
                    IndexOptions::builder()
                        .name("identifier_service_email_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "user_key": 1 },
                Some(
                    IndexOptions::builder()
                        .name("identifier_user_key_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "user": 1 },
                Some(
                    IndexOptions::builder()
                        .name("identifier_user_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for IdentifierDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
