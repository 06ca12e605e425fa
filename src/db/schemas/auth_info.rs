//! Pre-registered authentication info schema
//!
//! Token-auth services register their users' exchange credentials ahead of
//! time; the import flow refuses to start without a matching record.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for authentication info records
pub const AUTH_INFO_COLLECTION: &str = "authentication_infos";

/// Authentication info document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AuthInfoDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub service: ObjectId,

    pub email: String,

    #[serde(default)]
    pub request_token: String,

    #[serde(default)]
    pub access_token: String,
}

impl IntoIndexes for AuthInfoDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "service": 1, "email": 1 },
            Some(
                IndexOptions::builder()
                    .name("auth_info_service_email_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for AuthInfoDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
