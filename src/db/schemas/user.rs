//! User document schema
//!
//! A user aggregates the identifiers reconciled to the same person. Until the
//! person completes registration the document is a bare shell with no profile
//! fields set.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for users
pub const USER_COLLECTION: &str = "users";

/// User document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UserDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at, is_deleted)
    #[serde(default)]
    pub metadata: Metadata,

    /// Identifiers reconciled under this user
    #[serde(default)]
    pub identifiers: Vec<ObjectId>,

    /// Every email seen across those identifiers
    #[serde(default)]
    pub emails: Vec<String>,

    /// Profile fields, set once the person registers an account
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl UserDoc {
    /// Whether this user is an identity shell with no completed account
    pub fn is_bare(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.email.is_none()
            && self.password_hash.is_none()
    }
}

impl IntoIndexes for UserDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "identifiers": 1 },
                Some(
                    IndexOptions::builder()
                        .name("user_identifiers_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "emails": 1 },
                Some(
                    IndexOptions::builder()
                        .name("user_emails_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for UserDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
