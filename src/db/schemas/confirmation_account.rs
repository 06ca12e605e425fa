//! Confirmation account schema
//!
//! Invitation credential minted when a verified exchange belongs to a user
//! who has not completed registration yet. The token travels in the
//! invitation email and expires after a day.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for confirmation accounts
pub const CONFIRMATION_ACCOUNT_COLLECTION: &str = "confirmation_accounts";

/// Confirmation account document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConfirmationAccountDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub email: String,

    pub token: String,

    pub expires: DateTime,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<ObjectId>,

    #[serde(default)]
    pub identifiers: Vec<ObjectId>,
}

impl Default for ConfirmationAccountDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            email: String::new(),
            token: String::new(),
            expires: DateTime::now(),
            user: None,
            identifiers: Vec::new(),
        }
    }
}

impl IntoIndexes for ConfirmationAccountDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "token": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("confirmation_token_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for ConfirmationAccountDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
