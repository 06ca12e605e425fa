//! Consent exchange schema
//!
//! The central record of the protocol: one in-flight (or completed) consent
//! between two identifiers under one data-use exchange.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::consent::status::FollowCode;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for consent exchanges
pub const CONSENT_EXCHANGE_COLLECTION: &str = "consent_exchanges";

/// Which side initiated the exchange
pub mod flow {
    pub const IMPORT: i32 = 1;
    pub const EXPORT: i32 = 2;
}

/// One datatype covered by the consent
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ConsentData {
    pub datatype: ObjectId,

    /// Whether the person checked this datatype when consenting
    #[serde(default)]
    pub authorized: bool,
}

/// Single-use email verification credential
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EmailToken {
    pub token: String,
    pub expires: DateTime,
}

impl Default for EmailToken {
    fn default() -> Self {
        Self {
            token: String::new(),
            expires: DateTime::now(),
        }
    }
}

/// Current protocol position, stored denormalized with its display text
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConsentStatus {
    pub follow_code: i32,
    pub text: String,
}

impl Default for ConsentStatus {
    fn default() -> Self {
        Self {
            follow_code: FollowCode::ImportStarted.code(),
            text: String::new(),
        }
    }
}

/// Interoperability routing for exchanges relayed through a partner network
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Interoperability {
    #[serde(default)]
    pub active: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interop_service: Option<ObjectId>,
}

/// Consent exchange document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConsentExchangeDoc {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Datatype selection snapshot taken at start
    #[serde(default)]
    pub data: Vec<ConsentData>,

    /// Identifier on the importing side; unset while an export-initiated
    /// exchange waits on account creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_import_id: Option<ObjectId>,

    /// Identifier on the exporting side
    pub user_export_id: ObjectId,

    pub data_use_exchange: ObjectId,

    /// 0 until the verification checkpoint, then 1
    #[serde(default)]
    pub verified: i32,

    #[serde(default)]
    pub consented: bool,

    /// Which side initiated (see [`flow`])
    pub flow: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_token: Option<EmailToken>,

    /// Access token attached by the importing backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default)]
    pub status: ConsentStatus,

    #[serde(default)]
    pub interoperability: Interoperability,

    /// Processor-protocol linkage; recorded but not acted on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ObjectId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub child: Option<ObjectId>,

    #[serde(default)]
    pub is_test: bool,

    pub timestamp: DateTime,
}

impl Default for ConsentExchangeDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            data: Vec::new(),
            user_import_id: None,
            user_export_id: ObjectId::new(),
            data_use_exchange: ObjectId::new(),
            verified: 0,
            consented: false,
            flow: flow::IMPORT,
            email_token: None,
            token: None,
            status: ConsentStatus::default(),
            interoperability: Interoperability::default(),
            parent: None,
            child: None,
            is_test: false,
            timestamp: DateTime::now(),
        }
    }
}

impl ConsentExchangeDoc {
    /// Datatype ids the person actually authorized
    pub fn authorized_datatypes(&self) -> Vec<ObjectId> {
        self.data
            .iter()
            .filter(|d| d.authorized)
            .map(|d| d.datatype)
            .collect()
    }
}

impl IntoIndexes for ConsentExchangeDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "dataUseExchange": 1, "userImportId": 1, "userExportId": 1 },
                Some(
                    IndexOptions::builder()
                        .name("ce_due_parties_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "emailToken.token": 1 },
                Some(
                    IndexOptions::builder()
                        .name("ce_email_token_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ConsentExchangeDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
