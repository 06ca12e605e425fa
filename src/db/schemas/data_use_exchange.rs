//! Data-use exchange schema
//!
//! A data-use exchange (DUE) is the standing agreement that an importing
//! service may, for one purpose, receive specific datatypes from specific
//! exporting services. The consent engine reads DUEs but never writes them.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for data-use exchanges
pub const DATA_USE_EXCHANGE_COLLECTION: &str = "data_use_exchanges";

/// One (datatype, exporting service) entry of a DUE
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DueEntry {
    pub datatype: ObjectId,

    pub service_export: ObjectId,

    /// Whether the exporting service has authorized this entry
    #[serde(default)]
    pub authorized: bool,
}

/// Data-use exchange document stored in MongoDB.
/// At most one exists per (serviceImport, purpose).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataUseExchangeDoc {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub service_import: ObjectId,

    pub purpose: ObjectId,

    #[serde(default)]
    pub data: Vec<DueEntry>,
}

impl DataUseExchangeDoc {
    /// Entry for a given (datatype, exporting service) pair, if configured
    pub fn entry(&self, datatype: &ObjectId, service_export: &ObjectId) -> Option<&DueEntry> {
        self.data
            .iter()
            .find(|e| &e.datatype == datatype && &e.service_export == service_export)
    }
}

impl IntoIndexes for DataUseExchangeDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "serviceImport": 1, "purpose": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("due_import_purpose_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for DataUseExchangeDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
