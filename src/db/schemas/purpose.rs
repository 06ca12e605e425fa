//! Purpose and datatype schemas
//!
//! A purpose names why an importing service wants data; datatypes name what
//! data an exporting service can provide, with field-level detail in a
//! separate join collection.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for purposes
pub const PURPOSE_COLLECTION: &str = "purposes";

/// Collection name for datatypes
pub const DATATYPE_COLLECTION: &str = "datatypes";

/// Collection name for datatype field definitions
pub const DATATYPE_FIELD_COLLECTION: &str = "datatype_fields";

/// A datatype an importing purpose consumes
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ImportedDatatype {
    pub datatype: ObjectId,

    /// Whether the purpose currently uses this datatype
    #[serde(default)]
    pub used: bool,
}

/// Purpose document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PurposeDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Importing service that owns this purpose
    pub service: ObjectId,

    #[serde(default)]
    pub imported_datatypes: Vec<ImportedDatatype>,
}

impl IntoIndexes for PurposeDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "service": 1 },
            Some(
                IndexOptions::builder()
                    .name("purpose_service_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for PurposeDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Datatype document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DataTypeDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Exporting service this datatype originates from
    pub provenance: ObjectId,
}

impl IntoIndexes for DataTypeDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "provenance": 1 },
            Some(
                IndexOptions::builder()
                    .name("datatype_provenance_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for DataTypeDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Field-level schema for one datatype table
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DataTypeFieldDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Datatype this table belongs to
    pub datatype: ObjectId,

    pub table: String,

    #[serde(default)]
    pub fields: Vec<String>,
}

impl IntoIndexes for DataTypeFieldDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "datatype": 1 },
            Some(
                IndexOptions::builder()
                    .name("datatype_field_datatype_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for DataTypeFieldDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
