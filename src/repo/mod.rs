//! Storage seam for the consent engine
//!
//! The engine only sees the [`ConsentRepository`] trait. Production uses the
//! MongoDB implementation; dev mode and tests use the in-memory one.

mod memory;
mod mongo;

pub use memory::MemoryRepository;
pub use mongo::MongoRepository;

use async_trait::async_trait;
use bson::oid::ObjectId;

use crate::db::schemas::{
    AuthInfoDoc, ConfirmationAccountDoc, ConsentExchangeDoc, DataTypeDoc, DataTypeFieldDoc,
    DataUseExchangeDoc, IdentifierDoc, PurposeDoc, ServiceDoc, UserDoc,
};
use crate::types::Result;

/// Storage operations the consent engine needs
#[async_trait]
pub trait ConsentRepository: Send + Sync {
    async fn service_by_id(&self, id: &ObjectId) -> Result<Option<ServiceDoc>>;

    async fn service_by_name(&self, name: &str) -> Result<Option<ServiceDoc>>;

    /// Lookup by API credential, used for request authentication
    async fn service_by_key(&self, key: &str) -> Result<Option<ServiceDoc>>;

    async fn purpose_by_id(&self, id: &ObjectId) -> Result<Option<PurposeDoc>>;

    /// The standing data-use exchange for (importing service, purpose)
    async fn due_for(
        &self,
        service_import: &ObjectId,
        purpose: &ObjectId,
    ) -> Result<Option<DataUseExchangeDoc>>;

    async fn due_by_id(&self, id: &ObjectId) -> Result<Option<DataUseExchangeDoc>>;

    async fn datatype_by_id(&self, id: &ObjectId) -> Result<Option<DataTypeDoc>>;

    async fn fields_for_datatype(&self, datatype: &ObjectId) -> Result<Vec<DataTypeFieldDoc>>;

    async fn identifier_by_id(&self, id: &ObjectId) -> Result<Option<IdentifierDoc>>;

    async fn identifier_by_user_key(
        &self,
        service: &ObjectId,
        user_key: &str,
    ) -> Result<Option<IdentifierDoc>>;

    async fn identifier_by_email(
        &self,
        service: &ObjectId,
        email: &str,
    ) -> Result<Option<IdentifierDoc>>;

    /// Identifiers at any service whose email is one of the given addresses
    async fn identifiers_matching_emails(&self, emails: &[String]) -> Result<Vec<IdentifierDoc>>;

    async fn insert_identifier(&self, doc: IdentifierDoc) -> Result<ObjectId>;

    async fn save_identifier(&self, doc: &IdentifierDoc) -> Result<()>;

    async fn user_by_id(&self, id: &ObjectId) -> Result<Option<UserDoc>>;

    async fn insert_user(&self, doc: UserDoc) -> Result<ObjectId>;

    async fn save_user(&self, doc: &UserDoc) -> Result<()>;

    /// Soft-delete a user absorbed into another during reconciliation
    async fn delete_user(&self, id: &ObjectId) -> Result<()>;

    async fn consent_by_id(&self, id: &ObjectId) -> Result<Option<ConsentExchangeDoc>>;

    async fn consent_by_email_token(&self, token: &str) -> Result<Option<ConsentExchangeDoc>>;

    /// An unverified exchange between the same parties under the same DUE,
    /// if one is still pending (dedupe target for retried starts)
    async fn pending_exchange(
        &self,
        data_use_exchange: &ObjectId,
        user_import_id: &ObjectId,
        user_export_id: &ObjectId,
    ) -> Result<Option<ConsentExchangeDoc>>;

    async fn insert_consent(&self, doc: ConsentExchangeDoc) -> Result<ObjectId>;

    async fn save_consent(&self, doc: &ConsentExchangeDoc) -> Result<()>;

    async fn auth_info_for(&self, service: &ObjectId, email: &str) -> Result<Option<AuthInfoDoc>>;

    async fn insert_confirmation_account(&self, doc: ConfirmationAccountDoc) -> Result<ObjectId>;
}
