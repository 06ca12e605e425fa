//! In-memory repository
//!
//! Backs dev mode when MongoDB is unreachable, and the integration tests.
//! Same visible semantics as the MongoDB implementation, minus persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use bson::oid::ObjectId;
use tokio::sync::RwLock;

use crate::consent::status::FollowCode;
use crate::db::schemas::{
    AuthInfoDoc, ConfirmationAccountDoc, ConsentExchangeDoc, DataTypeDoc, DataTypeFieldDoc,
    DataUseExchangeDoc, IdentifierDoc, PurposeDoc, ServiceDoc, UserDoc,
};
use crate::types::{CovenantError, Result};

use super::ConsentRepository;

#[derive(Default)]
struct Store {
    services: HashMap<ObjectId, ServiceDoc>,
    purposes: HashMap<ObjectId, PurposeDoc>,
    datatypes: HashMap<ObjectId, DataTypeDoc>,
    datatype_fields: Vec<DataTypeFieldDoc>,
    dues: HashMap<ObjectId, DataUseExchangeDoc>,
    identifiers: HashMap<ObjectId, IdentifierDoc>,
    users: HashMap<ObjectId, UserDoc>,
    consents: HashMap<ObjectId, ConsentExchangeDoc>,
    auth_infos: Vec<AuthInfoDoc>,
    confirmation_accounts: HashMap<ObjectId, ConfirmationAccountDoc>,
}

/// HashMap-backed repository
#[derive(Default)]
pub struct MemoryRepository {
    store: RwLock<Store>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a service (test and dev-mode setup)
    pub async fn add_service(&self, mut doc: ServiceDoc) -> ObjectId {
        let id = doc._id.unwrap_or_else(ObjectId::new);
        doc._id = Some(id);
        self.store.write().await.services.insert(id, doc);
        id
    }

    /// Seed a purpose
    pub async fn add_purpose(&self, mut doc: PurposeDoc) -> ObjectId {
        let id = doc._id.unwrap_or_else(ObjectId::new);
        doc._id = Some(id);
        self.store.write().await.purposes.insert(id, doc);
        id
    }

    /// Seed a datatype
    pub async fn add_datatype(&self, mut doc: DataTypeDoc) -> ObjectId {
        let id = doc._id.unwrap_or_else(ObjectId::new);
        doc._id = Some(id);
        self.store.write().await.datatypes.insert(id, doc);
        id
    }

    /// Seed datatype field definitions
    pub async fn add_datatype_fields(&self, doc: DataTypeFieldDoc) {
        self.store.write().await.datatype_fields.push(doc);
    }

    /// Seed a data-use exchange
    pub async fn add_due(&self, mut doc: DataUseExchangeDoc) -> ObjectId {
        let id = doc._id.unwrap_or_else(ObjectId::new);
        doc._id = Some(id);
        self.store.write().await.dues.insert(id, doc);
        id
    }

    /// Seed an authentication info record
    pub async fn add_auth_info(&self, doc: AuthInfoDoc) {
        self.store.write().await.auth_infos.push(doc);
    }

    /// All stored exchanges (test inspection)
    pub async fn consents(&self) -> Vec<ConsentExchangeDoc> {
        self.store.read().await.consents.values().cloned().collect()
    }

    /// All confirmation accounts created so far (test inspection)
    pub async fn confirmation_accounts(&self) -> Vec<ConfirmationAccountDoc> {
        self.store
            .read()
            .await
            .confirmation_accounts
            .values()
            .cloned()
            .collect()
    }
}

fn is_pending(ce: &ConsentExchangeDoc) -> bool {
    let code = FollowCode::from_code(ce.status.follow_code);
    let pre_delivery = matches!(
        code,
        Some(
            FollowCode::ImportStarted
                | FollowCode::ImportAttached
                | FollowCode::ImportEmailPending
                | FollowCode::ExportStarted
                | FollowCode::ExportAwaitingAccount
                | FollowCode::ExportAttached
                | FollowCode::ExportEmailPending
        )
    );
    // Verified but never delivered: checkpointed before a failed outbound
    // relay. A retried start resumes this exchange instead of opening a
    // second one.
    let checkpointed = matches!(
        code,
        Some(FollowCode::ImportVerified | FollowCode::ExportVerified)
    );
    (ce.verified == 0 && pre_delivery) || checkpointed
}

#[async_trait]
impl ConsentRepository for MemoryRepository {
    async fn service_by_id(&self, id: &ObjectId) -> Result<Option<ServiceDoc>> {
        Ok(self.store.read().await.services.get(id).cloned())
    }

    async fn service_by_name(&self, name: &str) -> Result<Option<ServiceDoc>> {
        Ok(self
            .store
            .read()
            .await
            .services
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn service_by_key(&self, key: &str) -> Result<Option<ServiceDoc>> {
        Ok(self
            .store
            .read()
            .await
            .services
            .values()
            .find(|s| s.service_key == key)
            .cloned())
    }

    async fn purpose_by_id(&self, id: &ObjectId) -> Result<Option<PurposeDoc>> {
        Ok(self.store.read().await.purposes.get(id).cloned())
    }

    async fn due_for(
        &self,
        service_import: &ObjectId,
        purpose: &ObjectId,
    ) -> Result<Option<DataUseExchangeDoc>> {
        Ok(self
            .store
            .read()
            .await
            .dues
            .values()
            .find(|d| &d.service_import == service_import && &d.purpose == purpose)
            .cloned())
    }

    async fn due_by_id(&self, id: &ObjectId) -> Result<Option<DataUseExchangeDoc>> {
        Ok(self.store.read().await.dues.get(id).cloned())
    }

    async fn datatype_by_id(&self, id: &ObjectId) -> Result<Option<DataTypeDoc>> {
        Ok(self.store.read().await.datatypes.get(id).cloned())
    }

    async fn fields_for_datatype(&self, datatype: &ObjectId) -> Result<Vec<DataTypeFieldDoc>> {
        Ok(self
            .store
            .read()
            .await
            .datatype_fields
            .iter()
            .filter(|f| &f.datatype == datatype)
            .cloned()
            .collect())
    }

    async fn identifier_by_id(&self, id: &ObjectId) -> Result<Option<IdentifierDoc>> {
        Ok(self.store.read().await.identifiers.get(id).cloned())
    }

    async fn identifier_by_user_key(
        &self,
        service: &ObjectId,
        user_key: &str,
    ) -> Result<Option<IdentifierDoc>> {
        Ok(self
            .store
            .read()
            .await
            .identifiers
            .values()
            .find(|i| &i.service == service && i.user_key == user_key)
            .cloned())
    }

    async fn identifier_by_email(
        &self,
        service: &ObjectId,
        email: &str,
    ) -> Result<Option<IdentifierDoc>> {
        Ok(self
            .store
            .read()
            .await
            .identifiers
            .values()
            .find(|i| &i.service == service && i.email == email)
            .cloned())
    }

    async fn identifiers_matching_emails(&self, emails: &[String]) -> Result<Vec<IdentifierDoc>> {
        Ok(self
            .store
            .read()
            .await
            .identifiers
            .values()
            .filter(|i| emails.contains(&i.email))
            .cloned()
            .collect())
    }

    async fn insert_identifier(&self, mut doc: IdentifierDoc) -> Result<ObjectId> {
        let id = ObjectId::new();
        doc._id = Some(id);
        doc.metadata.touch();
        self.store.write().await.identifiers.insert(id, doc);
        Ok(id)
    }

    async fn save_identifier(&self, doc: &IdentifierDoc) -> Result<()> {
        let id = doc
            ._id
            .ok_or_else(|| CovenantError::Database("identifier has no id".into()))?;
        let mut updated = doc.clone();
        updated.metadata.touch();
        self.store.write().await.identifiers.insert(id, updated);
        Ok(())
    }

    async fn user_by_id(&self, id: &ObjectId) -> Result<Option<UserDoc>> {
        Ok(self.store.read().await.users.get(id).cloned())
    }

    async fn insert_user(&self, mut doc: UserDoc) -> Result<ObjectId> {
        let id = ObjectId::new();
        doc._id = Some(id);
        doc.metadata.touch();
        self.store.write().await.users.insert(id, doc);
        Ok(id)
    }

    async fn save_user(&self, doc: &UserDoc) -> Result<()> {
        let id = doc
            ._id
            .ok_or_else(|| CovenantError::Database("user has no id".into()))?;
        let mut updated = doc.clone();
        updated.metadata.touch();
        self.store.write().await.users.insert(id, updated);
        Ok(())
    }

    async fn delete_user(&self, id: &ObjectId) -> Result<()> {
        self.store.write().await.users.remove(id);
        Ok(())
    }

    async fn consent_by_id(&self, id: &ObjectId) -> Result<Option<ConsentExchangeDoc>> {
        Ok(self.store.read().await.consents.get(id).cloned())
    }

    async fn consent_by_email_token(&self, token: &str) -> Result<Option<ConsentExchangeDoc>> {
        Ok(self
            .store
            .read()
            .await
            .consents
            .values()
            .find(|c| c.email_token.as_ref().is_some_and(|t| t.token == token))
            .cloned())
    }

    async fn pending_exchange(
        &self,
        data_use_exchange: &ObjectId,
        user_import_id: &ObjectId,
        user_export_id: &ObjectId,
    ) -> Result<Option<ConsentExchangeDoc>> {
        Ok(self
            .store
            .read()
            .await
            .consents
            .values()
            .find(|c| {
                &c.data_use_exchange == data_use_exchange
                    && c.user_import_id.as_ref() == Some(user_import_id)
                    && &c.user_export_id == user_export_id
                    && is_pending(c)
            })
            .cloned())
    }

    async fn insert_consent(&self, mut doc: ConsentExchangeDoc) -> Result<ObjectId> {
        let id = ObjectId::new();
        doc._id = Some(id);
        doc.metadata.touch();
        self.store.write().await.consents.insert(id, doc);
        Ok(id)
    }

    async fn save_consent(&self, doc: &ConsentExchangeDoc) -> Result<()> {
        let id = doc
            ._id
            .ok_or_else(|| CovenantError::Database("consent exchange has no id".into()))?;
        let mut updated = doc.clone();
        updated.metadata.touch();
        self.store.write().await.consents.insert(id, updated);
        Ok(())
    }

    async fn auth_info_for(&self, service: &ObjectId, email: &str) -> Result<Option<AuthInfoDoc>> {
        Ok(self
            .store
            .read()
            .await
            .auth_infos
            .iter()
            .find(|a| &a.service == service && a.email == email)
            .cloned())
    }

    async fn insert_confirmation_account(&self, mut doc: ConfirmationAccountDoc) -> Result<ObjectId> {
        let id = ObjectId::new();
        doc._id = Some(id);
        doc.metadata.touch();
        self.store
            .write()
            .await
            .confirmation_accounts
            .insert(id, doc);
        Ok(id)
    }
}
