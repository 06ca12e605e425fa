//! MongoDB repository
//!
//! Thin mapping from [`ConsentRepository`] calls to typed collection
//! queries. Field names in filters follow each schema's serde form.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId};

use crate::db::mongo::{MongoClient, MongoCollection};
use crate::db::schemas::{
    AuthInfoDoc, ConfirmationAccountDoc, ConsentExchangeDoc, DataTypeDoc, DataTypeFieldDoc,
    DataUseExchangeDoc, IdentifierDoc, PurposeDoc, ServiceDoc, UserDoc, AUTH_INFO_COLLECTION,
    CONFIRMATION_ACCOUNT_COLLECTION, CONSENT_EXCHANGE_COLLECTION, DATATYPE_COLLECTION,
    DATATYPE_FIELD_COLLECTION, DATA_USE_EXCHANGE_COLLECTION, IDENTIFIER_COLLECTION,
    PURPOSE_COLLECTION, SERVICE_COLLECTION, USER_COLLECTION,
};
use crate::types::Result;

use super::ConsentRepository;

/// Follow codes an unverified exchange can still be resumed from
const PENDING_CODES: [i32; 7] = [1000, 1100, 1150, 2000, 2050, 2100, 2150];

/// Verified checkpoints left behind by a failed outbound relay; a retried
/// start resumes these instead of opening a second exchange
const CHECKPOINT_CODES: [i32; 2] = [1200, 2200];

pub struct MongoRepository {
    services: MongoCollection<ServiceDoc>,
    purposes: MongoCollection<PurposeDoc>,
    datatypes: MongoCollection<DataTypeDoc>,
    datatype_fields: MongoCollection<DataTypeFieldDoc>,
    dues: MongoCollection<DataUseExchangeDoc>,
    identifiers: MongoCollection<IdentifierDoc>,
    users: MongoCollection<UserDoc>,
    consents: MongoCollection<ConsentExchangeDoc>,
    auth_infos: MongoCollection<AuthInfoDoc>,
    confirmation_accounts: MongoCollection<ConfirmationAccountDoc>,
}

impl MongoRepository {
    /// Open all collections and apply their indexes
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            services: client.collection(SERVICE_COLLECTION).await?,
            purposes: client.collection(PURPOSE_COLLECTION).await?,
            datatypes: client.collection(DATATYPE_COLLECTION).await?,
            datatype_fields: client.collection(DATATYPE_FIELD_COLLECTION).await?,
            dues: client.collection(DATA_USE_EXCHANGE_COLLECTION).await?,
            identifiers: client.collection(IDENTIFIER_COLLECTION).await?,
            users: client.collection(USER_COLLECTION).await?,
            consents: client.collection(CONSENT_EXCHANGE_COLLECTION).await?,
            auth_infos: client.collection(AUTH_INFO_COLLECTION).await?,
            confirmation_accounts: client.collection(CONFIRMATION_ACCOUNT_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl ConsentRepository for MongoRepository {
    async fn service_by_id(&self, id: &ObjectId) -> Result<Option<ServiceDoc>> {
        self.services.find_one(doc! { "_id": id }).await
    }

    async fn service_by_name(&self, name: &str) -> Result<Option<ServiceDoc>> {
        self.services.find_one(doc! { "name": name }).await
    }

    async fn service_by_key(&self, key: &str) -> Result<Option<ServiceDoc>> {
        self.services.find_one(doc! { "service_key": key }).await
    }

    async fn purpose_by_id(&self, id: &ObjectId) -> Result<Option<PurposeDoc>> {
        self.purposes.find_one(doc! { "_id": id }).await
    }

    async fn due_for(
        &self,
        service_import: &ObjectId,
        purpose: &ObjectId,
    ) -> Result<Option<DataUseExchangeDoc>> {
        self.dues
            .find_one(doc! { "serviceImport": service_import, "purpose": purpose })
            .await
    }

    async fn due_by_id(&self, id: &ObjectId) -> Result<Option<DataUseExchangeDoc>> {
        self.dues.find_one(doc! { "_id": id }).await
    }

    async fn datatype_by_id(&self, id: &ObjectId) -> Result<Option<DataTypeDoc>> {
        self.datatypes.find_one(doc! { "_id": id }).await
    }

    async fn fields_for_datatype(&self, datatype: &ObjectId) -> Result<Vec<DataTypeFieldDoc>> {
        self.datatype_fields
            .find_many(doc! { "datatype": datatype })
            .await
    }

    async fn identifier_by_id(&self, id: &ObjectId) -> Result<Option<IdentifierDoc>> {
        self.identifiers.find_one(doc! { "_id": id }).await
    }

    async fn identifier_by_user_key(
        &self,
        service: &ObjectId,
        user_key: &str,
    ) -> Result<Option<IdentifierDoc>> {
        self.identifiers
            .find_one(doc! { "service": service, "user_key": user_key })
            .await
    }

    async fn identifier_by_email(
        &self,
        service: &ObjectId,
        email: &str,
    ) -> Result<Option<IdentifierDoc>> {
        self.identifiers
            .find_one(doc! { "service": service, "email": email })
            .await
    }

    async fn identifiers_matching_emails(&self, emails: &[String]) -> Result<Vec<IdentifierDoc>> {
        self.identifiers
            .find_many(doc! { "email": { "$in": emails.to_vec() } })
            .await
    }

    async fn insert_identifier(&self, doc: IdentifierDoc) -> Result<ObjectId> {
        self.identifiers.insert_one(doc).await
    }

    async fn save_identifier(&self, doc: &IdentifierDoc) -> Result<()> {
        self.identifiers.replace_by_id(doc._id, doc).await
    }

    async fn user_by_id(&self, id: &ObjectId) -> Result<Option<UserDoc>> {
        self.users.find_one(doc! { "_id": id }).await
    }

    async fn insert_user(&self, doc: UserDoc) -> Result<ObjectId> {
        self.users.insert_one(doc).await
    }

    async fn save_user(&self, doc: &UserDoc) -> Result<()> {
        self.users.replace_by_id(doc._id, doc).await
    }

    async fn delete_user(&self, id: &ObjectId) -> Result<()> {
        self.users.soft_delete(doc! { "_id": id }).await
    }

    async fn consent_by_id(&self, id: &ObjectId) -> Result<Option<ConsentExchangeDoc>> {
        self.consents.find_one(doc! { "_id": id }).await
    }

    async fn consent_by_email_token(&self, token: &str) -> Result<Option<ConsentExchangeDoc>> {
        self.consents
            .find_one(doc! { "emailToken.token": token })
            .await
    }

    async fn pending_exchange(
        &self,
        data_use_exchange: &ObjectId,
        user_import_id: &ObjectId,
        user_export_id: &ObjectId,
    ) -> Result<Option<ConsentExchangeDoc>> {
        self.consents
            .find_one(doc! {
                "dataUseExchange": data_use_exchange,
                "userImportId": user_import_id,
                "userExportId": user_export_id,
                "$or": [
                    {
                        "verified": 0,
                        "status.followCode": { "$in": PENDING_CODES.to_vec() },
                    },
                    { "status.followCode": { "$in": CHECKPOINT_CODES.to_vec() } },
                ],
            })
            .await
    }

    async fn insert_consent(&self, doc: ConsentExchangeDoc) -> Result<ObjectId> {
        self.consents.insert_one(doc).await
    }

    async fn save_consent(&self, doc: &ConsentExchangeDoc) -> Result<()> {
        self.consents.replace_by_id(doc._id, doc).await
    }

    async fn auth_info_for(&self, service: &ObjectId, email: &str) -> Result<Option<AuthInfoDoc>> {
        self.auth_infos
            .find_one(doc! { "service": service, "email": email })
            .await
    }

    async fn insert_confirmation_account(&self, doc: ConfirmationAccountDoc) -> Result<ObjectId> {
        self.confirmation_accounts.insert_one(doc).await
    }
}
