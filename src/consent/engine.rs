//! Consent exchange state machine
//!
//! One engine instance owns the storage, delivery, mail, and signing
//! collaborators and exposes a named transition per protocol step. Writes to
//! a single exchange are serialized through a keyed mutex; lookups that do
//! not depend on each other run concurrently.

use std::sync::Arc;

use bson::{oid::ObjectId, DateTime};
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::consent::codec::{ConsentSigner, SignedConsentPayload};
use crate::consent::delivery::{ConsentDelivery, DeliveryBody};
use crate::consent::email::Mailer;
use crate::consent::endpoints::{resolve_endpoint, EndpointKind};
use crate::consent::identity::reconcile_identifiers;
use crate::consent::status::{update_status, FollowCode};
use crate::db::schemas::{
    flow, ConfirmationAccountDoc, ConsentData, ConsentExchangeDoc, DataUseExchangeDoc, EmailToken,
    IdentifierDoc, Interoperability, ServiceDoc, UserDoc,
};
use crate::repo::ConsentRepository;
use crate::types::{CovenantError, Result};

const EMAIL_TOKEN_LEN: usize = 40;
const CONFIRMATION_TOKEN_LEN: usize = 50;
const MAX_ATTACHED_TOKEN_LEN: usize = 50;

/// Policy oracle consulted before an exchange is allowed to start
pub trait ExchangeAuthorization: Send + Sync {
    fn allows(&self, service_import: &ServiceDoc, service_export: &ServiceDoc) -> bool;
}

/// Default policy: every configured exchange is allowed
pub struct AllowAll;

impl ExchangeAuthorization for AllowAll {
    fn allows(&self, _service_import: &ServiceDoc, _service_export: &ServiceDoc) -> bool {
        true
    }
}

/// Engine tunables taken from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Public base URL used in email validation links
    pub public_url: String,
    pub email_token_expiry_hours: i64,
    pub confirmation_expiry_hours: i64,
}

/// One datatype as selected by the person consenting
#[derive(Debug, Clone)]
pub struct DatatypeSelection {
    pub id: ObjectId,
    pub checked: bool,
}

/// Parameters of an import-initiated start
#[derive(Debug, Clone)]
pub struct StartImportRequest {
    /// Export service, by name
    pub service_export: String,
    pub purpose: ObjectId,
    pub email_import: String,
    pub email_export: String,
    pub user_key: String,
    pub datatypes: Vec<DatatypeSelection>,
}

/// Parameters of an export-initiated start
#[derive(Debug, Clone)]
pub struct StartExportRequest {
    pub purpose: ObjectId,
    /// Absent when the person has no account at the import service yet
    pub email_import: Option<String>,
    pub email_export: String,
    pub user_key: String,
    pub datatypes: Vec<DatatypeSelection>,
    pub is_new_account: bool,
    /// Interoperability partner the final relay should target instead of
    /// the import service itself
    pub interop_service: Option<ObjectId>,
}

/// How a start call concluded
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// Paused at 1150/2150; a validation mail is on its way
    EmailPending { consent_id: ObjectId, email: String },
    /// Paused at 2050 until the import service reports the new account
    AwaitingAccount {
        consent_id: ObjectId,
        redirection_url: Option<String>,
    },
    /// Verified and relayed to the partner backend
    Delivered {
        consent_id: ObjectId,
        signed_consent: String,
        redirection_url: Option<String>,
    },
}

/// Result of following an email validation link
#[derive(Debug, Clone)]
pub enum EmailValidationOutcome {
    /// Token unknown; the link was already used
    AlreadyValidated,
    /// Token expired; the exchange is untouched
    Expired,
    /// Exchange verified and delivered
    Confirmed(ExchangeSummary),
}

/// Human-readable recap rendered after a successful email validation
#[derive(Debug, Clone)]
pub struct ExchangeSummary {
    pub service_import: String,
    pub service_export: String,
    pub purpose: Option<String>,
    pub email_import: String,
    pub email_export: String,
    pub created_at: DateTime,
    pub datatypes: Vec<(String, bool)>,
}

/// Datatype released to the export backend after verification
#[derive(Debug, Clone)]
pub struct ReleasedDatatype {
    pub name: String,
    pub table: Option<String>,
    pub fields: Option<Vec<String>>,
}

/// Party description returned by the verification step
#[derive(Debug, Clone)]
pub struct PartyInfo {
    pub email: String,
    pub user_service_id: String,
}

/// Response of the verification step
#[derive(Debug, Clone)]
pub struct VerificationResponse {
    pub user_import: PartyInfo,
    pub user_export: PartyInfo,
    pub data_import_endpoint: String,
    pub datatypes: Vec<ReleasedDatatype>,
}

/// Current protocol position of an exchange
#[derive(Debug, Clone)]
pub struct StatusView {
    pub consent_id: ObjectId,
    pub follow_code: i32,
    pub text: String,
    pub verified: i32,
    pub consented: bool,
    pub flow: i32,
    pub timestamp: DateTime,
}

/// The consent exchange protocol engine
pub struct ConsentEngine {
    repo: Arc<dyn ConsentRepository>,
    delivery: Arc<dyn ConsentDelivery>,
    mailer: Arc<dyn Mailer>,
    authorization: Arc<dyn ExchangeAuthorization>,
    signer: ConsentSigner,
    settings: EngineSettings,
    locks: DashMap<ObjectId, Arc<Mutex<()>>>,
}

impl ConsentEngine {
    pub fn new(
        repo: Arc<dyn ConsentRepository>,
        delivery: Arc<dyn ConsentDelivery>,
        mailer: Arc<dyn Mailer>,
        signer: ConsentSigner,
        settings: EngineSettings,
    ) -> Self {
        Self {
            repo,
            delivery,
            mailer,
            authorization: Arc::new(AllowAll),
            signer,
            settings,
            locks: DashMap::new(),
        }
    }

    pub fn with_authorization(mut self, authorization: Arc<dyn ExchangeAuthorization>) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn signer(&self) -> &ConsentSigner {
        &self.signer
    }

    fn lock_for(&self, consent_id: &ObjectId) -> Arc<Mutex<()>> {
        // Entries only the map still references belong to finished
        // operations; drop them so the map tracks live holders only.
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.locks
            .entry(*consent_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Import-initiated start. The authenticated caller is the import side.
    pub async fn start_import_exchange(
        &self,
        service_import: &ServiceDoc,
        request: StartImportRequest,
    ) -> Result<StartOutcome> {
        let service_export = self
            .repo
            .service_by_name(&request.service_export)
            .await?
            .ok_or_else(|| {
                CovenantError::NotFound(format!("Service {} not found", request.service_export))
            })?;

        if !self.authorization.allows(service_import, &service_export) {
            return Err(CovenantError::Forbidden(
                "exchange not authorized between these services".into(),
            ));
        }

        let import_id = required_id(service_import)?;
        let export_id = required_id(&service_export)?;

        let (purpose, due) = tokio::join!(
            self.repo.purpose_by_id(&request.purpose),
            self.repo.due_for(&import_id, &request.purpose),
        );
        purpose?.ok_or_else(|| {
            CovenantError::NotFound("Purpose not found. Please check the provided purpose".into())
        })?;
        let due = due?
            .filter(|d| d.data.iter().any(|e| e.service_export == export_id))
            .ok_or_else(|| {
                CovenantError::NotFound(format!(
                    "Data exchange configuration not found between your service and {}",
                    service_export.name
                ))
            })?;

        let data = project_datatypes(&due, &export_id, &request.datatypes)?;

        let (import_identifier, export_identifier) = tokio::join!(
            self.repo
                .identifier_by_user_key(&import_id, &request.user_key),
            self.repo
                .identifier_by_email(&export_id, &request.email_export),
        );
        let mut import_identifier = import_identifier?.ok_or_else(|| {
            CovenantError::NotFound(
                "Please make sure you have created a user identifier for the user before \
                 launching the data exchange"
                    .into(),
            )
        })?;
        let mut export_identifier = export_identifier?.ok_or_else(|| {
            CovenantError::NotFound(format!(
                "User identifier in the export service not found. {} does not seem to have \
                 registered the identifier for this user on their service or the user does \
                 not have an account in that service",
                service_export.name
            ))
        })?;

        // The caller names the user's import-side email; it must agree with
        // the identifier registered under the user key.
        if !import_identifier
            .email
            .eq_ignore_ascii_case(request.email_import.trim())
        {
            return Err(CovenantError::invalid(
                "EBADEMAIL",
                "The provided import email does not match the identifier registered for \
                 this user key",
            ));
        }

        let due_id = due
            ._id
            .ok_or_else(|| CovenantError::Internal("data use exchange has no id".into()))?;
        let import_identifier_id = identifier_id(&import_identifier)?;
        let export_identifier_id = identifier_id(&export_identifier)?;

        let mut ce = self
            .open_exchange(
                &due_id,
                &import_identifier_id,
                &export_identifier_id,
                data,
                flow::IMPORT,
            )
            .await?;
        let consent_id = exchange_id(&ce)?;

        let guard = self.lock_for(&consent_id);
        let _held = guard.lock().await;

        ce.user_import_id = Some(import_identifier_id);
        ce.user_export_id = export_identifier_id;
        ce.data_use_exchange = due_id;
        update_status(&mut ce, FollowCode::ImportAttached, "");
        self.repo.save_consent(&ce).await?;

        let same_email = import_identifier.email == export_identifier.email;
        if service_export.auth_method == crate::db::schemas::auth_method::EMAIL
            && !same_email
            && !export_identifier.email_verified
        {
            return self
                .pause_for_email(&mut ce, &request.email_export, FollowCode::ImportEmailPending)
                .await;
        }

        if service_export.auth_method == crate::db::schemas::auth_method::TOKEN {
            let auth_info = self
                .repo
                .auth_info_for(&export_id, &export_identifier.email)
                .await?;
            if auth_info.is_none() {
                return Err(CovenantError::Unauthorized(
                    "User not authenticated in service Export".into(),
                ));
            }
        }

        ce.verified = 1;
        ce.consented = true;
        update_status(&mut ce, FollowCode::ImportVerified, "");
        self.repo.save_consent(&ce).await?;

        reconcile_identifiers(
            self.repo.as_ref(),
            &mut import_identifier,
            &mut export_identifier,
        )
        .await?;

        let signed_consent = self
            .relay_consent(
                &mut ce,
                service_import,
                &service_export,
                &import_identifier,
                &export_identifier,
                None,
                FollowCode::ImportDelivered,
            )
            .await?;

        Ok(StartOutcome::Delivered {
            consent_id,
            signed_consent,
            redirection_url: None,
        })
    }

    /// Export-initiated start. The authenticated caller is the export side.
    pub async fn start_export_exchange(
        &self,
        service_export: &ServiceDoc,
        request: StartExportRequest,
    ) -> Result<StartOutcome> {
        let export_id = required_id(service_export)?;

        let purpose = self
            .repo
            .purpose_by_id(&request.purpose)
            .await?
            .ok_or_else(|| {
                CovenantError::NotFound(
                    "Purpose not found. Please check the provided purpose".into(),
                )
            })?;

        let service_import = self
            .repo
            .service_by_id(&purpose.service)
            .await?
            .ok_or_else(|| CovenantError::NotFound("Service not found".into()))?;
        let import_id = required_id(&service_import)?;

        if !self.authorization.allows(&service_import, service_export) {
            return Err(CovenantError::Forbidden(
                "exchange not authorized between these services".into(),
            ));
        }

        let due = self
            .repo
            .due_for(&import_id, &request.purpose)
            .await?
            .filter(|d| d.data.iter().any(|e| e.service_export == export_id))
            .ok_or_else(|| {
                CovenantError::NotFound(format!(
                    "Data exchange configuration not found between your service and {}",
                    service_export.name
                ))
            })?;
        let due_id = due
            ._id
            .ok_or_else(|| CovenantError::Internal("data use exchange has no id".into()))?;

        let mut export_identifier = self
            .repo
            .identifier_by_user_key(&export_id, &request.user_key)
            .await?
            .ok_or_else(|| {
                CovenantError::NotFound(format!(
                    "The user identifier in {} was not found for email {}. Please verify you \
                     have registered this user",
                    service_export.name, request.email_export
                ))
            })?;
        let export_identifier_id = identifier_id(&export_identifier)?;

        let data = project_datatypes(&due, &export_id, &request.datatypes)?;

        // The person is authenticated at the export service right now
        export_identifier.email_verified = true;
        self.repo.save_identifier(&export_identifier).await?;

        if request.is_new_account {
            let register_url = service_import
                .urls
                .register_url
                .as_deref()
                .filter(|u| !u.is_empty());
            if register_url.is_none() {
                return Err(CovenantError::NotFound(
                    "The import service has not informed any registration url. We cannot \
                     process this exchange any further without it"
                        .into(),
                ));
            }

            let mut ce = ConsentExchangeDoc {
                data,
                user_export_id: export_identifier_id,
                data_use_exchange: due_id,
                flow: flow::EXPORT,
                interoperability: interop_for(&request),
                ..Default::default()
            };
            update_status(&mut ce, FollowCode::ExportStarted, "");
            update_status(&mut ce, FollowCode::ExportAwaitingAccount, &service_import.name);
            let consent_id = self.repo.insert_consent(ce).await?;

            info!(
                consent_id = %consent_id.to_hex(),
                import = %service_import.name,
                "exchange paused awaiting account creation"
            );

            return Ok(StartOutcome::AwaitingAccount {
                consent_id,
                redirection_url: service_import.urls.website.clone(),
            });
        }

        let email_import = request.email_import.as_deref().map(str::trim).filter(|e| !e.is_empty());
        let email_import = email_import.ok_or_else(|| {
            CovenantError::invalid("EMISSINGEMAIL", "Missing user's email in the import service")
        })?;

        let mut import_identifier = self
            .repo
            .identifier_by_email(&import_id, email_import)
            .await?
            .ok_or_else(|| {
                CovenantError::NotFound(format!(
                    "The user identifier in {} was not found for email {}. If the user is \
                     trying to create a new account in {} the payload key isNewAccount should \
                     be set to true",
                    service_import.name, email_import, service_import.name
                ))
            })?;
        let import_identifier_id = identifier_id(&import_identifier)?;

        let mut ce = self
            .open_exchange(
                &due_id,
                &import_identifier_id,
                &export_identifier_id,
                data,
                flow::EXPORT,
            )
            .await?;
        let consent_id = exchange_id(&ce)?;

        let guard = self.lock_for(&consent_id);
        let _held = guard.lock().await;

        ce.user_import_id = Some(import_identifier_id);
        ce.user_export_id = export_identifier_id;
        ce.data_use_exchange = due_id;
        ce.interoperability = interop_for(&request);
        update_status(&mut ce, FollowCode::ExportAttached, "");
        self.repo.save_consent(&ce).await?;

        let same_email = import_identifier.email == export_identifier.email;
        if service_import.auth_method == crate::db::schemas::auth_method::EMAIL
            && !same_email
            && !import_identifier.email_verified
        {
            return self
                .pause_for_email(&mut ce, email_import, FollowCode::ExportEmailPending)
                .await;
        }

        if service_import.auth_method == crate::db::schemas::auth_method::TOKEN {
            let auth_info = self
                .repo
                .auth_info_for(&import_id, &import_identifier.email)
                .await?;
            if auth_info.is_none() {
                return Err(CovenantError::Unauthorized(
                    "User not authenticated in service Import".into(),
                ));
            }
        }

        ce.verified = 1;
        update_status(&mut ce, FollowCode::ExportVerified, "");
        self.repo.save_consent(&ce).await?;

        reconcile_identifiers(
            self.repo.as_ref(),
            &mut import_identifier,
            &mut export_identifier,
        )
        .await?;

        let signed_consent = self
            .relay_consent(
                &mut ce,
                &service_import,
                service_export,
                &import_identifier,
                &export_identifier,
                Some(purpose.name.clone()),
                FollowCode::ExportDelivered,
            )
            .await?;

        Ok(StartOutcome::Delivered {
            consent_id,
            signed_consent,
            redirection_url: service_import.urls.website.clone(),
        })
    }

    /// Browser-facing email validation callback
    pub async fn validate_email_token(&self, token: &str) -> Result<EmailValidationOutcome> {
        let Some(mut ce) = self.repo.consent_by_email_token(token).await? else {
            // Token already consumed (cleared on use) or never existed
            return Ok(EmailValidationOutcome::AlreadyValidated);
        };

        let consent_id = exchange_id(&ce)?;
        let guard = self.lock_for(&consent_id);
        let _held = guard.lock().await;

        if let Some(ref email_token) = ce.email_token {
            if email_token.expires < DateTime::now() {
                return Ok(EmailValidationOutcome::Expired);
            }
        }

        let import_identifier_id = ce.user_import_id.ok_or_else(|| {
            CovenantError::Internal("exchange paused on email has no import identifier".into())
        })?;

        let (import_identifier, export_identifier, due) = tokio::join!(
            self.repo.identifier_by_id(&import_identifier_id),
            self.repo.identifier_by_id(&ce.user_export_id),
            self.repo.due_by_id(&ce.data_use_exchange),
        );
        let mut import_identifier = import_identifier?
            .ok_or_else(|| CovenantError::NotFound("Import identifier not found".into()))?;
        let mut export_identifier = export_identifier?
            .ok_or_else(|| CovenantError::NotFound("Export identifier not found".into()))?;
        let due = due?.ok_or_else(|| {
            CovenantError::NotFound("Data exchange configuration not found".into())
        })?;

        let (service_import, service_export) = tokio::join!(
            self.repo.service_by_id(&import_identifier.service),
            self.repo.service_by_id(&export_identifier.service),
        );
        let service_import =
            service_import?.ok_or_else(|| CovenantError::NotFound("Service not found".into()))?;
        let service_export =
            service_export?.ok_or_else(|| CovenantError::NotFound("Service not found".into()))?;

        import_identifier.email_verified = true;
        export_identifier.email_verified = true;
        self.repo.save_identifier(&import_identifier).await?;
        self.repo.save_identifier(&export_identifier).await?;

        let verified_code = if ce.flow == flow::EXPORT {
            FollowCode::ExportVerified
        } else {
            FollowCode::ImportVerified
        };
        let delivered_code = if ce.flow == flow::EXPORT {
            FollowCode::ExportDelivered
        } else {
            FollowCode::ImportDelivered
        };

        ce.verified = 1;
        ce.consented = true;
        ce.email_token = None;
        update_status(&mut ce, verified_code, "");
        self.repo.save_consent(&ce).await?;

        reconcile_identifiers(
            self.repo.as_ref(),
            &mut import_identifier,
            &mut export_identifier,
        )
        .await?;

        let purpose = self
            .repo
            .purpose_by_id(&due.purpose)
            .await?
            .map(|p| p.name);

        self.relay_consent(
            &mut ce,
            &service_import,
            &service_export,
            &import_identifier,
            &export_identifier,
            None,
            delivered_code,
        )
        .await?;

        let mut datatypes = Vec::with_capacity(ce.data.len());
        for entry in &ce.data {
            if let Some(dt) = self.repo.datatype_by_id(&entry.datatype).await? {
                datatypes.push((dt.name, entry.authorized));
            }
        }

        Ok(EmailValidationOutcome::Confirmed(ExchangeSummary {
            service_import: service_import.name,
            service_export: service_export.name,
            purpose,
            email_import: import_identifier.email,
            email_export: export_identifier.email,
            created_at: ce.timestamp,
            datatypes,
        }))
    }

    /// Token attach step, called by the import backend once it minted an
    /// access token for the exchange
    pub async fn attach_token(
        &self,
        service_export: &ServiceDoc,
        consent_id: &ObjectId,
        token: &str,
    ) -> Result<(ObjectId, String)> {
        if token.len() > MAX_ATTACHED_TOKEN_LEN {
            return Err(CovenantError::invalid(
                "ETOKENSIZE",
                "Your token is too large, please use a token of at most 50 characters",
            ));
        }

        let guard = self.lock_for(consent_id);
        let _held = guard.lock().await;

        let mut ce = self.require_consent(consent_id).await?;

        let import_identifier_id = ce.user_import_id.ok_or_else(|| {
            CovenantError::NotFound("Import identifier not attached to this consent".into())
        })?;

        let (import_identifier, export_identifier) = tokio::join!(
            self.repo.identifier_by_id(&import_identifier_id),
            self.repo.identifier_by_id(&ce.user_export_id),
        );
        let import_identifier = import_identifier?
            .ok_or_else(|| CovenantError::NotFound("Import identifier not found".into()))?;
        let export_identifier = export_identifier?
            .ok_or_else(|| CovenantError::NotFound("Export identifier not found".into()))?;

        let service_import = self
            .repo
            .service_by_id(&import_identifier.service)
            .await?
            .ok_or_else(|| CovenantError::NotFound("Import service not found".into()))?;
        let import_id = required_id(&service_import)?;
        let export_id = required_id(service_export)?;

        ce.token = Some(token.to_string());
        self.repo.save_consent(&ce).await?;

        let payload = SignedConsentPayload {
            service_import_name: service_import.name.clone(),
            service_export_name: service_export.name.clone(),
            purpose_name: None,
            user_import_id: import_identifier.user_service_id.clone(),
            user_export_id: export_identifier.user_service_id.clone(),
            email_import: import_identifier.email.clone(),
            email_export: export_identifier.email.clone(),
            consent_id: consent_id.to_hex(),
            token: ce.token.clone(),
        };
        let signed_consent = self.signer.sign(&payload)?;

        let data_export_url = resolve_endpoint(
            &export_identifier,
            &import_id,
            service_export,
            EndpointKind::DataExport,
        )?;

        // Interop exchanges relay through the partner network instead of
        // the import service directly
        let (target_url, data_import_url, status_code, status_param) =
            if ce.interoperability.active {
                let interop_id = ce.interoperability.interop_service.ok_or_else(|| {
                    CovenantError::Internal("interop exchange has no interop service".into())
                })?;
                let interop_service = self
                    .repo
                    .service_by_id(&interop_id)
                    .await?
                    .ok_or_else(|| CovenantError::NotFound("Interop service not found".into()))?;
                let consent_import =
                    interop_service.urls.consent_import.clone().ok_or_else(|| {
                        CovenantError::NotFound(format!(
                            "The consentImport endpoint is not configured for service {}",
                            interop_service.name
                        ))
                    })?;
                let data_import = interop_service.urls.data_import.clone().ok_or_else(|| {
                    CovenantError::NotFound(format!(
                        "The dataImport endpoint is not configured for service {}",
                        interop_service.name
                    ))
                })?;
                (
                    consent_import,
                    data_import,
                    FollowCode::TokenAttachedInterop,
                    interop_service.name,
                )
            } else {
                let consent_import = resolve_endpoint(
                    &import_identifier,
                    &export_id,
                    &service_import,
                    EndpointKind::ConsentImport,
                )?;
                let data_import = resolve_endpoint(
                    &import_identifier,
                    &export_id,
                    &service_import,
                    EndpointKind::DataImport,
                )?;
                (
                    consent_import,
                    data_import,
                    FollowCode::TokenAttached,
                    service_import.name.clone(),
                )
            };

        let body = DeliveryBody {
            signed_consent,
            service_export_url: Some(data_export_url),
            data_import_url: Some(data_import_url),
        };
        self.delivery.deliver(&target_url, &body).await?;

        update_status(&mut ce, status_code, &status_param);
        self.repo.save_consent(&ce).await?;

        Ok((*consent_id, service_import.name))
    }

    /// Final verification by the export backend; releases the authorized
    /// datatypes with their field-level schema
    pub async fn verify_token_and_user_identity(
        &self,
        consent_id: &ObjectId,
    ) -> Result<VerificationResponse> {
        let guard = self.lock_for(consent_id);
        let _held = guard.lock().await;

        let mut ce = self.require_consent(consent_id).await?;

        let mut datatypes = Vec::new();
        for entry in &ce.data {
            if !entry.authorized {
                continue;
            }
            let Some(datatype) = self.repo.datatype_by_id(&entry.datatype).await? else {
                continue;
            };
            let fields = self.repo.fields_for_datatype(&entry.datatype).await?;
            if fields.is_empty() {
                datatypes.push(ReleasedDatatype {
                    name: datatype.name,
                    table: None,
                    fields: None,
                });
            } else {
                for field_doc in fields {
                    datatypes.push(ReleasedDatatype {
                        name: datatype.name.clone(),
                        table: Some(field_doc.table),
                        fields: Some(field_doc.fields),
                    });
                }
            }
        }

        let import_identifier_id = ce.user_import_id.ok_or_else(|| {
            CovenantError::NotFound("Import identifier not attached to this consent".into())
        })?;
        let (import_identifier, export_identifier) = tokio::join!(
            self.repo.identifier_by_id(&import_identifier_id),
            self.repo.identifier_by_id(&ce.user_export_id),
        );
        let import_identifier = import_identifier?
            .ok_or_else(|| CovenantError::NotFound("Import identifier not found".into()))?;
        let export_identifier = export_identifier?
            .ok_or_else(|| CovenantError::NotFound("Export identifier not found".into()))?;

        let user = match export_identifier.user.or(import_identifier.user) {
            Some(user_id) => self.repo.user_by_id(&user_id).await?,
            None => None,
        };

        let needs_invitation = user.as_ref().map(UserDoc::is_bare).unwrap_or(true);
        if needs_invitation {
            self.invite_bare_user(&import_identifier, &export_identifier, user.as_ref())
                .await?;
        }

        let (service_import, service_export) = tokio::join!(
            self.repo.service_by_id(&import_identifier.service),
            self.repo.service_by_id(&export_identifier.service),
        );
        let service_import = service_import?
            .ok_or_else(|| CovenantError::NotFound("Import service not found".into()))?;
        let service_export = service_export?
            .ok_or_else(|| CovenantError::NotFound("Export service not found".into()))?;
        let export_id = required_id(&service_export)?;

        update_status(&mut ce, FollowCode::DataReleased, &service_export.name);
        self.repo.save_consent(&ce).await?;

        let data_import_endpoint = resolve_endpoint(
            &import_identifier,
            &export_id,
            &service_import,
            EndpointKind::DataImport,
        )?;

        Ok(VerificationResponse {
            user_import: PartyInfo {
                email: import_identifier.email,
                user_service_id: import_identifier.user_service_id,
            },
            user_export: PartyInfo {
                email: export_identifier.email,
                user_service_id: export_identifier.user_service_id,
            },
            data_import_endpoint,
            datatypes,
        })
    }

    /// Resume a 2050 exchange once the import service reports the verified
    /// account creation
    pub async fn verify_consent_on_account_creation(
        &self,
        service_import: &ServiceDoc,
        consent_id: &ObjectId,
        user_key: &str,
    ) -> Result<ObjectId> {
        let guard = self.lock_for(consent_id);
        let _held = guard.lock().await;

        let mut ce = self.require_consent(consent_id).await?;

        if ce.verified == 1 {
            return Err(CovenantError::conflict(
                "ECONSENTALREADYVERIFIED",
                "This consent has already been verified",
            ));
        }

        let import_id = required_id(service_import)?;
        let mut import_identifier = self
            .repo
            .identifier_by_user_key(&import_id, user_key)
            .await?
            .ok_or_else(|| {
                CovenantError::NotFound(
                    "Could not find user using the user key provided".into(),
                )
            })?;
        let import_identifier_id = identifier_id(&import_identifier)?;

        // Account creation was itself email-verified by the import service
        import_identifier.email_verified = true;
        self.repo.save_identifier(&import_identifier).await?;

        let mut export_identifier = self
            .repo
            .identifier_by_id(&ce.user_export_id)
            .await?
            .ok_or_else(|| CovenantError::NotFound("Export identifier not found".into()))?;

        let service_export = self
            .repo
            .service_by_id(&export_identifier.service)
            .await?
            .ok_or_else(|| CovenantError::NotFound("Export service not found".into()))?;

        ce.user_import_id = Some(import_identifier_id);
        ce.verified = 1;
        ce.consented = true;
        update_status(&mut ce, FollowCode::ExportVerified, "");
        self.repo.save_consent(&ce).await?;

        reconcile_identifiers(
            self.repo.as_ref(),
            &mut import_identifier,
            &mut export_identifier,
        )
        .await?;

        self.relay_consent(
            &mut ce,
            service_import,
            &service_export,
            &import_identifier,
            &export_identifier,
            None,
            FollowCode::ExportDelivered,
        )
        .await?;

        Ok(*consent_id)
    }

    /// Interop partner hands back the envelope it received; verify it and
    /// point the partner at the import service's data endpoint
    pub async fn verify_interop_consent(&self, signed_consent: &str) -> Result<String> {
        let payload = self.signer.decode(signed_consent)?;
        let consent_id = ObjectId::parse_str(&payload.consent_id)
            .map_err(|_| CovenantError::Decode("invalid consent id in envelope".into()))?;

        let ce = self.require_consent(&consent_id).await?;

        let import_identifier_id = ce.user_import_id.ok_or_else(|| {
            CovenantError::NotFound("Import identifier not attached to this consent".into())
        })?;
        let import_identifier = self
            .repo
            .identifier_by_id(&import_identifier_id)
            .await?
            .ok_or_else(|| {
                CovenantError::NotFound("The user identifier in the import service was not found".into())
            })?;

        let service_import = self
            .repo
            .service_by_id(&import_identifier.service)
            .await?
            .ok_or_else(|| CovenantError::NotFound("Import service not found".into()))?;

        service_import.urls.data_import.clone().ok_or_else(|| {
            CovenantError::NotFound(format!(
                "The dataImport endpoint is not configured for service {}",
                service_import.name
            ))
        })
    }

    /// Status follow endpoint
    pub async fn consent_status(&self, consent_id: &ObjectId) -> Result<StatusView> {
        let ce = self.require_consent(consent_id).await?;
        Ok(StatusView {
            consent_id: *consent_id,
            follow_code: ce.status.follow_code,
            text: ce.status.text,
            verified: ce.verified,
            consented: ce.consented,
            flow: ce.flow,
            timestamp: ce.timestamp,
        })
    }

    // Internal helpers

    async fn require_consent(&self, consent_id: &ObjectId) -> Result<ConsentExchangeDoc> {
        self.repo.consent_by_id(consent_id).await?.ok_or_else(|| {
            CovenantError::NotFound(
                "Consent not found, please verify the consent id provided".into(),
            )
        })
    }

    /// Reuse a pending exchange between the same parties or open a new one.
    /// Matches both unverified exchanges and verified checkpoints stranded
    /// by a failed delivery, so retries converge on one record.
    async fn open_exchange(
        &self,
        due_id: &ObjectId,
        import_identifier_id: &ObjectId,
        export_identifier_id: &ObjectId,
        data: Vec<ConsentData>,
        flow_kind: i32,
    ) -> Result<ConsentExchangeDoc> {
        if let Some(mut existing) = self
            .repo
            .pending_exchange(due_id, import_identifier_id, export_identifier_id)
            .await?
        {
            info!(
                consent_id = %exchange_id(&existing)?.to_hex(),
                "reusing pending exchange for retried start"
            );
            existing.data = data;
            existing.email_token = None;
            existing.verified = 0;
            existing.consented = false;
            self.repo.save_consent(&existing).await?;
            return Ok(existing);
        }

        let started = if flow_kind == flow::EXPORT {
            FollowCode::ExportStarted
        } else {
            FollowCode::ImportStarted
        };
        let mut ce = ConsentExchangeDoc {
            data,
            user_import_id: Some(*import_identifier_id),
            user_export_id: *export_identifier_id,
            data_use_exchange: *due_id,
            flow: flow_kind,
            ..Default::default()
        };
        update_status(&mut ce, started, "");
        let id = self.repo.insert_consent(ce.clone()).await?;
        ce._id = Some(id);
        Ok(ce)
    }

    async fn pause_for_email(
        &self,
        ce: &mut ConsentExchangeDoc,
        email: &str,
        code: FollowCode,
    ) -> Result<StartOutcome> {
        let token = make_id(EMAIL_TOKEN_LEN);
        let expires = hours_from_now(self.settings.email_token_expiry_hours);

        ce.email_token = Some(EmailToken {
            token: token.clone(),
            expires,
        });
        update_status(ce, code, email);
        self.repo.save_consent(ce).await?;

        let validation_url = format!(
            "{}/consents/email/validation/{}",
            self.settings.public_url.trim_end_matches('/'),
            token
        );
        self.mailer
            .send_verification_email(email, &validation_url)
            .await?;

        Ok(StartOutcome::EmailPending {
            consent_id: exchange_id(ce)?,
            email: email.to_string(),
        })
    }

    /// Sign, resolve the partner consent endpoint, deliver, and stamp the
    /// delivered status. The verified checkpoint is already persisted, so a
    /// delivery failure leaves the exchange resumable where it is.
    #[allow(clippy::too_many_arguments)]
    async fn relay_consent(
        &self,
        ce: &mut ConsentExchangeDoc,
        service_import: &ServiceDoc,
        service_export: &ServiceDoc,
        import_identifier: &IdentifierDoc,
        export_identifier: &IdentifierDoc,
        purpose_name: Option<String>,
        delivered_code: FollowCode,
    ) -> Result<String> {
        let consent_id = exchange_id(ce)?;
        let import_id = required_id(service_import)?;

        let payload = SignedConsentPayload {
            service_import_name: service_import.name.clone(),
            service_export_name: service_export.name.clone(),
            purpose_name,
            user_import_id: import_identifier.user_service_id.clone(),
            user_export_id: export_identifier.user_service_id.clone(),
            email_import: import_identifier.email.clone(),
            email_export: export_identifier.email.clone(),
            consent_id: consent_id.to_hex(),
            token: None,
        };
        let signed_consent = self.signer.sign(&payload)?;

        let url = resolve_endpoint(
            export_identifier,
            &import_id,
            service_export,
            EndpointKind::ConsentExport,
        )?;

        self.delivery
            .deliver(&url, &DeliveryBody::new(signed_consent.clone()))
            .await?;

        update_status(ce, delivered_code, &service_export.name);
        self.repo.save_consent(ce).await?;

        Ok(signed_consent)
    }

    /// Mint a confirmation account and send the invitation. Mail failure is
    /// logged and does not fail the verification.
    async fn invite_bare_user(
        &self,
        import_identifier: &IdentifierDoc,
        export_identifier: &IdentifierDoc,
        user: Option<&UserDoc>,
    ) -> Result<()> {
        let token = make_id(CONFIRMATION_TOKEN_LEN);
        let mut confirm = ConfirmationAccountDoc {
            email: import_identifier.email.clone(),
            token: token.clone(),
            expires: hours_from_now(self.settings.confirmation_expiry_hours),
            ..Default::default()
        };

        match user.and_then(|u| u._id) {
            Some(user_id) => confirm.user = Some(user_id),
            None => {
                confirm.identifiers = vec![
                    identifier_id(export_identifier)?,
                    identifier_id(import_identifier)?,
                ]
            }
        }

        self.repo.insert_confirmation_account(confirm).await?;

        if let Err(e) = self
            .mailer
            .send_exchange_complete_email(&export_identifier.email, &import_identifier.email, &token)
            .await
        {
            error!(error = %e, "failed to send exchange complete email");
        }

        Ok(())
    }
}

fn interop_for(request: &StartExportRequest) -> Interoperability {
    match request.interop_service {
        Some(interop_service) => Interoperability {
            active: true,
            interop_service: Some(interop_service),
        },
        None => Interoperability::default(),
    }
}

/// Keep exactly the entries configured for this exporting service that the
/// person actually selected
fn project_datatypes(
    due: &DataUseExchangeDoc,
    service_export: &ObjectId,
    selections: &[DatatypeSelection],
) -> Result<Vec<ConsentData>> {
    let data: Vec<ConsentData> = due
        .data
        .iter()
        .filter(|entry| &entry.service_export == service_export)
        .filter_map(|entry| {
            selections
                .iter()
                .find(|s| s.id == entry.datatype)
                .map(|s| ConsentData {
                    datatype: entry.datatype,
                    authorized: s.checked,
                })
        })
        .collect();

    if data.is_empty() {
        return Err(CovenantError::invalid(
            "ENODATATYPES",
            "No datatypes or wrong format was used in the request body. Please check that \
             the ids of the datatypes match the configured exchange",
        ));
    }

    Ok(data)
}

fn make_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn hours_from_now(hours: i64) -> DateTime {
    DateTime::from_millis(DateTime::now().timestamp_millis() + hours * 60 * 60 * 1000)
}

fn required_id(service: &ServiceDoc) -> Result<ObjectId> {
    service
        ._id
        .ok_or_else(|| CovenantError::Internal("service has no id".into()))
}

fn identifier_id(identifier: &IdentifierDoc) -> Result<ObjectId> {
    identifier
        ._id
        .ok_or_else(|| CovenantError::Internal("identifier has no id".into()))
}

fn exchange_id(ce: &ConsentExchangeDoc) -> Result<ObjectId> {
    ce._id
        .ok_or_else(|| CovenantError::Internal("consent exchange has no id".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDelivery;

    #[async_trait::async_trait]
    impl ConsentDelivery for NoDelivery {
        async fn deliver(&self, _url: &str, _body: &DeliveryBody) -> Result<()> {
            Ok(())
        }
    }

    fn test_engine() -> ConsentEngine {
        ConsentEngine::new(
            Arc::new(crate::repo::MemoryRepository::new()),
            Arc::new(NoDelivery),
            Arc::new(crate::consent::email::LogMailer),
            ConsentSigner::from_seed([7u8; 32]),
            EngineSettings {
                public_url: "https://covenant.test".into(),
                email_token_expiry_hours: 24,
                confirmation_expiry_hours: 24,
            },
        )
    }

    #[tokio::test]
    async fn lock_map_sheds_entries_once_released() {
        let engine = test_engine();

        let first = ObjectId::new();
        {
            let lock = engine.lock_for(&first);
            let _held = lock.lock().await;
            assert_eq!(engine.locks.len(), 1);
        }

        // The next acquisition evicts the released entry
        let second = ObjectId::new();
        let _lock = engine.lock_for(&second);
        assert_eq!(engine.locks.len(), 1);
    }

    #[test]
    fn make_id_has_requested_length_and_charset() {
        let id = make_id(40);
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn projection_keeps_only_selected_configured_entries() {
        let export = ObjectId::new();
        let other_export = ObjectId::new();
        let dt_a = ObjectId::new();
        let dt_b = ObjectId::new();
        let dt_foreign = ObjectId::new();

        let due = DataUseExchangeDoc {
            data: vec![
                crate::db::schemas::DueEntry {
                    datatype: dt_a,
                    service_export: export,
                    authorized: true,
                },
                crate::db::schemas::DueEntry {
                    datatype: dt_b,
                    service_export: export,
                    authorized: true,
                },
                crate::db::schemas::DueEntry {
                    datatype: dt_foreign,
                    service_export: other_export,
                    authorized: true,
                },
            ],
            ..Default::default()
        };

        let selections = vec![
            DatatypeSelection {
                id: dt_a,
                checked: true,
            },
            DatatypeSelection {
                id: dt_foreign,
                checked: true,
            },
        ];

        let data = project_datatypes(&due, &export, &selections).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].datatype, dt_a);
        assert!(data[0].authorized);
    }

    #[test]
    fn projection_with_no_overlap_is_rejected() {
        let due = DataUseExchangeDoc {
            data: vec![crate::db::schemas::DueEntry {
                datatype: ObjectId::new(),
                service_export: ObjectId::new(),
                authorized: true,
            }],
            ..Default::default()
        };
        let err = project_datatypes(&due, &ObjectId::new(), &[]).unwrap_err();
        assert_eq!(err.code(), Some("ENODATATYPES"));
    }
}
