//! End-to-end exchange flows against the in-memory repository
//!
//! Delivery and mail are recorded rather than sent, so each test can assert
//! both the stored exchange state and the traffic a partner backend would
//! have seen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bson::oid::ObjectId;
use tokio::sync::Mutex;

use covenant::consent::delivery::{ConsentDelivery, DeliveryBody};
use covenant::consent::email::Mailer;
use covenant::consent::engine::{
    DatatypeSelection, EmailValidationOutcome, EngineSettings, StartExportRequest,
    StartImportRequest, StartOutcome,
};
use covenant::consent::{ConsentEngine, ConsentSigner};
use covenant::db::schemas::{
    auth_method, AuthInfoDoc, DataTypeDoc, DataTypeFieldDoc, DataUseExchangeDoc, DueEntry,
    IdentifierDoc, PurposeDoc, ServiceDoc, ServiceUrls,
};
use covenant::repo::{ConsentRepository, MemoryRepository};
use covenant::types::CovenantError;

#[derive(Default)]
struct RecordingDelivery {
    sent: Mutex<Vec<(String, DeliveryBody)>>,
    fail: AtomicBool,
}

impl RecordingDelivery {
    async fn deliveries(&self) -> Vec<(String, DeliveryBody)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl ConsentDelivery for RecordingDelivery {
    async fn deliver(&self, url: &str, body: &DeliveryBody) -> covenant::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CovenantError::Dependency {
                url: url.to_string(),
                detail: "connection refused".into(),
            });
        }
        self.sent.lock().await.push((url.to_string(), body.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingMailer {
    verifications: Mutex<Vec<(String, String)>>,
    completions: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_verification_email(&self, to: &str, validation_url: &str) -> covenant::Result<()> {
        self.verifications
            .lock()
            .await
            .push((to.to_string(), validation_url.to_string()));
        Ok(())
    }

    async fn send_exchange_complete_email(
        &self,
        to: &str,
        email_import: &str,
        confirmation_token: &str,
    ) -> covenant::Result<()> {
        self.completions.lock().await.push((
            to.to_string(),
            email_import.to_string(),
            confirmation_token.to_string(),
        ));
        Ok(())
    }
}

/// One fully seeded exchange scenario between two services
struct World {
    repo: Arc<MemoryRepository>,
    engine: ConsentEngine,
    delivery: Arc<RecordingDelivery>,
    mailer: Arc<RecordingMailer>,
    service_import: ServiceDoc,
    service_export: ServiceDoc,
    purpose_id: ObjectId,
    dt_steps: ObjectId,
    dt_sleep: ObjectId,
    import_identifier_id: ObjectId,
    export_identifier_id: ObjectId,
}

const EMAIL_IMPORT: &str = "ana@import.test";
const EMAIL_EXPORT: &str = "ana@export.test";
const IMPORT_USER_KEY: &str = "uk-import-1";
const EXPORT_USER_KEY: &str = "uk-export-1";

impl World {
    /// Seed two services, one purpose, two datatypes, a DUE, and both
    /// identifiers. `export_auth` picks the export service's user auth style.
    async fn new(export_auth: i32) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let delivery = Arc::new(RecordingDelivery::default());
        let mailer = Arc::new(RecordingMailer::default());

        let import_id = repo
            .add_service(ServiceDoc {
                name: "Lumen".into(),
                service_key: "key-lumen".into(),
                auth_method: auth_method::TOKEN,
                urls: ServiceUrls {
                    consent_import: Some("https://lumen.test/consent/import".into()),
                    data_import: Some("https://lumen.test/data/import".into()),
                    register_url: Some("https://lumen.test/register".into()),
                    website: Some("https://lumen.test".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;

        let export_id = repo
            .add_service(ServiceDoc {
                name: "Atlas".into(),
                service_key: "key-atlas".into(),
                auth_method: export_auth,
                urls: ServiceUrls {
                    consent_export: Some("https://atlas.test/consent/export".into()),
                    data_export: Some("https://atlas.test/data/export".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;

        let purpose_id = repo
            .add_purpose(PurposeDoc {
                name: "activity research".into(),
                service: import_id,
                ..Default::default()
            })
            .await;

        let dt_steps = repo
            .add_datatype(DataTypeDoc {
                name: "steps".into(),
                provenance: export_id,
                ..Default::default()
            })
            .await;
        let dt_sleep = repo
            .add_datatype(DataTypeDoc {
                name: "sleep".into(),
                provenance: export_id,
                ..Default::default()
            })
            .await;

        repo.add_datatype_fields(DataTypeFieldDoc {
            datatype: dt_steps,
            table: "activity".into(),
            fields: vec!["steps".into(), "date".into()],
            ..Default::default()
        })
        .await;

        repo.add_due(DataUseExchangeDoc {
            service_import: import_id,
            purpose: purpose_id,
            data: vec![
                DueEntry {
                    datatype: dt_steps,
                    service_export: export_id,
                    authorized: true,
                },
                DueEntry {
                    datatype: dt_sleep,
                    service_export: export_id,
                    authorized: true,
                },
            ],
            ..Default::default()
        })
        .await;

        let import_identifier_id = repo
            .insert_identifier(IdentifierDoc {
                service: import_id,
                email: EMAIL_IMPORT.into(),
                user_service_id: "lumen-77".into(),
                user_key: IMPORT_USER_KEY.into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let export_identifier_id = repo
            .insert_identifier(IdentifierDoc {
                service: export_id,
                email: EMAIL_EXPORT.into(),
                user_service_id: "atlas-4".into(),
                user_key: EXPORT_USER_KEY.into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let dyn_repo: Arc<dyn ConsentRepository> = repo.clone();
        let engine = ConsentEngine::new(
            dyn_repo,
            delivery.clone(),
            mailer.clone(),
            ConsentSigner::from_seed([42u8; 32]),
            EngineSettings {
                public_url: "https://covenant.test".into(),
                email_token_expiry_hours: 48,
                confirmation_expiry_hours: 24,
            },
        );

        let service_import = repo.service_by_id(&import_id).await.unwrap().unwrap();
        let service_export = repo.service_by_id(&export_id).await.unwrap().unwrap();

        Self {
            repo,
            engine,
            delivery,
            mailer,
            service_import,
            service_export,
            purpose_id,
            dt_steps,
            dt_sleep,
            import_identifier_id,
            export_identifier_id,
        }
    }

    fn select_all(&self) -> Vec<DatatypeSelection> {
        vec![
            DatatypeSelection {
                id: self.dt_steps,
                checked: true,
            },
            DatatypeSelection {
                id: self.dt_sleep,
                checked: false,
            },
        ]
    }

    fn import_request(&self) -> StartImportRequest {
        StartImportRequest {
            service_export: "Atlas".into(),
            purpose: self.purpose_id,
            email_import: EMAIL_IMPORT.into(),
            email_export: EMAIL_EXPORT.into(),
            user_key: IMPORT_USER_KEY.into(),
            datatypes: self.select_all(),
        }
    }

    fn export_request(&self) -> StartExportRequest {
        StartExportRequest {
            purpose: self.purpose_id,
            email_import: Some(EMAIL_IMPORT.into()),
            email_export: EMAIL_EXPORT.into(),
            user_key: EXPORT_USER_KEY.into(),
            datatypes: self.select_all(),
            is_new_account: false,
            interop_service: None,
        }
    }

    async fn seed_export_auth_info(&self) {
        self.repo
            .add_auth_info(AuthInfoDoc {
                service: self.service_export._id.unwrap(),
                email: EMAIL_EXPORT.into(),
                access_token: "atlas-access".into(),
                ..Default::default()
            })
            .await;
    }

    async fn seed_import_auth_info(&self) {
        self.repo
            .add_auth_info(AuthInfoDoc {
                service: self.service_import._id.unwrap(),
                email: EMAIL_IMPORT.into(),
                access_token: "lumen-access".into(),
                ..Default::default()
            })
            .await;
    }

    async fn follow_code(&self, consent_id: &ObjectId) -> i32 {
        self.repo
            .consent_by_id(consent_id)
            .await
            .unwrap()
            .unwrap()
            .status
            .follow_code
    }
}

fn delivered(outcome: StartOutcome) -> (ObjectId, String) {
    match outcome {
        StartOutcome::Delivered {
            consent_id,
            signed_consent,
            ..
        } => (consent_id, signed_consent),
        other => panic!("expected delivered outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn import_flow_with_token_auth_delivers() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_export_auth_info().await;

    let outcome = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    let (consent_id, signed_consent) = delivered(outcome);

    assert_eq!(world.follow_code(&consent_id).await, 1300);

    let ce = world
        .repo
        .consent_by_id(&consent_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ce.verified, 1);
    assert!(ce.consented);
    assert_eq!(ce.authorized_datatypes(), vec![world.dt_steps]);

    let deliveries = world.delivery.deliveries().await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0, "https://atlas.test/consent/export");

    let payload = world.engine.signer().decode(&signed_consent).unwrap();
    assert_eq!(payload.service_import_name, "Lumen");
    assert_eq!(payload.service_export_name, "Atlas");
    assert_eq!(payload.email_export, EMAIL_EXPORT);
    assert_eq!(payload.consent_id, consent_id.to_hex());
    assert!(payload.token.is_none());
}

#[tokio::test]
async fn import_flow_without_auth_info_is_unauthorized() {
    let world = World::new(auth_method::TOKEN).await;

    let err = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap_err();
    assert!(matches!(err, CovenantError::Unauthorized(_)));
}

#[tokio::test]
async fn import_flow_rejects_unconfigured_datatypes() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_export_auth_info().await;

    let mut request = world.import_request();
    request.datatypes = vec![DatatypeSelection {
        id: ObjectId::new(),
        checked: true,
    }];

    let err = world
        .engine
        .start_import_exchange(&world.service_import, request)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("ENODATATYPES"));
}

#[tokio::test]
async fn import_flow_pauses_on_email_then_validates() {
    let world = World::new(auth_method::EMAIL).await;

    let outcome = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    let consent_id = match outcome {
        StartOutcome::EmailPending { consent_id, email } => {
            assert_eq!(email, EMAIL_EXPORT);
            consent_id
        }
        other => panic!("expected email pause, got {:?}", other),
    };

    assert_eq!(world.follow_code(&consent_id).await, 1150);
    assert!(world.delivery.deliveries().await.is_empty());

    // Extract the token from the mailed validation link
    let mails = world.mailer.verifications.lock().await.clone();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].0, EMAIL_EXPORT);
    let token = mails[0]
        .1
        .rsplit('/')
        .next()
        .unwrap()
        .to_string();
    assert_eq!(token.len(), 40);

    let outcome = world.engine.validate_email_token(&token).await.unwrap();
    let summary = match outcome {
        EmailValidationOutcome::Confirmed(summary) => summary,
        other => panic!("expected confirmation, got {:?}", other),
    };

    assert_eq!(summary.service_import, "Lumen");
    assert_eq!(summary.service_export, "Atlas");
    assert_eq!(summary.email_export, EMAIL_EXPORT);
    assert!(summary
        .datatypes
        .iter()
        .any(|(name, authorized)| name == "steps" && *authorized));
    assert!(summary
        .datatypes
        .iter()
        .any(|(name, authorized)| name == "sleep" && !*authorized));

    // Delivered after validation; token consumed; identifiers verified
    assert_eq!(world.follow_code(&consent_id).await, 1300);
    let ce = world
        .repo
        .consent_by_id(&consent_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ce.verified, 1);
    assert!(ce.email_token.is_none());

    let export_identifier = world
        .repo
        .identifier_by_id(&world.export_identifier_id)
        .await
        .unwrap()
        .unwrap();
    assert!(export_identifier.email_verified);

    assert_eq!(world.delivery.deliveries().await.len(), 1);

    // The link is single use
    let outcome = world.engine.validate_email_token(&token).await.unwrap();
    assert!(matches!(outcome, EmailValidationOutcome::AlreadyValidated));
}

#[tokio::test]
async fn unknown_validation_token_reads_as_already_validated() {
    let world = World::new(auth_method::EMAIL).await;
    let outcome = world
        .engine
        .validate_email_token("no-such-token")
        .await
        .unwrap();
    assert!(matches!(outcome, EmailValidationOutcome::AlreadyValidated));
}

#[tokio::test]
async fn expired_validation_token_leaves_exchange_untouched() {
    let world = World::new(auth_method::EMAIL).await;

    let outcome = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    let StartOutcome::EmailPending { consent_id, .. } = outcome else {
        panic!("expected email pause");
    };

    // Age the token past its expiry
    let mut ce = world
        .repo
        .consent_by_id(&consent_id)
        .await
        .unwrap()
        .unwrap();
    let token = ce.email_token.as_ref().unwrap().token.clone();
    ce.email_token.as_mut().unwrap().expires = bson::DateTime::from_millis(0);
    world.repo.save_consent(&ce).await.unwrap();

    let outcome = world.engine.validate_email_token(&token).await.unwrap();
    assert!(matches!(outcome, EmailValidationOutcome::Expired));

    let after = world
        .repo
        .consent_by_id(&consent_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status.follow_code, 1150);
    assert_eq!(after.verified, 0);
    assert!(after.email_token.is_some());
    assert!(world.delivery.deliveries().await.is_empty());
}

#[tokio::test]
async fn retried_start_reuses_the_pending_exchange() {
    let world = World::new(auth_method::EMAIL).await;

    let first = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    let StartOutcome::EmailPending { consent_id: a, .. } = first else {
        panic!("expected email pause");
    };

    let second = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    let StartOutcome::EmailPending { consent_id: b, .. } = second else {
        panic!("expected email pause");
    };

    assert_eq!(a, b);
}

#[tokio::test]
async fn delivery_failure_leaves_the_verified_checkpoint() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_export_auth_info().await;
    world.delivery.fail.store(true, Ordering::SeqCst);

    let err = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap_err();
    let CovenantError::Dependency { url, .. } = err else {
        panic!("expected dependency error");
    };
    assert_eq!(url, "https://atlas.test/consent/export");

    // The exchange stays at the verified checkpoint, ready for retry
    let consents = world.repo.consents().await;
    assert_eq!(consents.len(), 1);
    assert_eq!(consents[0].status.follow_code, 1200);
    assert_eq!(consents[0].verified, 1);
}

#[tokio::test]
async fn retried_start_resumes_the_verified_checkpoint() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_export_auth_info().await;
    world.delivery.fail.store(true, Ordering::SeqCst);

    let err = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap_err();
    assert!(matches!(err, CovenantError::Dependency { .. }));

    world.delivery.fail.store(false, Ordering::SeqCst);
    let outcome = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    let (consent_id, _) = delivered(outcome);

    // The retry converges on the checkpointed exchange and completes it
    let consents = world.repo.consents().await;
    assert_eq!(consents.len(), 1);
    assert_eq!(consents[0]._id, Some(consent_id));
    assert_eq!(consents[0].status.follow_code, 1300);
    assert_eq!(consents[0].verified, 1);
}

#[tokio::test]
async fn import_flow_rejects_a_mismatched_import_email() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_export_auth_info().await;

    let mut request = world.import_request();
    request.email_import = "someone.else@import.test".into();

    let err = world
        .engine
        .start_import_exchange(&world.service_import, request)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("EBADEMAIL"));
}

#[tokio::test]
async fn export_flow_skips_the_email_pause_when_emails_match() {
    let world = World::new(auth_method::TOKEN).await;

    // Import side authenticates by email
    let mut service_import = world.service_import.clone();
    service_import.auth_method = auth_method::EMAIL;
    world.repo.add_service(service_import).await;

    // Same address on both sides, import side not yet email-verified
    let mut import_identifier = world
        .repo
        .identifier_by_id(&world.import_identifier_id)
        .await
        .unwrap()
        .unwrap();
    import_identifier.email = EMAIL_EXPORT.into();
    import_identifier.email_verified = false;
    world.repo.save_identifier(&import_identifier).await.unwrap();

    let mut request = world.export_request();
    request.email_import = Some(EMAIL_EXPORT.into());

    // The export-side authentication just verified this same address
    let outcome = world
        .engine
        .start_export_exchange(&world.service_export, request)
        .await
        .unwrap();
    let (consent_id, _) = delivered(outcome);

    assert_eq!(world.follow_code(&consent_id).await, 2300);
    assert!(world.mailer.verifications.lock().await.is_empty());
}

#[tokio::test]
async fn export_flow_delivers_with_redirection() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_import_auth_info().await;

    let outcome = world
        .engine
        .start_export_exchange(&world.service_export, world.export_request())
        .await
        .unwrap();
    let StartOutcome::Delivered {
        consent_id,
        signed_consent,
        redirection_url,
    } = outcome
    else {
        panic!("expected delivered outcome");
    };

    assert_eq!(redirection_url.as_deref(), Some("https://lumen.test"));
    assert_eq!(world.follow_code(&consent_id).await, 2300);

    // Export-initiated envelopes carry the purpose name
    let payload = world.engine.signer().decode(&signed_consent).unwrap();
    assert_eq!(payload.purpose_name.as_deref(), Some("activity research"));

    // The export-side identifier was just authenticated, so it is verified
    let export_identifier = world
        .repo
        .identifier_by_id(&world.export_identifier_id)
        .await
        .unwrap()
        .unwrap();
    assert!(export_identifier.email_verified);
}

#[tokio::test]
async fn export_flow_requires_import_email_for_existing_accounts() {
    let world = World::new(auth_method::TOKEN).await;

    let mut request = world.export_request();
    request.email_import = None;

    let err = world
        .engine
        .start_export_exchange(&world.service_export, request)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("EMISSINGEMAIL"));
}

#[tokio::test]
async fn export_flow_pauses_for_account_creation_then_resumes() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_import_auth_info().await;

    let mut request = world.export_request();
    request.is_new_account = true;
    request.email_import = None;

    let outcome = world
        .engine
        .start_export_exchange(&world.service_export, request)
        .await
        .unwrap();
    let StartOutcome::AwaitingAccount {
        consent_id,
        redirection_url,
    } = outcome
    else {
        panic!("expected account pause");
    };

    assert_eq!(redirection_url.as_deref(), Some("https://lumen.test"));
    assert_eq!(world.follow_code(&consent_id).await, 2050);

    let paused = world
        .repo
        .consent_by_id(&consent_id)
        .await
        .unwrap()
        .unwrap();
    assert!(paused.user_import_id.is_none());

    // The import service reports the verified account creation
    let resumed = world
        .engine
        .verify_consent_on_account_creation(&world.service_import, &consent_id, IMPORT_USER_KEY)
        .await
        .unwrap();
    assert_eq!(resumed, consent_id);
    assert_eq!(world.follow_code(&consent_id).await, 2300);

    let ce = world
        .repo
        .consent_by_id(&consent_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ce.user_import_id, Some(world.import_identifier_id));
    assert_eq!(ce.verified, 1);

    // Resuming again is a conflict
    let err = world
        .engine
        .verify_consent_on_account_creation(&world.service_import, &consent_id, IMPORT_USER_KEY)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("ECONSENTALREADYVERIFIED"));
}

#[tokio::test]
async fn attach_token_relays_endpoints_to_the_import_service() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_export_auth_info().await;

    let outcome = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    let (consent_id, _) = delivered(outcome);

    let (attached_id, service_import_name) = world
        .engine
        .attach_token(&world.service_export, &consent_id, "atlas-token-9")
        .await
        .unwrap();
    assert_eq!(attached_id, consent_id);
    assert_eq!(service_import_name, "Lumen");
    assert_eq!(world.follow_code(&consent_id).await, 3000);

    let deliveries = world.delivery.deliveries().await;
    let (url, body) = deliveries.last().unwrap();
    assert_eq!(url, "https://lumen.test/consent/import");
    assert_eq!(
        body.service_export_url.as_deref(),
        Some("https://atlas.test/data/export")
    );
    assert_eq!(
        body.data_import_url.as_deref(),
        Some("https://lumen.test/data/import")
    );

    let payload = world.engine.signer().decode(&body.signed_consent).unwrap();
    assert_eq!(payload.token.as_deref(), Some("atlas-token-9"));
}

#[tokio::test]
async fn attach_token_caps_the_token_size() {
    let world = World::new(auth_method::TOKEN).await;
    let err = world
        .engine
        .attach_token(&world.service_export, &ObjectId::new(), &"x".repeat(51))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("ETOKENSIZE"));
}

#[tokio::test]
async fn verification_releases_fields_and_invites_the_bare_user() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_export_auth_info().await;

    let outcome = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    let (consent_id, _) = delivered(outcome);

    world
        .engine
        .attach_token(&world.service_export, &consent_id, "atlas-token-9")
        .await
        .unwrap();

    let verification = world
        .engine
        .verify_token_and_user_identity(&consent_id)
        .await
        .unwrap();

    assert_eq!(world.follow_code(&consent_id).await, 4000);
    assert_eq!(verification.user_import.email, EMAIL_IMPORT);
    assert_eq!(verification.user_export.email, EMAIL_EXPORT);
    assert_eq!(
        verification.data_import_endpoint,
        "https://lumen.test/data/import"
    );

    // Only the authorized datatype is released, expanded to its fields
    assert_eq!(verification.datatypes.len(), 1);
    let released = &verification.datatypes[0];
    assert_eq!(released.name, "steps");
    assert_eq!(released.table.as_deref(), Some("activity"));
    assert_eq!(
        released.fields.as_deref(),
        Some(&["steps".to_string(), "date".to_string()][..])
    );

    // The reconciled user has no account yet, so an invitation goes out
    let accounts = world.repo.confirmation_accounts().await;
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].email, EMAIL_IMPORT);
    assert_eq!(accounts[0].token.len(), 50);

    let completions = world.mailer.completions.lock().await.clone();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, EMAIL_EXPORT);
    assert_eq!(completions[0].1, EMAIL_IMPORT);
    assert_eq!(completions[0].2, accounts[0].token);
}

#[tokio::test]
async fn interop_exchange_relays_through_the_partner_network() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_import_auth_info().await;

    let interop_id = world
        .repo
        .add_service(ServiceDoc {
            name: "Nexus".into(),
            service_key: "key-nexus".into(),
            urls: ServiceUrls {
                consent_import: Some("https://nexus.test/consent/import".into()),
                data_import: Some("https://nexus.test/data/import".into()),
                ..Default::default()
            },
            ..Default::default()
        })
        .await;

    let mut request = world.export_request();
    request.interop_service = Some(interop_id);

    let outcome = world
        .engine
        .start_export_exchange(&world.service_export, request)
        .await
        .unwrap();
    let (consent_id, _) = delivered(outcome);

    world
        .engine
        .attach_token(&world.service_export, &consent_id, "atlas-token-9")
        .await
        .unwrap();
    assert_eq!(world.follow_code(&consent_id).await, 3050);

    let deliveries = world.delivery.deliveries().await;
    let (url, body) = deliveries.last().unwrap();
    assert_eq!(url, "https://nexus.test/consent/import");
    assert_eq!(
        body.data_import_url.as_deref(),
        Some("https://nexus.test/data/import")
    );

    // The partner network hands the envelope back for verification and is
    // pointed at the import service's data endpoint
    let data_import_url = world
        .engine
        .verify_interop_consent(&body.signed_consent)
        .await
        .unwrap();
    assert_eq!(data_import_url, "https://lumen.test/data/import");
}

#[tokio::test]
async fn interop_verification_rejects_tampered_envelopes() {
    let world = World::new(auth_method::TOKEN).await;
    let err = world
        .engine
        .verify_interop_consent("not-an-envelope")
        .await
        .unwrap_err();
    assert!(matches!(err, CovenantError::Decode(_)));
}

#[tokio::test]
async fn reconciliation_joins_both_identifiers_under_one_user() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_export_auth_info().await;

    let outcome = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    delivered(outcome);

    let import_identifier = world
        .repo
        .identifier_by_id(&world.import_identifier_id)
        .await
        .unwrap()
        .unwrap();
    let export_identifier = world
        .repo
        .identifier_by_id(&world.export_identifier_id)
        .await
        .unwrap()
        .unwrap();

    let user_id = import_identifier.user.expect("import identifier has user");
    assert_eq!(export_identifier.user, Some(user_id));

    let user = world.repo.user_by_id(&user_id).await.unwrap().unwrap();
    assert!(user.identifiers.contains(&world.import_identifier_id));
    assert!(user.identifiers.contains(&world.export_identifier_id));
    assert!(user.emails.contains(&EMAIL_IMPORT.to_string()));
    assert!(user.emails.contains(&EMAIL_EXPORT.to_string()));
    assert!(user.is_bare());
}

#[tokio::test]
async fn status_endpoint_reports_the_protocol_position() {
    let world = World::new(auth_method::TOKEN).await;
    world.seed_export_auth_info().await;

    let outcome = world
        .engine
        .start_import_exchange(&world.service_import, world.import_request())
        .await
        .unwrap();
    let (consent_id, _) = delivered(outcome);

    let status = world.engine.consent_status(&consent_id).await.unwrap();
    assert_eq!(status.follow_code, 1300);
    assert!(status.text.contains("Atlas"));
    assert_eq!(status.verified, 1);
    assert!(status.consented);

    let err = world
        .engine
        .consent_status(&ObjectId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CovenantError::NotFound(_)));
}
