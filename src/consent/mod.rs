//! Consent exchange protocol
//!
//! The engine drives the followCode state machine; the submodules supply the
//! pieces it composes: status vocabulary, endpoint resolution, the signed
//! envelope codec, identity reconciliation, partner delivery, and mail.

pub mod codec;
pub mod delivery;
pub mod email;
pub mod endpoints;
pub mod engine;
pub mod identity;
pub mod status;

pub use codec::{ConsentSigner, SignedConsentPayload};
pub use delivery::{ConsentDelivery, DeliveryBody, HttpDelivery};
pub use email::{LogMailer, Mailer};
pub use endpoints::{resolve_endpoint, EndpointKind};
pub use engine::{
    ConsentEngine, EngineSettings, StartExportRequest, StartImportRequest, StartOutcome,
};
pub use status::FollowCode;
