//! Database schemas for Covenant
//!
//! Defines MongoDB document structures for services, purposes, datatypes,
//! data-use exchanges, identities, and consent exchanges.

mod auth_info;
mod confirmation_account;
mod consent_exchange;
mod data_use_exchange;
mod identifier;
mod metadata;
mod purpose;
mod service;
mod user;

pub use auth_info::{AuthInfoDoc, AUTH_INFO_COLLECTION};
pub use confirmation_account::{ConfirmationAccountDoc, CONFIRMATION_ACCOUNT_COLLECTION};
pub use consent_exchange::{
    flow, ConsentData, ConsentExchangeDoc, ConsentStatus, EmailToken, Interoperability,
    CONSENT_EXCHANGE_COLLECTION,
};
pub use data_use_exchange::{DataUseExchangeDoc, DueEntry, DATA_USE_EXCHANGE_COLLECTION};
pub use identifier::{EndpointOverride, IdentifierDoc, IDENTIFIER_COLLECTION};
pub use metadata::Metadata;
pub use purpose::{
    DataTypeDoc, DataTypeFieldDoc, ImportedDatatype, PurposeDoc, DATATYPE_COLLECTION,
    DATATYPE_FIELD_COLLECTION, PURPOSE_COLLECTION,
};
pub use service::{auth_method, ServiceDoc, ServiceUrls, SERVICE_COLLECTION};
pub use user::{UserDoc, USER_COLLECTION};
