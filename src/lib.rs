//! Covenant - consent exchange gateway
//!
//! Covenant brokers personal-data exchanges between registered services. An
//! importing service asks for data, an exporting service releases it, and
//! nothing moves until the person in the middle has verifiably consented.
//!
//! ## Services
//!
//! - **Exchange**: the followCode state machine driving import and export flows
//! - **Identity**: cross-service identifier reconciliation into one user
//! - **Signing**: Ed25519-signed consent envelopes relayed between backends
//! - **Email**: validation links and exchange-complete notifications

pub mod auth;
pub mod config;
pub mod consent;
pub mod db;
pub mod repo;
pub mod routes;
pub mod server;
pub mod types;

pub use config::Args;
pub use consent::{ConsentEngine, ConsentSigner};
pub use server::{run, AppState};
pub use types::{CovenantError, Result};
