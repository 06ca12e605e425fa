//! Signed consent envelopes
//!
//! The engine signs the consent summary it relays to partner backends and
//! verifies the same envelope when it comes back. The envelope is the JSON
//! payload bytes followed by a detached Ed25519 signature, base64 encoded as
//! one opaque string. Integrity and authenticity only; anybody holding the
//! verifying key can read the payload.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::types::{CovenantError, Result};

const SIGNATURE_LEN: usize = 64;

/// The consent summary carried inside a signed envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignedConsentPayload {
    pub service_import_name: String,

    pub service_export_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose_name: Option<String>,

    pub user_import_id: String,

    pub user_export_id: String,

    pub email_import: String,

    pub email_export: String,

    pub consent_id: String,

    /// Access token, present once the importing backend attached it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Signs and verifies consent envelopes with the node's Ed25519 keypair
#[derive(Clone)]
pub struct ConsentSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl ConsentSigner {
    /// Build from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Generate an ephemeral keypair (dev mode only)
    pub fn ephemeral() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Sign a payload into its base64 transport form
    pub fn sign(&self, payload: &SignedConsentPayload) -> Result<String> {
        let bytes = serde_json::to_vec(payload)?;
        let signature = self.signing_key.sign(&bytes);

        let mut envelope = bytes;
        envelope.extend_from_slice(&signature.to_bytes());
        Ok(BASE64.encode(envelope))
    }

    /// Decode and verify a base64 envelope produced by [`sign`](Self::sign)
    pub fn decode(&self, envelope: &str) -> Result<SignedConsentPayload> {
        if envelope.is_empty() {
            return Err(CovenantError::Decode("empty signed consent".into()));
        }

        let raw = BASE64
            .decode(envelope)
            .map_err(|e| CovenantError::Decode(format!("invalid base64: {}", e)))?;

        if raw.len() <= SIGNATURE_LEN {
            return Err(CovenantError::Decode("envelope too short".into()));
        }

        let (payload_bytes, sig_bytes) = raw.split_at(raw.len() - SIGNATURE_LEN);
        let sig_array: [u8; SIGNATURE_LEN] = sig_bytes
            .try_into()
            .map_err(|_| CovenantError::Decode("malformed signature".into()))?;
        let signature = Signature::from_bytes(&sig_array);

        self.verifying_key
            .verify(payload_bytes, &signature)
            .map_err(|_| CovenantError::Decode("signature verification failed".into()))?;

        serde_json::from_slice(payload_bytes)
            .map_err(|e| CovenantError::Decode(format!("invalid payload: {}", e)))
    }
}
