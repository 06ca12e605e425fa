//! Configuration for Covenant
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use uuid::Uuid;

/// Covenant - consent exchange broker
#[derive(Parser, Debug, Clone)]
#[command(name = "covenant")]
#[command(about = "Brokers consent-gated data exchanges between services")]
pub struct Args {
    /// Unique node identifier for this broker instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "covenant")]
    pub mongodb_db: String,

    /// Ed25519 signing seed for consent envelopes, 32 bytes hex encoded.
    /// Required in production; dev mode generates an ephemeral key.
    #[arg(long, env = "SIGNING_KEY")]
    pub signing_key: Option<String>,

    /// Public base URL of this broker, used in email validation links
    /// (e.g. "https://consent.example.com")
    #[arg(long, env = "PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    /// Timeout for outbound partner endpoint calls, in milliseconds
    #[arg(long, env = "PARTNER_TIMEOUT_MS", default_value = "15000")]
    pub partner_timeout_ms: u64,

    /// Hours before an email verification token expires
    #[arg(long, env = "EMAIL_TOKEN_EXPIRY_HOURS", default_value = "48")]
    pub email_token_expiry_hours: i64,

    /// Hours before a confirmation account invitation expires
    #[arg(long, env = "CONFIRMATION_EXPIRY_HOURS", default_value = "24")]
    pub confirmation_expiry_hours: i64,

    /// Enable development mode (in-memory store fallback, ephemeral keys)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Decode the configured signing seed, if any
    pub fn signing_seed(&self) -> Result<Option<[u8; 32]>, String> {
        match self.signing_key {
            None => Ok(None),
            Some(ref key) => {
                let decoded =
                    hex::decode(key).map_err(|_| "SIGNING_KEY must be hex encoded".to_string())?;
                let seed: [u8; 32] = decoded
                    .try_into()
                    .map_err(|_| "SIGNING_KEY must be exactly 32 bytes".to_string())?;
                Ok(Some(seed))
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.signing_key.is_none() {
            return Err("SIGNING_KEY is required in production mode".to_string());
        }

        self.signing_seed()?;

        if self.partner_timeout_ms == 0 {
            return Err("PARTNER_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.email_token_expiry_hours <= 0 {
            return Err("EMAIL_TOKEN_EXPIRY_HOURS must be greater than zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev_args() -> Args {
        Args::parse_from(["covenant", "--dev-mode"])
    }

    #[test]
    fn dev_mode_allows_missing_signing_key() {
        assert!(dev_args().validate().is_ok());
    }

    #[test]
    fn production_requires_signing_key() {
        let args = Args::parse_from(["covenant"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn signing_key_must_be_32_byte_hex() {
        let mut args = dev_args();
        args.signing_key = Some("zz".into());
        assert!(args.validate().is_err());

        args.signing_key = Some("ab".repeat(8));
        assert!(args.validate().is_err());

        args.signing_key = Some("ab".repeat(32));
        assert!(args.validate().is_ok());
        let seed = args.signing_seed().unwrap().unwrap();
        assert_eq!(seed, [0xab; 32]);
    }
}
