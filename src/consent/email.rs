//! Mail seam
//!
//! Verification and completion mails go through the [`Mailer`] trait. The
//! default implementation only logs; deployments wire in a real provider.

use async_trait::async_trait;
use tracing::info;

use crate::types::Result;

/// Outbound mail seam
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Email-validation pause: send the link that resumes the exchange
    async fn send_verification_email(&self, to: &str, validation_url: &str) -> Result<()>;

    /// Completion notice carrying the account-confirmation token for users
    /// who have not completed registration
    async fn send_exchange_complete_email(
        &self,
        to: &str,
        email_import: &str,
        confirmation_token: &str,
    ) -> Result<()>;
}

/// Logs instead of sending. Dev-mode default.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_verification_email(&self, to: &str, validation_url: &str) -> Result<()> {
        info!(to, validation_url, "verification email (log only)");
        Ok(())
    }

    async fn send_exchange_complete_email(
        &self,
        to: &str,
        email_import: &str,
        confirmation_token: &str,
    ) -> Result<()> {
        info!(
            to,
            email_import, confirmation_token, "exchange complete email (log only)"
        );
        Ok(())
    }
}
