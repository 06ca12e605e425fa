//! Consent status tracking
//!
//! Every exchange carries a numeric follow code plus a denormalized display
//! text. Codes in the 1xxx range belong to import-initiated exchanges, 2xxx
//! to export-initiated ones, 3xxx/4xxx to the shared token and verification
//! tail.

use crate::db::schemas::ConsentExchangeDoc;

/// Protocol position of a consent exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FollowCode {
    /// 1000: consent created (import flow)
    ImportStarted,
    /// 1100: identifiers and exchange data attached (import flow)
    ImportAttached,
    /// 1150: paused waiting on email validation (import flow)
    ImportEmailPending,
    /// 1200: verified (import flow)
    ImportVerified,
    /// 1300: signed and delivered to the export service (import flow)
    ImportDelivered,
    /// 2000: consent created (export flow)
    ExportStarted,
    /// 2050: paused waiting on account creation at the import service
    ExportAwaitingAccount,
    /// 2100: identifiers and exchange data attached (export flow)
    ExportAttached,
    /// 2150: paused waiting on email validation (export flow)
    ExportEmailPending,
    /// 2200: verified (export flow)
    ExportVerified,
    /// 2300: signed and delivered to the import service (export flow)
    ExportDelivered,
    /// 3000: access token attached and relayed to the export service
    TokenAttached,
    /// 3050: access token attached and relayed to an interop service
    TokenAttachedInterop,
    /// 4000: verified by the export backend, datatypes released
    DataReleased,
}

impl FollowCode {
    /// Numeric wire code
    pub fn code(self) -> i32 {
        match self {
            FollowCode::ImportStarted => 1000,
            FollowCode::ImportAttached => 1100,
            FollowCode::ImportEmailPending => 1150,
            FollowCode::ImportVerified => 1200,
            FollowCode::ImportDelivered => 1300,
            FollowCode::ExportStarted => 2000,
            FollowCode::ExportAwaitingAccount => 2050,
            FollowCode::ExportAttached => 2100,
            FollowCode::ExportEmailPending => 2150,
            FollowCode::ExportVerified => 2200,
            FollowCode::ExportDelivered => 2300,
            FollowCode::TokenAttached => 3000,
            FollowCode::TokenAttachedInterop => 3050,
            FollowCode::DataReleased => 4000,
        }
    }

    /// Parse a persisted numeric code
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1000 => FollowCode::ImportStarted,
            1100 => FollowCode::ImportAttached,
            1150 => FollowCode::ImportEmailPending,
            1200 => FollowCode::ImportVerified,
            1300 => FollowCode::ImportDelivered,
            2000 => FollowCode::ExportStarted,
            2050 => FollowCode::ExportAwaitingAccount,
            2100 => FollowCode::ExportAttached,
            2150 => FollowCode::ExportEmailPending,
            2200 => FollowCode::ExportVerified,
            2300 => FollowCode::ExportDelivered,
            3000 => FollowCode::TokenAttached,
            3050 => FollowCode::TokenAttachedInterop,
            4000 => FollowCode::DataReleased,
            _ => return None,
        })
    }

    /// Display text for this position. `param` is the partner service name
    /// or the email address, depending on the code.
    pub fn text(self, param: &str) -> String {
        match self {
            FollowCode::ImportStarted | FollowCode::ExportStarted => "Consent created.".into(),
            FollowCode::ImportAttached | FollowCode::ExportAttached => {
                "User identifiers and exchange data attached to consent.".into()
            }
            FollowCode::ImportEmailPending | FollowCode::ExportEmailPending => format!(
                "Consent paused and waiting on email validation sent to {}.",
                param
            ),
            FollowCode::ImportVerified | FollowCode::ExportVerified => {
                "Consent has been verified.".into()
            }
            FollowCode::ImportDelivered | FollowCode::ExportDelivered => {
                format!("Consent signed and sent to {}.", param)
            }
            FollowCode::ExportAwaitingAccount => format!(
                "User export identifier and exchange data attached to consent but user does \
                 not have an account in {}. Consent paused and waiting on an account to be \
                 created.",
                param
            ),
            FollowCode::TokenAttached => {
                format!("Token attached to consent and sent to {}.", param)
            }
            FollowCode::TokenAttachedInterop => {
                format!("Token attached and consent sent to interop service {}.", param)
            }
            FollowCode::DataReleased => {
                format!("Consent verified and datatypes sent to {}.", param)
            }
        }
    }

    /// Codes an exchange may legally be at immediately before moving here
    pub fn legal_predecessors(self) -> &'static [i32] {
        match self {
            FollowCode::ImportStarted | FollowCode::ExportStarted => &[],
            FollowCode::ImportAttached => &[1000],
            FollowCode::ImportEmailPending => &[1100],
            FollowCode::ImportVerified => &[1100, 1150],
            FollowCode::ImportDelivered => &[1200],
            FollowCode::ExportAwaitingAccount => &[2000],
            FollowCode::ExportAttached => &[2000, 2050],
            FollowCode::ExportEmailPending => &[2100],
            FollowCode::ExportVerified => &[2100, 2150],
            FollowCode::ExportDelivered => &[2200],
            FollowCode::TokenAttached => &[1300, 2300],
            FollowCode::TokenAttachedInterop => &[1300, 2300],
            FollowCode::DataReleased => &[3000, 3050],
        }
    }
}

/// Stamp a new protocol position onto the exchange (pure mutation, the
/// caller persists)
pub fn update_status(ce: &mut ConsentExchangeDoc, code: FollowCode, param: &str) {
    ce.status.follow_code = code.code();
    ce.status.text = code.text(param);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in [
            1000, 1100, 1150, 1200, 1300, 2000, 2050, 2100, 2150, 2200, 2300, 3000, 3050, 4000,
        ] {
            let parsed = FollowCode::from_code(code).unwrap();
            assert_eq!(parsed.code(), code);
        }
        assert!(FollowCode::from_code(6666).is_none());
        assert!(FollowCode::from_code(0).is_none());
    }

    #[test]
    fn texts_carry_param_where_expected() {
        assert_eq!(
            FollowCode::ImportEmailPending.text("a@b.test"),
            "Consent paused and waiting on email validation sent to a@b.test."
        );
        assert_eq!(
            FollowCode::ImportDelivered.text("Acme"),
            "Consent signed and sent to Acme."
        );
        assert_eq!(FollowCode::ImportStarted.text("ignored"), "Consent created.");
    }

    #[test]
    fn predecessors_form_a_connected_chain() {
        // Every non-initial code is reachable from some other code
        for code in [
            1100, 1150, 1200, 1300, 2050, 2100, 2150, 2200, 2300, 3000, 3050, 4000,
        ] {
            let fc = FollowCode::from_code(code).unwrap();
            assert!(!fc.legal_predecessors().is_empty(), "code {} unreachable", code);
            for pred in fc.legal_predecessors() {
                assert!(FollowCode::from_code(*pred).is_some());
            }
        }
    }

    #[test]
    fn update_status_stamps_code_and_text() {
        let mut ce = ConsentExchangeDoc::default();
        update_status(&mut ce, FollowCode::ExportAwaitingAccount, "Acme");
        assert_eq!(ce.status.follow_code, 2050);
        assert!(ce.status.text.contains("does not have an account in Acme"));
    }
}
