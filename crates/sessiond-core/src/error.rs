//! Stable error kinds for the daemon's public surface.
//!
//! Every recoverable failure that can cross the RPC boundary maps to one
//! of these kinds; each kind carries a stable integer code for the wire.
//! Module-local error enums (owner key, policy store, keystore) convert
//! into these at the session-manager boundary.

use thiserror::Error;

/// Recoverable errors returned to the caller that triggered them.
///
/// The set is stable: codes must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The supplied email address failed validation.
    #[error("provided email address is not valid")]
    InvalidEmail,

    /// A session for this user already exists.
    #[error("provided email address already started a session")]
    SessionExists,

    /// No session exists for the addressed user.
    #[error("no session exists for the given user")]
    NoSession,

    /// The supplied pid does not belong to the supervised browser.
    #[error("provided pid is unknown")]
    UnknownPid,

    /// A public key was malformed or could not be exercised.
    #[error("illegal public key")]
    IllegalPubkey,

    /// Signature verification failed; terminal for this request.
    #[error("signature could not be verified")]
    VerifyFail,

    /// An operation required the owner key before one was set.
    #[error("no owner key is set")]
    NoOwnerKey,

    /// The user's keystore could not be opened.
    #[error("could not open the user's keystore")]
    NoUserKeystore,

    /// A per-user policy service failed to initialize.
    #[error("user policy failed to initialize")]
    PolicyInitFail,

    /// Response data could not be encoded.
    #[error("failed to encode response data")]
    EncodeFail,

    /// Request data could not be decoded.
    #[error("failed to decode request data")]
    DecodeFail,

    /// An init-system event could not be emitted.
    #[error("failed to emit event")]
    EmitFailed,

    /// The operation is gated on no session having started this boot.
    #[error("a user has already logged in this boot")]
    AlreadySession,

    /// The caller failed service-level authentication.
    #[error("caller is not an allowed service")]
    IllegalService,
}

impl SessionError {
    /// Stable integer code for the wire representation of this kind.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::InvalidEmail => 1,
            Self::SessionExists => 2,
            Self::NoSession => 3,
            Self::UnknownPid => 4,
            Self::IllegalPubkey => 5,
            Self::VerifyFail => 6,
            Self::NoOwnerKey => 7,
            Self::NoUserKeystore => 8,
            Self::PolicyInitFail => 9,
            Self::EncodeFail => 10,
            Self::DecodeFail => 11,
            Self::EmitFailed => 12,
            Self::AlreadySession => 13,
            Self::IllegalService => 14,
        }
    }
}
