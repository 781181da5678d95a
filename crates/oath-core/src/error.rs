//! Error types for the YubiKey OATH engine.
//!
//! This module provides a single error type [`enum@Error`] that covers every
//! failure mode of a presentment, from a truncated frame to a wrong password.
//!
//! # Error Categories
//!
//! | Category | Effect on the session |
//! |----------|-----------------------|
//! | Frame / transport | session aborts, surfaced as a generic failure |
//! | Authentication | session aborts, pending operations stay queued |
//! | Command-local | only the current command fails |
//! | Session | resumable context discarded or request refused |
//! | Provisioning | rejected before touching the queue or the token |
//!
//! Use [`Error::is_command_local`] and [`Error::is_auth_failure`] to decide how
//! to surface an error instead of matching on every variant.
//!
//! # Example
//!
//! ```
//! use yubikey_oath_core::Error;
//!
//! let err = Error::NoSpace;
//! assert!(err.is_command_local());
//! assert_eq!(err.to_string(), "no space left on the token");
//! ```

use core::result::Result as CoreResult;
use hex::FromHexError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

use crate::queue::OperationId;

/// The main error type for the YubiKey OATH engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Frame and Transport Errors
    // =========================================================================
    /// A frame had inconsistent length prefixes or no status word.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The token answered with a status word the command does not expect.
    #[error("unexpected status word: {0:#06x}")]
    UnexpectedStatusWord(u16),

    /// The transport failed to deliver a frame.
    #[error("transport error: {0}")]
    TransportError(String),

    /// No reader with a token was found.
    #[error("no YubiKey device found")]
    DeviceNotFound,

    /// Failed to connect to the reader.
    #[error("failed to connect to YubiKey: {0}")]
    ConnectionFailed(String),

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// The token rejected the VALIDATE response.
    #[error("wrong password")]
    WrongPassword,

    /// The token's counter-response did not match the expected value.
    #[error("token response does not match the expected value")]
    AuthMismatch,

    /// The applet requires authentication before this command.
    #[error("authentication required")]
    AuthRequired,

    /// An empty password was supplied where one is required.
    #[error("password must not be empty")]
    EmptyPassword,

    /// A MAC could not be keyed with the supplied key.
    #[error("invalid key length")]
    InvalidKeyLength,

    // =========================================================================
    // Command-local Errors
    // =========================================================================
    /// The token has no room for another credential.
    #[error("no space left on the token")]
    NoSpace,

    /// A credential with the same name already exists on the token.
    #[error("credential {0:?} already exists")]
    DuplicateName(String),

    /// The credential no longer exists on the token.
    #[error("credential {0:?} not found")]
    NotFound(String),

    /// The credential name does not fit the applet's name field.
    #[error("credential name is {0} bytes, at most 64 are allowed")]
    NameTooLong(usize),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// The re-presented token is not the one the suspended operation targets.
    #[error("token identity does not match the suspended session")]
    SessionIdentityMismatch,

    /// The token did not answer within the configured bound.
    #[error("token did not respond in time")]
    Timeout,

    /// The request is not valid in the current session state.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    /// No pending operation carries this id.
    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),

    /// The operation is executing on a present token, or is partly applied,
    /// and cannot be changed.
    #[error("operation {0} is in flight")]
    OperationInFlight(OperationId),

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    /// The provisioning URI is invalid or uses unsupported parameters.
    #[error("invalid or unsupported code: {0}")]
    UnsupportedProvisioningFormat(String),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Failed to parse hex data.
    #[error("hex decoding failed: {0}")]
    HexDecodeFailed(String),

    /// The engine configuration could not be read.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` for failures that abort only the current command.
    ///
    /// The session stays usable and the next queued operation runs on a
    /// subsequent presentment.
    #[must_use]
    pub const fn is_command_local(&self) -> bool {
        matches!(
            self,
            Self::NoSpace | Self::DuplicateName(_) | Self::NotFound(_) | Self::NameTooLong(_)
        )
    }

    /// Returns `true` for failures after which the user must be re-prompted.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::WrongPassword | Self::AuthMismatch | Self::AuthRequired
        )
    }
}

impl From<FromHexError> for Error {
    fn from(err: FromHexError) -> Self {
        Error::HexDecodeFailed(err.to_string())
    }
}

impl From<SerdeJsonError> for Error {
    fn from(err: SerdeJsonError) -> Self {
        Error::Config(err.to_string())
    }
}

/// A specialized [`Result`] type for OATH engine operations.
pub type Result<T> = CoreResult<T, Error>;
