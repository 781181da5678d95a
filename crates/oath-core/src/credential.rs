//! Credential data model.
//!
//! A [`Credential`] is the host-side view of one OATH slot. Its [`CredentialId`]
//! is the name stored on the token (`issuer:label`, or just `label`), which
//! is also what every applet command addresses.
//!
//! Secrets never live in a [`Credential`]. They only exist inside a
//! [`CredentialDraft`] waiting to be written by a pending ADD or RENAME, held
//! in a [`Secret`] that is wiped on drop.

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Maximum length of a credential name in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Characters used to render Steam codes.
const STEAM_ALPHABET: &[u8; 26] = b"23456789BCDFGHJKMNPQRTVWXY";

/// Number of characters in a Steam code.
const STEAM_CODE_LEN: usize = 5;

/// OTP mode of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Counter based (HOTP).
    Counter,
    /// Time based (TOTP).
    Time,
}

impl Mode {
    /// Type nibble used by the applet.
    #[must_use]
    pub const fn type_bits(self) -> u8 {
        match self {
            Self::Counter => 0x10,
            Self::Time => 0x20,
        }
    }

    /// Parses the type nibble of a type/algorithm byte.
    #[must_use]
    pub const fn from_type_bits(byte: u8) -> Option<Self> {
        match byte & 0xF0 {
            0x10 => Some(Self::Counter),
            0x20 => Some(Self::Time),
            _ => None,
        }
    }

    /// Scheme host name used in provisioning URIs.
    #[must_use]
    pub const fn uri_name(self) -> &'static str {
        match self {
            Self::Counter => "hotp",
            Self::Time => "totp",
        }
    }
}

/// HMAC digest algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HashAlgorithm {
    /// HMAC-SHA1.
    #[default]
    Sha1,
    /// HMAC-SHA256.
    Sha256,
    /// HMAC-SHA512.
    Sha512,
}

impl HashAlgorithm {
    /// Algorithm nibble used by the applet.
    #[must_use]
    pub const fn alg_bits(self) -> u8 {
        match self {
            Self::Sha1 => 0x01,
            Self::Sha256 => 0x02,
            Self::Sha512 => 0x03,
        }
    }

    /// Parses the algorithm nibble of a type/algorithm byte.
    #[must_use]
    pub const fn from_alg_bits(byte: u8) -> Option<Self> {
        match byte & 0x0F {
            0x01 => Some(Self::Sha1),
            0x02 => Some(Self::Sha256),
            0x03 => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Name used in provisioning URIs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Parses a provisioning URI algorithm name, ignoring case.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        [Self::Sha1, Self::Sha256, Self::Sha512]
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(name))
    }

    /// HMAC block size in bytes.
    #[must_use]
    pub const fn block_size(self) -> usize {
        match self {
            Self::Sha1 | Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// Output rendering of a credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Decimal digits.
    #[default]
    Standard,
    /// Five characters from the Steam alphabet.
    Steam,
}

/// Number of OTP digits, 6 to 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Digits(u8);

impl Digits {
    /// Six digits, the default and the only value allowed for Steam codes.
    pub const SIX: Self = Self(6);

    /// Creates a digit count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedProvisioningFormat`] outside 6 to 8.
    pub fn new(digits: u8) -> Result<Self> {
        if (6..=8).contains(&digits) {
            Ok(Self(digits))
        } else {
            Err(Error::UnsupportedProvisioningFormat(format!(
                "{digits} digits, expected 6 to 8"
            )))
        }
    }

    /// Returns the count.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Digits {
    fn default() -> Self {
        Self::SIX
    }
}

impl TryFrom<u8> for Digits {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Digits> for u8 {
    fn from(value: Digits) -> Self {
        value.0
    }
}

/// The on-token name of a credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    /// Wraps a raw on-token name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Builds the name from an optional issuer and a label.
    ///
    /// # Example
    ///
    /// ```
    /// use yubikey_oath_core::CredentialId;
    ///
    /// assert_eq!(CredentialId::from_parts(Some("Example"), "alice").as_str(), "Example:alice");
    /// assert_eq!(CredentialId::from_parts(None, "mail").as_str(), "mail");
    /// ```
    #[must_use]
    pub fn from_parts(issuer: Option<&str>, label: &str) -> Self {
        match issuer {
            Some(issuer) if !issuer.is_empty() => Self(format!("{issuer}:{label}")),
            _ => Self(label.to_string()),
        }
    }

    /// Splits the name into issuer and label.
    ///
    /// A leading `period/` prefix, as written by other OATH clients for
    /// non-default periods, is skipped.
    #[must_use]
    pub fn parts(&self) -> (Option<&str>, &str) {
        let name = match self.0.split_once('/') {
            Some((period, rest)) if !period.is_empty() && period.bytes().all(|b| b.is_ascii_digit()) => {
                rest
            }
            _ => self.0.as_str(),
        };
        match name.split_once(':') {
            Some((issuer, label)) if !issuer.is_empty() => (Some(issuer), label),
            _ => (None, name),
        }
    }

    /// Returns the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the name as sent to the applet.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Applet-assigned token identifier, also the password salt.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(Vec<u8>);

impl DeviceId {
    /// Wraps the raw id bytes from SELECT.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw id bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Applet firmware version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(pub u8, pub u8, pub u8);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Identity of the token reported by SELECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    /// Applet-assigned identifier.
    pub device_id: DeviceId,
    /// Applet version.
    pub version: Version,
    /// Whether the applet is password protected.
    pub locked: bool,
    /// Digest used for the access key and VALIDATE.
    pub auth_algorithm: HashAlgorithm,
}

/// Shared secret of a credential, wiped on drop.
#[derive(Clone)]
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    /// Wraps raw secret bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Returns the secret bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if there are no secret bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Secret {}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// A validated credential waiting to be written to a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialDraft {
    /// Issuer, if any.
    pub issuer: Option<String>,
    /// Account label.
    pub label: String,
    /// HOTP or TOTP.
    pub mode: Mode,
    /// HMAC digest.
    pub algorithm: HashAlgorithm,
    /// Digit count.
    pub digits: Digits,
    /// Output rendering.
    pub variant: Variant,
    /// Initial moving factor, used for HOTP only.
    pub counter: u64,
    /// Whether the token should require a touch to calculate.
    pub requires_touch: bool,
    /// Shared secret.
    pub secret: Secret,
}

impl CredentialDraft {
    /// Returns the on-token name this draft will be stored under.
    #[must_use]
    pub fn id(&self) -> CredentialId {
        CredentialId::from_parts(self.issuer.as_deref(), &self.label)
    }

    /// Checks the constraints the applet enforces on a new credential.
    ///
    /// # Errors
    ///
    /// - [`Error::NameTooLong`] if the name exceeds [`MAX_NAME_LEN`]
    /// - [`Error::UnsupportedProvisioningFormat`] for an empty label or
    ///   secret, a Steam draft without six digits, or a counter above
    ///   `u32::MAX`
    pub fn validate(&self) -> Result<()> {
        if self.label.is_empty() {
            return Err(Error::UnsupportedProvisioningFormat(
                "empty label".to_string(),
            ));
        }
        let len = self.id().as_bytes().len();
        if len > MAX_NAME_LEN {
            return Err(Error::NameTooLong(len));
        }
        if self.secret.is_empty() {
            return Err(Error::UnsupportedProvisioningFormat(
                "empty secret".to_string(),
            ));
        }
        if self.variant == Variant::Steam && self.digits != Digits::SIX {
            return Err(Error::UnsupportedProvisioningFormat(
                "Steam codes use 6 digits".to_string(),
            ));
        }
        // The applet stores the initial moving factor in four bytes.
        if u32::try_from(self.counter).is_err() {
            return Err(Error::UnsupportedProvisioningFormat(format!(
                "counter {} does not fit the token",
                self.counter
            )));
        }
        Ok(())
    }

    /// Builds the host-side credential written by this draft.
    #[must_use]
    pub fn to_credential(&self) -> Credential {
        Credential {
            id: self.id(),
            issuer: self.issuer.clone(),
            label: self.label.clone(),
            mode: self.mode,
            algorithm: self.algorithm,
            digits: self.digits,
            variant: self.variant,
            counter: (self.mode == Mode::Counter).then_some(self.counter),
            requires_touch: self.requires_touch,
            code: None,
        }
    }
}

/// A code computed by the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OtpCode {
    /// Truncated 31-bit value.
    pub value: u32,
    /// Digit count reported by the token.
    pub digits: u8,
    /// Rendering applied by [`Display`](fmt::Display).
    pub variant: Variant,
}

impl fmt::Display for OtpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant {
            Variant::Standard => {
                let modulus = 10u32.pow(u32::from(self.digits.min(9)));
                let width = usize::from(self.digits);
                write!(f, "{:0width$}", self.value % modulus)
            }
            Variant::Steam => {
                let mut value = self.value;
                for _ in 0..STEAM_CODE_LEN {
                    let index = (value % 26) as usize;
                    write!(f, "{}", char::from(STEAM_ALPHABET[index]))?;
                    value /= 26;
                }
                Ok(())
            }
        }
    }
}

/// One credential as known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    /// On-token name.
    pub id: CredentialId,
    /// Issuer part of the name.
    pub issuer: Option<String>,
    /// Label part of the name.
    pub label: String,
    /// HOTP or TOTP.
    pub mode: Mode,
    /// HMAC digest.
    pub algorithm: HashAlgorithm,
    /// Digit count, refined by the first calculation.
    pub digits: Digits,
    /// Output rendering.
    pub variant: Variant,
    /// Local mirror of the token counter, HOTP only.
    pub counter: Option<u64>,
    /// Whether the token requires a touch to calculate.
    pub requires_touch: bool,
    /// Last code computed by the token.
    pub code: Option<OtpCode>,
}

impl Credential {
    /// Builds a credential from a LIST entry.
    #[must_use]
    pub fn from_listing(id: CredentialId, mode: Mode, algorithm: HashAlgorithm) -> Self {
        let (issuer, label) = id.parts();
        let issuer = issuer.map(str::to_string);
        let label = label.to_string();
        Self {
            id,
            issuer,
            label,
            mode,
            algorithm,
            digits: Digits::SIX,
            variant: Variant::Standard,
            counter: (mode == Mode::Counter).then_some(0),
            requires_touch: false,
            code: None,
        }
    }
}
