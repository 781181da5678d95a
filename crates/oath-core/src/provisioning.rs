//! Provisioning URI parsing.
//!
//! Turns the text of a scanned QR code into [`CredentialDraft`]s ready to be
//! queued. Two formats are understood:
//!
//! - `otpauth://totp/Issuer:label?secret=...&issuer=...&digits=...`, one
//!   credential per URI
//! - `otpauth-migration://offline?data=...`, the batch export of
//!   Google Authenticator, a base64 protobuf `MigrationPayload`
//!
//! Validation is strict: anything the applet could not store exactly as
//! described is rejected with [`Error::UnsupportedProvisioningFormat`] before
//! it reaches the queue.
//!
//! # Example
//!
//! ```
//! use yubikey_oath_core::provisioning;
//! use yubikey_oath_core::credential::{Mode, Variant};
//!
//! let draft = provisioning::parse(
//!     "otpauth://totp/Example:alice@example.com?secret=JBSWY3DPEHPK3PXP&issuer=Example",
//! )
//! .unwrap();
//! assert_eq!(draft.id().as_str(), "Example:alice@example.com");
//! assert_eq!(draft.mode, Mode::Time);
//! assert_eq!(draft.variant, Variant::Standard);
//! ```

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use prost::Message;

use crate::credential::{CredentialDraft, Digits, HashAlgorithm, Mode, Secret, Variant};
use crate::error::{Error, Result};

const SCHEME: &str = "otpauth";
const MIGRATION_PREFIX: &str = "otpauth-migration://offline?";

/// The only TOTP period the applet computes with.
const SUPPORTED_PERIOD: u32 = 30;

const STEAM_ISSUER: &str = "Steam";
const STEAM_ENCODER: &str = "steam";

fn unsupported(reason: impl Into<String>) -> Error {
    Error::UnsupportedProvisioningFormat(reason.into())
}

/// Parses an `otpauth://` URI.
///
/// # Errors
///
/// Returns [`Error::UnsupportedProvisioningFormat`] for a foreign scheme, an
/// unknown type, a missing or invalid secret, out-of-range digits, an
/// unknown algorithm, a negative counter or a period other than 30.
/// Returns [`Error::NameTooLong`] if the resulting name exceeds 64 bytes.
pub fn parse(uri: &str) -> Result<CredentialDraft> {
    let uri = uri.trim();
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| unsupported("not a URI"))?;
    if !scheme.eq_ignore_ascii_case(SCHEME) {
        return Err(unsupported(format!("scheme {scheme}")));
    }

    let (kind, rest) = rest
        .split_once('/')
        .ok_or_else(|| unsupported("missing label"))?;
    let mode = if kind.eq_ignore_ascii_case("totp") {
        Mode::Time
    } else if kind.eq_ignore_ascii_case("hotp") {
        Mode::Counter
    } else {
        return Err(unsupported(format!("type {kind}")));
    };

    let (raw_label, query) = rest.split_once('?').unwrap_or((rest, ""));
    let label = percent_decode(raw_label)?;

    let mut params = UriParams::default();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(value)?;
        match key.to_ascii_lowercase().as_str() {
            "secret" => params.secret = Some(value),
            "issuer" => params.issuer = Some(value),
            "digits" => params.digits = Some(value),
            "counter" => params.counter = Some(value),
            "algorithm" => params.algorithm = Some(value),
            "period" => params.period = Some(value),
            "encoder" => params.encoder = Some(value),
            _ => {}
        }
    }

    // Whitespace before the account name is not significant, with or
    // without an issuer prefix.
    let (label_issuer, label) = match label.split_once(':') {
        Some((prefix, rest)) => {
            let prefix = prefix.trim();
            ((!prefix.is_empty()).then(|| prefix.to_string()), rest.trim_start().to_string())
        }
        None => (None, label.trim_start().to_string()),
    };
    let issuer = params
        .issuer
        .filter(|issuer| !issuer.is_empty())
        .or(label_issuer);

    let secret = params
        .secret
        .ok_or_else(|| unsupported("missing secret"))
        .and_then(|s| base32_decode(&s))?;

    let algorithm = match params.algorithm {
        Some(name) => HashAlgorithm::from_name(&name)
            .ok_or_else(|| unsupported(format!("algorithm {name}")))?,
        None => HashAlgorithm::default(),
    };


    let counter = match (mode, params.counter) {
        (Mode::Counter, Some(value)) => parse_number(&value, "counter")?,
        _ => 0,
    };

    if let Some(value) = params.period {
        let period: u32 = parse_number(&value, "period")?;
        if period != SUPPORTED_PERIOD {
            return Err(unsupported(format!("period {period}")));
        }
    }

    let steam = issuer.as_deref() == Some(STEAM_ISSUER)
        || params
            .encoder
            .is_some_and(|e| e.eq_ignore_ascii_case(STEAM_ENCODER));
    // Steam exports advertise 5 digits; the applet computes 6 and the host
    // renders them with the Steam alphabet.
    let (digits, variant) = match params.digits {
        _ if steam => (Digits::SIX, Variant::Steam),
        Some(value) => (Digits::new(parse_number(&value, "digits")?)?, Variant::Standard),
        None => (Digits::default(), Variant::Standard),
    };

    let draft = CredentialDraft {
        issuer,
        label,
        mode,
        algorithm,
        digits,
        variant,
        counter,
        requires_touch: false,
        secret: Secret::new(secret),
    };
    draft.validate()?;
    Ok(draft)
}

#[derive(Default)]
struct UriParams {
    secret: Option<String>,
    issuer: Option<String>,
    digits: Option<String>,
    counter: Option<String>,
    algorithm: Option<String>,
    period: Option<String>,
    encoder: Option<String>,
}

fn percent_decode(value: &str) -> Result<String> {
    urlencoding::decode(value)
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| unsupported("invalid percent encoding"))
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| unsupported(format!("{what} {value}")))
}

/// Serializes a draft as an `otpauth://` URI.
///
/// Drafts produced by [`parse`] survive the round trip unchanged. The touch
/// requirement has no URI parameter and is not written.
#[must_use]
pub fn to_uri(draft: &CredentialDraft) -> String {
    let mut uri = format!(
        "{SCHEME}://{}/{}?secret={}",
        draft.mode.uri_name(),
        urlencoding::encode(&uri_path(draft)),
        base32_encode(draft.secret.expose()),
    );
    if let Some(issuer) = &draft.issuer {
        uri.push_str("&issuer=");
        uri.push_str(&urlencoding::encode(issuer));
    }
    uri.push_str(&format!(
        "&algorithm={}&digits={}",
        draft.algorithm.name(),
        draft.digits.get()
    ));
    match draft.mode {
        Mode::Counter => uri.push_str(&format!("&counter={}", draft.counter)),
        Mode::Time => uri.push_str(&format!("&period={SUPPORTED_PERIOD}")),
    }
    if draft.variant == Variant::Steam {
        uri.push_str("&encoder=");
        uri.push_str(STEAM_ENCODER);
    }
    uri
}

/// Label path that [`parse`] splits back into the same issuer and label.
///
/// An empty prefix keeps a colon inside the label, or inside the issuer,
/// from being read as the separator.
fn uri_path(draft: &CredentialDraft) -> String {
    match draft.issuer.as_deref() {
        Some(issuer) if !issuer.contains(':') => format!("{issuer}:{}", draft.label),
        None if !draft.label.contains(':') => draft.label.clone(),
        _ => format!(":{}", draft.label),
    }
}

/// Parses either a single-credential URI or a migration batch.
///
/// # Errors
///
/// Returns whatever [`parse`] or [`parse_migration`] returns for the form
/// the URI is in.
pub fn parse_any(uri: &str) -> Result<Vec<CredentialDraft>> {
    let trimmed = uri.trim();
    if trimmed
        .get(..MIGRATION_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(MIGRATION_PREFIX))
    {
        parse_migration(trimmed)
    } else {
        parse(trimmed).map(|draft| vec![draft])
    }
}

// =============================================================================
// Migration payloads
// =============================================================================

/// Parses an `otpauth-migration://offline?data=...` batch.
///
/// # Errors
///
/// Returns [`Error::UnsupportedProvisioningFormat`] if the payload is not
/// valid base64 or protobuf, holds no credentials, or any credential uses
/// MD5, an unknown enum value or an invalid name.
pub fn parse_migration(uri: &str) -> Result<Vec<CredentialDraft>> {
    let uri = uri.trim();
    let query = uri
        .get(..MIGRATION_PREFIX.len())
        .filter(|p| p.eq_ignore_ascii_case(MIGRATION_PREFIX))
        .map(|_| &uri[MIGRATION_PREFIX.len()..])
        .ok_or_else(|| unsupported("not a migration URI"))?;

    let data = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("data="))
        .ok_or_else(|| unsupported("missing data"))?;
    let data = percent_decode(data)?.replace(' ', "+");
    let payload = [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(&data).ok())
        .ok_or_else(|| unsupported("invalid base64 data"))?;

    let payload = MigrationPayload::decode(payload.as_slice())
        .map_err(|e| unsupported(format!("invalid migration payload: {e}")))?;
    if payload.otp_parameters.is_empty() {
        return Err(unsupported("no credentials in migration data"));
    }
    payload.otp_parameters.into_iter().map(migration_entry).collect()
}

/// `MigrationPayload` of the Google Authenticator export.
#[derive(Clone, PartialEq, Message)]
struct MigrationPayload {
    #[prost(message, repeated, tag = "1")]
    otp_parameters: Vec<OtpParameters>,
}

#[derive(Clone, PartialEq, Message)]
struct OtpParameters {
    #[prost(bytes = "vec", tag = "1")]
    secret: Vec<u8>,
    #[prost(string, tag = "2")]
    name: String,
    #[prost(string, tag = "3")]
    issuer: String,
    #[prost(enumeration = "MigrationAlgorithm", tag = "4")]
    algorithm: i32,
    #[prost(enumeration = "MigrationDigits", tag = "5")]
    digits: i32,
    #[prost(enumeration = "MigrationType", tag = "6")]
    r#type: i32,
    #[prost(int64, tag = "7")]
    counter: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum MigrationAlgorithm {
    Unspecified = 0,
    Sha1 = 1,
    Sha256 = 2,
    Sha512 = 3,
    Md5 = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum MigrationDigits {
    Unspecified = 0,
    Six = 1,
    Eight = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum MigrationType {
    Unspecified = 0,
    Hotp = 1,
    Totp = 2,
}

fn migration_entry(mut params: OtpParameters) -> Result<CredentialDraft> {
    let algorithm = match MigrationAlgorithm::try_from(params.algorithm) {
        Ok(MigrationAlgorithm::Unspecified | MigrationAlgorithm::Sha1) => HashAlgorithm::Sha1,
        Ok(MigrationAlgorithm::Sha256) => HashAlgorithm::Sha256,
        Ok(MigrationAlgorithm::Sha512) => HashAlgorithm::Sha512,
        Ok(MigrationAlgorithm::Md5) => return Err(unsupported("MD5")),
        Err(_) => return Err(unsupported(format!("algorithm {}", params.algorithm))),
    };
    let mut digits = match MigrationDigits::try_from(params.digits) {
        Ok(MigrationDigits::Unspecified | MigrationDigits::Six) => Digits::SIX,
        Ok(MigrationDigits::Eight) => Digits::new(8)?,
        Err(_) => return Err(unsupported(format!("digit count {}", params.digits))),
    };
    let mode = match MigrationType::try_from(params.r#type) {
        Ok(MigrationType::Hotp) => Mode::Counter,
        Ok(MigrationType::Totp) => Mode::Time,
        Ok(MigrationType::Unspecified) => return Err(unsupported("missing type")),
        Err(_) => return Err(unsupported(format!("type {}", params.r#type))),
    };
    let counter = u64::try_from(params.counter).map_err(|_| unsupported("negative counter"))?;

    let name = std::mem::take(&mut params.name);
    let issuer = Some(std::mem::take(&mut params.issuer)).filter(|issuer| !issuer.is_empty());
    let label = match (&issuer, name.split_once(':')) {
        (Some(issuer), Some((prefix, rest))) if prefix == issuer => rest.trim_start().to_string(),
        _ => name,
    };
    let (issuer, label) = match (issuer, label.split_once(':')) {
        (None, Some((prefix, rest))) if !prefix.is_empty() => {
            (Some(prefix.to_string()), rest.trim_start().to_string())
        }
        (issuer, _) => (issuer, label),
    };
    let variant = if issuer.as_deref() == Some(STEAM_ISSUER) {
        digits = Digits::SIX;
        Variant::Steam
    } else {
        Variant::Standard
    };

    let draft = CredentialDraft {
        issuer,
        label,
        mode,
        algorithm,
        digits,
        variant,
        counter: if mode == Mode::Counter { counter } else { 0 },
        requires_touch: false,
        secret: Secret::new(std::mem::take(&mut params.secret)),
    };
    draft.validate()?;
    Ok(draft)
}

// =============================================================================
// Base32
// =============================================================================

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Decodes RFC 4648 base32, ignoring case, spaces and padding.
fn base32_decode(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer = 0u32;
    let mut bits = 0u32;

    for c in text.chars().filter(|c| !c.is_whitespace() && *c != '=') {
        let upper = c.to_ascii_uppercase();
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| char::from(a) == upper)
            .ok_or_else(|| unsupported(format!("invalid base32 character {c:?}")))?;
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    if out.is_empty() {
        return Err(unsupported("empty secret"));
    }
    Ok(out)
}

/// Encodes bytes as unpadded RFC 4648 base32.
fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer = 0u32;
    let mut bits = 0u32;

    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(char::from(BASE32_ALPHABET[((buffer >> bits) & 0x1F) as usize]));
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(char::from(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1F) as usize]));
    }
    out
}
