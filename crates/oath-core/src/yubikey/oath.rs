//! OATH applet instruction set.
//!
//! This module builds every command the engine sends and parses every
//! response it understands. It performs no I/O; [`crate::session`] decides
//! the order.
//!
//! # Instructions
//!
//! | Command | CLA | INS | P1 | P2 | Data |
//! |---------|-----|-----|----|----|------|
//! | SELECT | 00 | A4 | 04 | 00 | AID |
//! | PUT | 00 | 01 | 00 | 00 | name, key, [property], [imf] |
//! | DELETE | 00 | 02 | 00 | 00 | name |
//! | SET CODE | 00 | 03 | 00 | 00 | key, challenge, response |
//! | RESET | 00 | 04 | DE | AD | - |
//! | LIST | 00 | A1 | 00 | 00 | - |
//! | CALCULATE | 00 | A2 | 00 | 01 | name, challenge |
//! | VALIDATE | 00 | A3 | 00 | 00 | response, challenge |
//! | CALCULATE ALL | 00 | A4 | 00 | 01 | challenge |
//! | SEND REMAINING | 00 | A5 | 00 | 00 | - |

use super::apdu::Apdu;
use super::tlv;
use crate::auth::{self, AccessKey, HostChallenge};
use crate::credential::{
    CredentialDraft, CredentialId, DeviceId, HashAlgorithm, MAX_NAME_LEN, Mode, Version,
};
use crate::error::{Error, Result};

/// The OATH applet AID.
pub const OATH_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x05, 0x27, 0x21, 0x01];

/// OATH instruction codes.
pub mod ins {
    /// `PUT` instruction.
    pub const PUT: u8 = 0x01;

    /// `DELETE` instruction.
    pub const DELETE: u8 = 0x02;

    /// `SET CODE` instruction.
    pub const SET_CODE: u8 = 0x03;

    /// `RESET` instruction.
    pub const RESET: u8 = 0x04;

    /// `LIST` instruction.
    pub const LIST: u8 = 0xA1;

    /// `CALCULATE` instruction.
    pub const CALCULATE: u8 = 0xA2;

    /// `VALIDATE` instruction.
    pub const VALIDATE: u8 = 0xA3;

    /// `SELECT` instruction; shares its code with `CALCULATE ALL`.
    pub const SELECT: u8 = 0xA4;

    /// `CALCULATE ALL` instruction.
    pub const CALCULATE_ALL: u8 = 0xA4;

    /// `SEND REMAINING` instruction.
    pub const SEND_REMAINING: u8 = 0xA5;
}

/// TLV tags.
mod tag {
    pub(super) const NAME: u8 = 0x71;
    pub(super) const NAME_LIST: u8 = 0x72;
    pub(super) const KEY: u8 = 0x73;
    pub(super) const CHALLENGE: u8 = 0x74;
    pub(super) const RESPONSE: u8 = 0x75;
    pub(super) const TRUNCATED: u8 = 0x76;
    pub(super) const NO_RESPONSE: u8 = 0x77;
    pub(super) const PROPERTY: u8 = 0x78;
    pub(super) const VERSION: u8 = 0x79;
    pub(super) const IMF: u8 = 0x7A;
    pub(super) const ALGORITHM: u8 = 0x7B;
    pub(super) const TOUCH: u8 = 0x7C;
}

/// Property byte asking the token to require a touch.
const PROP_REQUIRE_TOUCH: u8 = 0x02;

/// Shortest HMAC key the applet accepts; shorter keys are zero padded.
const HMAC_MIN_KEY_LEN: usize = 14;

/// P2 asking CALCULATE / CALCULATE ALL for truncated responses.
const P2_TRUNCATE: u8 = 0x01;

/// Builds `SELECT` for the OATH applet.
#[must_use]
pub fn select() -> Apdu {
    Apdu::new(0x00, ins::SELECT, 0x04, 0x00, OATH_AID.to_vec())
}

/// Builds `LIST`.
#[must_use]
pub fn list() -> Apdu {
    Apdu::new(0x00, ins::LIST, 0x00, 0x00, Vec::new())
}

/// Builds `SEND REMAINING`.
#[must_use]
pub fn send_remaining() -> Apdu {
    Apdu::new(0x00, ins::SEND_REMAINING, 0x00, 0x00, Vec::new())
}

/// Builds `RESET`.
#[must_use]
pub fn reset() -> Apdu {
    Apdu::new(0x00, ins::RESET, 0xDE, 0xAD, Vec::new())
}

/// Builds `DELETE` for `id`.
#[must_use]
pub fn delete(id: &CredentialId) -> Apdu {
    let mut data = Vec::with_capacity(2 + id.as_bytes().len());
    tlv::push(&mut data, tag::NAME, id.as_bytes());
    Apdu::new(0x00, ins::DELETE, 0x00, 0x00, data)
}

/// Builds `PUT` writing `draft` under `name`.
///
/// The name is passed separately so a rename can write the old secret under
/// a new label.
///
/// # Errors
///
/// Returns [`Error::NameTooLong`] if the name exceeds 64 bytes, or
/// [`Error::UnsupportedProvisioningFormat`] for a counter beyond four bytes.
///
/// # Example
///
/// ```
/// use yubikey_oath_core::credential::{CredentialDraft, Digits, HashAlgorithm, Mode, Secret, Variant};
/// use yubikey_oath_core::yubikey::oath;
///
/// let draft = CredentialDraft {
///     issuer: None,
///     label: "mail".to_string(),
///     mode: Mode::Time,
///     algorithm: HashAlgorithm::Sha1,
///     digits: Digits::SIX,
///     variant: Variant::Standard,
///     counter: 0,
///     requires_touch: false,
///     secret: Secret::new(vec![0x42; 20]),
/// };
/// let apdu = oath::put(&draft, &draft.id()).unwrap();
/// assert_eq!(&apdu.data()[..6], &[0x71, 0x04, b'm', b'a', b'i', b'l']);
/// ```
pub fn put(draft: &CredentialDraft, name: &CredentialId) -> Result<Apdu> {
    let name_len = name.as_bytes().len();
    if name_len > MAX_NAME_LEN {
        return Err(Error::NameTooLong(name_len));
    }

    let key = shorten_key(draft.algorithm, draft.secret.expose());
    let mut key_value = Vec::with_capacity(2 + key.len());
    key_value.push(draft.mode.type_bits() | draft.algorithm.alg_bits());
    key_value.push(draft.digits.get());
    key_value.extend_from_slice(&key);

    let mut data = Vec::with_capacity(8 + name_len + key_value.len());
    tlv::push(&mut data, tag::NAME, name.as_bytes());
    tlv::push(&mut data, tag::KEY, &key_value);
    if draft.requires_touch {
        data.extend_from_slice(&[tag::PROPERTY, PROP_REQUIRE_TOUCH]);
    }
    if draft.mode == Mode::Counter && draft.counter > 0 {
        let imf = u32::try_from(draft.counter).map_err(|_| {
            Error::UnsupportedProvisioningFormat(format!("counter {} out of range", draft.counter))
        })?;
        tlv::push(&mut data, tag::IMF, &imf.to_be_bytes());
    }

    Ok(Apdu::new(0x00, ins::PUT, 0x00, 0x00, data))
}

/// Pads short keys and hashes keys longer than the digest block.
fn shorten_key(algorithm: HashAlgorithm, secret: &[u8]) -> Vec<u8> {
    let mut key = if secret.len() > algorithm.block_size() {
        auth::digest(algorithm, secret)
    } else {
        secret.to_vec()
    };
    if key.len() < HMAC_MIN_KEY_LEN {
        key.resize(HMAC_MIN_KEY_LEN, 0);
    }
    key
}

/// Builds `VALIDATE` answering the token challenge and sending ours.
///
/// # Errors
///
/// Returns [`Error::InvalidKeyLength`] if the key cannot seed the MAC.
pub fn validate(
    key: &AccessKey,
    token_challenge: &[u8],
    host_challenge: &HostChallenge,
) -> Result<Apdu> {
    let response = auth::respond_to(token_challenge, key)?;
    let mut data = Vec::with_capacity(4 + response.len() + host_challenge.as_bytes().len());
    tlv::push(&mut data, tag::RESPONSE, &response);
    tlv::push(&mut data, tag::CHALLENGE, host_challenge.as_bytes());
    Ok(Apdu::new(0x00, ins::VALIDATE, 0x00, 0x00, data))
}

/// Builds `SET CODE` installing `key`.
///
/// # Errors
///
/// Returns [`Error::InvalidKeyLength`] if the key cannot seed the MAC.
pub fn set_code(key: &AccessKey, challenge: &HostChallenge) -> Result<Apdu> {
    let response = auth::respond_to(challenge.as_bytes(), key)?;

    let mut key_value = Vec::with_capacity(1 + key.expose().len());
    key_value.push(key.algorithm().alg_bits());
    key_value.extend_from_slice(key.expose());

    let mut data = Vec::with_capacity(8 + key_value.len() + response.len());
    tlv::push(&mut data, tag::KEY, &key_value);
    tlv::push(&mut data, tag::CHALLENGE, challenge.as_bytes());
    tlv::push(&mut data, tag::RESPONSE, &response);
    Ok(Apdu::new(0x00, ins::SET_CODE, 0x00, 0x00, data))
}

/// Builds `SET CODE` removing the password.
#[must_use]
pub fn clear_code() -> Apdu {
    Apdu::new(0x00, ins::SET_CODE, 0x00, 0x00, vec![tag::KEY, 0x00])
}

/// Builds a truncated `CALCULATE` for one credential.
///
/// TOTP credentials pass the time step as challenge; HOTP credentials pass
/// an empty challenge and the token uses its counter.
#[must_use]
pub fn calculate(id: &CredentialId, challenge: &[u8]) -> Apdu {
    let mut data = Vec::with_capacity(4 + id.as_bytes().len() + challenge.len());
    tlv::push(&mut data, tag::NAME, id.as_bytes());
    tlv::push(&mut data, tag::CHALLENGE, challenge);
    Apdu::new(0x00, ins::CALCULATE, 0x00, P2_TRUNCATE, data)
}

/// Builds a truncated `CALCULATE ALL` for the given TOTP challenge.
#[must_use]
pub fn calculate_all(challenge: &[u8; 8]) -> Apdu {
    let mut data = Vec::with_capacity(10);
    tlv::push(&mut data, tag::CHALLENGE, challenge);
    Apdu::new(0x00, ins::CALCULATE_ALL, 0x00, P2_TRUNCATE, data)
}

/// Returns the TOTP challenge for a Unix time and period.
///
/// # Example
///
/// ```
/// use yubikey_oath_core::yubikey::oath;
///
/// assert_eq!(oath::totp_challenge(59, 30), [0, 0, 0, 0, 0, 0, 0, 1]);
/// ```
#[must_use]
pub fn totp_challenge(unix_seconds: u64, period: u32) -> [u8; 8] {
    (unix_seconds / u64::from(period.max(1))).to_be_bytes()
}

/// Parsed `SELECT` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectResponse {
    /// Applet version.
    pub version: Version,
    /// Token id, used as the password salt.
    pub device_id: DeviceId,
    /// Token challenge; present only when a password is set.
    pub challenge: Option<Vec<u8>>,
    /// Digest used for the access key.
    pub algorithm: HashAlgorithm,
}

impl SelectResponse {
    /// Returns `true` if the applet is password protected.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.challenge.is_some()
    }
}

/// Parses a `SELECT` response.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the TLVs are inconsistent or the id
/// is missing.
pub fn parse_select(data: &[u8]) -> Result<SelectResponse> {
    let entries = tlv::parse(data)?;

    let version = match tlv::find(&entries, tag::VERSION) {
        Some(&[major, minor, patch, ..]) => Version(major, minor, patch),
        _ => Version::default(),
    };
    let device_id = tlv::find(&entries, tag::NAME)
        .ok_or_else(|| Error::MalformedFrame("SELECT response without id".to_string()))?;
    let algorithm = tlv::find(&entries, tag::ALGORITHM)
        .and_then(|v| v.first())
        .and_then(|&b| HashAlgorithm::from_alg_bits(b))
        .unwrap_or_default();

    Ok(SelectResponse {
        version,
        device_id: DeviceId::new(device_id),
        challenge: tlv::find(&entries, tag::CHALLENGE).map(<[u8]>::to_vec),
        algorithm,
    })
}

/// Extracts the token's answer to our challenge from a `VALIDATE` response.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the response TLV is missing.
pub fn parse_validate(data: &[u8]) -> Result<Vec<u8>> {
    let entries = tlv::parse(data)?;
    tlv::find(&entries, tag::RESPONSE)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| Error::MalformedFrame("VALIDATE response without response".to_string()))
}

/// One entry of a `LIST` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// On-token name.
    pub id: CredentialId,
    /// HOTP or TOTP.
    pub mode: Mode,
    /// HMAC digest.
    pub algorithm: HashAlgorithm,
}

/// Parses a complete `LIST` response.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] on inconsistent lengths or unknown
/// type/algorithm bytes.
pub fn parse_list(data: &[u8]) -> Result<Vec<ListEntry>> {
    tlv::parse(data)?
        .into_iter()
        .filter(|e| e.tag == tag::NAME_LIST)
        .map(|e| list_entry(e.value))
        .collect()
}

/// Parses the complete entries of an interrupted `LIST` response.
///
/// Stops at the first truncated entry instead of failing.
#[must_use]
pub fn parse_list_prefix(data: &[u8]) -> Vec<ListEntry> {
    let mut entries = Vec::new();
    let mut rest = data;
    while let [tag_byte, len, tail @ ..] = rest {
        let len = usize::from(*len);
        if len >= 0x80 || tail.len() < len {
            break;
        }
        let (value, tail) = tail.split_at(len);
        if *tag_byte == tag::NAME_LIST
            && let Ok(entry) = list_entry(value)
        {
            entries.push(entry);
        }
        rest = tail;
    }
    entries
}

fn list_entry(value: &[u8]) -> Result<ListEntry> {
    let (&kind, name) = value
        .split_first()
        .ok_or_else(|| Error::MalformedFrame("empty LIST entry".to_string()))?;
    let mode = Mode::from_type_bits(kind)
        .ok_or_else(|| Error::MalformedFrame(format!("unknown credential type {kind:#04x}")))?;
    let algorithm = HashAlgorithm::from_alg_bits(kind)
        .ok_or_else(|| Error::MalformedFrame(format!("unknown algorithm {kind:#04x}")))?;
    Ok(ListEntry {
        id: CredentialId::new(String::from_utf8_lossy(name)),
        mode,
        algorithm,
    })
}

/// A truncated response: digit count and 31-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated {
    /// Digits the credential was registered with.
    pub digits: u8,
    /// Dynamically truncated value.
    pub value: u32,
}

fn truncated(value: &[u8]) -> Result<Truncated> {
    match value {
        [digits, a, b, c, d] => Ok(Truncated {
            digits: *digits,
            value: u32::from_be_bytes([*a, *b, *c, *d]) & 0x7FFF_FFFF,
        }),
        _ => Err(Error::MalformedFrame(format!(
            "truncated response of {} bytes",
            value.len()
        ))),
    }
}

/// Parses a truncated `CALCULATE` response.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the truncated TLV is missing or has
/// the wrong size.
pub fn parse_calculate(data: &[u8]) -> Result<Truncated> {
    let entries = tlv::parse(data)?;
    let value = tlv::find(&entries, tag::TRUNCATED)
        .ok_or_else(|| Error::MalformedFrame("CALCULATE response without code".to_string()))?;
    truncated(value)
}

/// Outcome of one credential in a `CALCULATE ALL` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculatedCode {
    /// The token computed a code.
    Code(Truncated),
    /// HOTP credentials are not calculated in bulk.
    NotCalculated,
    /// The credential needs a touch before calculating.
    TouchRequired,
}

/// Parses a `CALCULATE ALL` response into `(name, outcome)` pairs.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] on inconsistent lengths or a name not
/// followed by a response.
pub fn parse_calculate_all(data: &[u8]) -> Result<Vec<(CredentialId, CalculatedCode)>> {
    let entries = tlv::parse(data)?;
    let mut out = Vec::with_capacity(entries.len() / 2);
    let mut iter = entries.into_iter();

    while let Some(name) = iter.next() {
        if name.tag != tag::NAME {
            return Err(Error::MalformedFrame(format!(
                "expected name, found tag {:#04x}",
                name.tag
            )));
        }
        let id = CredentialId::new(String::from_utf8_lossy(name.value));
        let response = iter
            .next()
            .ok_or_else(|| Error::MalformedFrame(format!("no response for {id}")))?;
        let code = match response.tag {
            tag::TRUNCATED => CalculatedCode::Code(truncated(response.value)?),
            tag::NO_RESPONSE => CalculatedCode::NotCalculated,
            tag::TOUCH => CalculatedCode::TouchRequired,
            other => {
                return Err(Error::MalformedFrame(format!(
                    "unexpected response tag {other:#04x} for {id}"
                )));
            }
        };
        out.push((id, code));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{Digits, Secret, Variant};

    fn draft(mode: Mode, secret: Vec<u8>) -> CredentialDraft {
        CredentialDraft {
            issuer: Some("Example".to_string()),
            label: "alice".to_string(),
            mode,
            algorithm: HashAlgorithm::Sha1,
            digits: Digits::SIX,
            variant: Variant::Standard,
            counter: 0,
            requires_touch: false,
            secret: Secret::new(secret),
        }
    }

    #[test]
    fn select_apdu() {
        assert_eq!(
            select().to_bytes(),
            vec![0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x05, 0x27, 0x21, 0x01]
        );
    }

    #[test]
    fn put_pads_short_keys() {
        let draft = draft(Mode::Time, vec![0xAA; 10]);
        let apdu = put(&draft, &draft.id()).unwrap();
        let entries = tlv::parse(apdu.data()).unwrap();

        assert_eq!(tlv::find(&entries, 0x71), Some(&b"Example:alice"[..]));
        let key = tlv::find(&entries, 0x73).unwrap();
        assert_eq!(key[0], 0x21);
        assert_eq!(key[1], 6);
        assert_eq!(key.len(), 2 + 14);
        assert_eq!(&key[12..], &[0, 0, 0, 0]);
    }

    #[test]
    fn put_hashes_long_keys() {
        let draft = draft(Mode::Time, vec![0x55; 100]);
        let apdu = put(&draft, &draft.id()).unwrap();
        let entries = tlv::parse(apdu.data()).unwrap();
        assert_eq!(tlv::find(&entries, 0x73).unwrap().len(), 2 + 20);
    }

    #[test]
    fn put_hotp_with_counter_and_touch() {
        let mut draft = draft(Mode::Counter, vec![0x01; 20]);
        draft.counter = 7;
        draft.requires_touch = true;
        let apdu = put(&draft, &draft.id()).unwrap();
        let data = apdu.data();

        // Name (2 + 13) and key (2 + 2 + 20) are plain TLVs; the property
        // byte that follows has no length.
        let key_end = 15 + 24;
        let entries = tlv::parse(&data[..key_end]).unwrap();
        assert_eq!(tlv::find(&entries, 0x73).unwrap()[0], 0x11);
        assert_eq!(&data[key_end..], &[0x78, 0x02, 0x7A, 0x04, 0, 0, 0, 7]);
    }

    #[test]
    fn put_rejects_long_names() {
        let draft = draft(Mode::Time, vec![1; 20]);
        let name = CredentialId::new("n".repeat(65));
        assert_eq!(put(&draft, &name).unwrap_err(), Error::NameTooLong(65));
    }

    #[test]
    fn put_rejects_oversized_counter() {
        let mut draft = draft(Mode::Counter, vec![1; 20]);
        draft.counter = u64::from(u32::MAX) + 1;
        assert!(matches!(
            put(&draft, &draft.id()),
            Err(Error::UnsupportedProvisioningFormat(_))
        ));
    }

    #[test]
    fn parse_select_locked() {
        let data = [
            0x79, 0x03, 0x05, 0x04, 0x03, // version
            0x71, 0x04, 0xDE, 0xAD, 0xBE, 0xEF, // id
            0x74, 0x08, 1, 2, 3, 4, 5, 6, 7, 8, // challenge
            0x7B, 0x01, 0x02, // algorithm
        ];
        let select = parse_select(&data).unwrap();

        assert_eq!(select.version, Version(5, 4, 3));
        assert_eq!(select.device_id, DeviceId::new(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert!(select.is_locked());
        assert_eq!(select.algorithm, HashAlgorithm::Sha256);
    }

    #[test]
    fn parse_select_unlocked_defaults() {
        let data = [0x71, 0x01, 0x01];
        let select = parse_select(&data).unwrap();
        assert!(!select.is_locked());
        assert_eq!(select.algorithm, HashAlgorithm::Sha1);
        assert!(parse_select(&[0x79, 0x01, 0x05]).is_err());
    }

    #[test]
    fn parse_list_entries() {
        let data = [
            0x72, 0x05, 0x21, b'm', b'a', b'i', b'l', //
            0x72, 0x04, 0x13, b'v', b'p', b'n',
        ];
        let list = parse_list(&data).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id.as_str(), "mail");
        assert_eq!(list[0].mode, Mode::Time);
        assert_eq!(list[1].mode, Mode::Counter);
        assert_eq!(list[1].algorithm, HashAlgorithm::Sha512);
    }

    #[test]
    fn parse_list_prefix_skips_truncated_tail() {
        let data = [0x72, 0x05, 0x21, b'm', b'a', b'i', b'l', 0x72, 0x09, 0x21, b'w'];
        assert!(parse_list(&data).is_err());
        let list = parse_list_prefix(&data);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id.as_str(), "mail");
    }

    #[test]
    fn parse_calculate_truncated() {
        let data = [0x76, 0x05, 0x06, 0x80, 0x00, 0x00, 0x2A];
        let code = parse_calculate(&data).unwrap();
        assert_eq!(code.digits, 6);
        assert_eq!(code.value, 42);
    }

    #[test]
    fn parse_calculate_all_outcomes() {
        let data = [
            0x71, 0x01, b'a', 0x76, 0x05, 0x06, 0, 0, 1, 0, //
            0x71, 0x01, b'b', 0x77, 0x00, //
            0x71, 0x01, b'c', 0x7C, 0x01, 0x06,
        ];
        let all = parse_calculate_all(&data).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(
            all[0].1,
            CalculatedCode::Code(Truncated {
                digits: 6,
                value: 256
            })
        );
        assert_eq!(all[1].1, CalculatedCode::NotCalculated);
        assert_eq!(all[2].1, CalculatedCode::TouchRequired);
        assert!(parse_calculate_all(&[0x71, 0x01, b'a']).is_err());
    }

    #[test]
    fn set_code_layout() {
        let key = AccessKey::from_bytes(vec![0x11; 16], HashAlgorithm::Sha1);
        let challenge = HostChallenge::from_bytes([9; 8]);
        let apdu = set_code(&key, &challenge).unwrap();
        let entries = tlv::parse(apdu.data()).unwrap();

        let key_tlv = tlv::find(&entries, 0x73).unwrap();
        assert_eq!(key_tlv[0], 0x01);
        assert_eq!(&key_tlv[1..], &[0x11; 16]);
        assert_eq!(tlv::find(&entries, 0x74), Some(&[9u8; 8][..]));
        assert_eq!(
            tlv::find(&entries, 0x75).unwrap(),
            auth::respond_to(&[9; 8], &key).unwrap().as_slice()
        );
        assert_eq!(clear_code().data(), &[0x73, 0x00]);
    }
}
