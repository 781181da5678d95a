//! BER-TLV helpers for OATH payloads.
//!
//! OATH commands and responses are flat sequences of tag-length-value
//! entries with one-byte tags. Lengths use the short form below 128 and the
//! `0x81`/`0x82` long forms above it.

use crate::error::{Error, Result};

/// One decoded TLV entry borrowing from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    /// Tag byte.
    pub tag: u8,

    /// Value bytes.
    pub value: &'a [u8],
}

/// Appends one TLV entry to `out`.
///
/// # Example
///
/// ```
/// use yubikey_oath_core::yubikey::tlv;
///
/// let mut out = Vec::new();
/// tlv::push(&mut out, 0x71, b"mail");
/// assert_eq!(out, vec![0x71, 0x04, b'm', b'a', b'i', b'l']);
/// ```
pub fn push(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    push_len(out, value.len());
    out.extend_from_slice(value);
}

/// Appends a BER length prefix.
pub(crate) fn push_len(out: &mut Vec<u8>, len: usize) {
    if let Ok(short) = u8::try_from(len)
        && short < 0x80
    {
        out.push(short);
    } else if let Ok(one) = u8::try_from(len) {
        out.extend_from_slice(&[0x81, one]);
    } else {
        let two = u16::try_from(len).unwrap_or(u16::MAX);
        out.push(0x82);
        out.extend_from_slice(&two.to_be_bytes());
    }
}

/// Decodes every TLV entry in `data`.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] when a length prefix is truncated or
/// points past the end of the buffer.
///
/// # Example
///
/// ```
/// use yubikey_oath_core::yubikey::tlv;
///
/// let entries = tlv::parse(&[0x79, 0x01, 0x05, 0x71, 0x00]).unwrap();
/// assert_eq!(entries.len(), 2);
/// assert_eq!(entries[0].value, &[0x05]);
/// assert!(tlv::parse(&[0x71, 0x05, 0x00]).is_err());
/// ```
pub fn parse(data: &[u8]) -> Result<Vec<Tlv<'_>>> {
    let mut entries = Vec::new();
    let mut rest = data;

    while let Some((&tag, tail)) = rest.split_first() {
        let (len, tail) = read_len(tail)?;
        if tail.len() < len {
            return Err(Error::MalformedFrame(format!(
                "tag {tag:#04x} declares {len} bytes, {} available",
                tail.len()
            )));
        }
        let (value, tail) = tail.split_at(len);
        entries.push(Tlv { tag, value });
        rest = tail;
    }

    Ok(entries)
}

/// Returns the value of the first entry carrying `tag`.
#[must_use]
pub fn find<'a>(entries: &[Tlv<'a>], tag: u8) -> Option<&'a [u8]> {
    entries.iter().find(|e| e.tag == tag).map(|e| e.value)
}

fn read_len(data: &[u8]) -> Result<(usize, &[u8])> {
    let truncated = || Error::MalformedFrame("truncated length prefix".to_string());

    match data.split_first() {
        None => Err(truncated()),
        Some((&0x81, tail)) => {
            let (&len, tail) = tail.split_first().ok_or_else(truncated)?;
            Ok((usize::from(len), tail))
        }
        Some((&0x82, tail)) => {
            let (len, tail) = tail.split_first_chunk::<2>().ok_or_else(truncated)?;
            Ok((usize::from(u16::from_be_bytes(*len)), tail))
        }
        Some((&len, _)) if len >= 0x80 => Err(Error::MalformedFrame(format!(
            "unsupported length form {len:#04x}"
        ))),
        Some((&len, tail)) => Ok((usize::from(len), tail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_short_and_long_lengths() {
        let mut out = Vec::new();
        push(&mut out, 0x73, &[0xAA; 3]);
        assert_eq!(&out[..2], &[0x73, 0x03]);

        let mut out = Vec::new();
        push(&mut out, 0x73, &[0xAA; 200]);
        assert_eq!(&out[..3], &[0x73, 0x81, 200]);

        let mut out = Vec::new();
        push(&mut out, 0x73, &[0xAA; 300]);
        assert_eq!(&out[..4], &[0x73, 0x82, 0x01, 0x2C]);
    }

    #[test]
    fn parse_roundtrips_long_values() {
        let mut out = Vec::new();
        push(&mut out, 0x71, &[0x01; 130]);
        push(&mut out, 0x74, &[0x02; 8]);

        let entries = parse(&out).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value.len(), 130);
        assert_eq!(find(&entries, 0x74), Some(&[0x02; 8][..]));
        assert_eq!(find(&entries, 0x75), None);
    }

    #[test]
    fn parse_rejects_truncated() {
        assert!(parse(&[0x71]).is_err());
        assert!(parse(&[0x71, 0x81]).is_err());
        assert!(parse(&[0x71, 0x82, 0x00]).is_err());
        assert!(parse(&[0x71, 0x83, 0x00, 0x00, 0x01]).is_err());
        assert!(parse(&[0x71, 0x02, 0x61]).is_err());
    }

    #[test]
    fn parse_empty() {
        assert!(parse(&[]).unwrap().is_empty());
    }
}
