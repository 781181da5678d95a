//! Provisioning URIs checked against recorded vectors.

// Silence unused crate dependency warnings for test binary
use base64 as _;
use hmac as _;
#[cfg(feature = "pcsc")]
use pcsc as _;
use pbkdf2 as _;
use prost as _;
use rand as _;
use sha1 as _;
use sha2 as _;
use subtle as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;
use urlencoding as _;
use zeroize as _;

use serde::Deserialize;
use yubikey_oath_core::credential::Variant;
use yubikey_oath_core::{provisioning, Error};

const VECTORS: &str = include_str!("provisioning_vectors.json");

#[derive(Debug, Deserialize)]
struct Vectors {
    accepted: Vec<Accepted>,
    rejected: Vec<Rejected>,
}

#[derive(Debug, Deserialize)]
struct Accepted {
    uri: String,
    credentials: Vec<Expected>,
}

#[derive(Debug, Deserialize)]
struct Expected {
    name: String,
    mode: String,
    algorithm: String,
    digits: u8,
    counter: u64,
    steam: bool,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct Rejected {
    uri: String,
    reason: String,
}

fn vectors() -> Vectors {
    serde_json::from_str(VECTORS).unwrap()
}

#[test]
fn accepted_uris() {
    for vector in vectors().accepted {
        let drafts = provisioning::parse_any(&vector.uri)
            .unwrap_or_else(|e| panic!("{} rejected: {e}", vector.uri));
        assert_eq!(drafts.len(), vector.credentials.len(), "{}", vector.uri);

        for (draft, expected) in drafts.iter().zip(&vector.credentials) {
            assert_eq!(draft.id().as_str(), expected.name, "{}", vector.uri);
            assert_eq!(draft.mode.uri_name(), expected.mode, "{}", vector.uri);
            assert_eq!(draft.algorithm.name(), expected.algorithm, "{}", vector.uri);
            assert_eq!(draft.digits.get(), expected.digits, "{}", vector.uri);
            assert_eq!(draft.counter, expected.counter, "{}", vector.uri);
            assert_eq!(draft.variant == Variant::Steam, expected.steam, "{}", vector.uri);
            assert_eq!(hex::encode(draft.secret.expose()), expected.secret, "{}", vector.uri);
        }
    }
}

#[test]
fn rejected_uris() {
    for vector in vectors().rejected {
        let result = provisioning::parse_any(&vector.uri);
        assert!(
            matches!(result, Err(Error::UnsupportedProvisioningFormat(_))),
            "{} ({}) gave {result:?}",
            vector.uri,
            vector.reason
        );
    }
}

#[test]
fn single_uris_survive_serialization() {
    for vector in vectors().accepted {
        if vector.uri.starts_with("otpauth-migration") {
            continue;
        }
        let draft = provisioning::parse(&vector.uri).unwrap();
        let again = provisioning::parse(&provisioning::to_uri(&draft)).unwrap();
        assert_eq!(again, draft, "{}", vector.uri);
    }
}
