//! Challenge-response authentication for password protected applets.
//!
//! The OATH applet never sees the password. Both sides share an access key
//! derived from it, and each proves possession by answering the other's
//! random challenge with an HMAC:
//!
//! ```text
//!  host                                            token
//!   │  SELECT                                        │
//!   │ ─────────────────────────────────────────────▶ │
//!   │            id (salt), token challenge          │
//!   │ ◀───────────────────────────────────────────── │
//!   │  key = PBKDF2(password, id, 1000, 16)          │
//!   │  VALIDATE HMAC(key, token challenge),          │
//!   │           host challenge                       │
//!   │ ─────────────────────────────────────────────▶ │
//!   │            HMAC(key, host challenge)           │
//!   │ ◀───────────────────────────────────────────── │
//!   │  verify in constant time                       │
//! ```
//!
//! Deriving the key is deliberately slow. The engine hands it out as a
//! [`DerivationJob`] that the host runs wherever it likes, so a presence-lost
//! event is never stuck behind PBKDF2.
//!
//! # Example
//!
//! ```
//! use yubikey_oath_core::auth::{self, IterationPolicy, Password};
//!
//! let password = Password::new("hunter2").unwrap();
//! let key = auth::derive(&password, b"\x01\x02\x03\x04", &IterationPolicy::default()).unwrap();
//!
//! let challenge = [0u8; 8];
//! let response = auth::respond_to(&challenge, &key).unwrap();
//! assert!(auth::verify(&challenge, &key, &response).is_ok());
//! ```

use std::fmt;

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::credential::HashAlgorithm;
use crate::error::{Error, Result};

/// Length of host and token challenges in bytes.
pub const CHALLENGE_LEN: usize = 8;

/// A user password, wiped on drop.
#[derive(Clone)]
pub struct Password(Zeroizing<String>);

impl Password {
    /// Wraps a password.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyPassword`] for an empty string; an empty password
    /// means "no password" and is expressed by clearing the code instead.
    pub fn new(password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::EmptyPassword);
        }
        Ok(Self(Zeroizing::new(password.to_string())))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

/// Derived access key, wiped on drop.
#[derive(Clone)]
pub struct AccessKey {
    key: Zeroizing<Vec<u8>>,
    algorithm: HashAlgorithm,
}

impl AccessKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn from_bytes(key: Vec<u8>, algorithm: HashAlgorithm) -> Self {
        Self {
            key: Zeroizing::new(key),
            algorithm,
        }
    }

    /// Returns the key bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.key
    }

    /// Returns the HMAC digest the key is used with.
    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

impl PartialEq for AccessKey {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && bool::from(self.key.ct_eq(&other.key))
    }
}

impl Eq for AccessKey {}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Parameters of the password derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationPolicy {
    /// PBKDF2 rounds.
    pub iterations: u32,
    /// Output length in bytes.
    pub key_len: usize,
    /// PRF digest, taken from the token's SELECT response.
    pub algorithm: HashAlgorithm,
}

impl IterationPolicy {
    /// Rounds used by every OATH client.
    pub const DEFAULT_ITERATIONS: u32 = 1000;

    /// Key length used by every OATH client.
    pub const DEFAULT_KEY_LEN: usize = 16;

    /// Returns the policy with another PRF digest.
    #[must_use]
    pub const fn with_algorithm(self, algorithm: HashAlgorithm) -> Self {
        Self { algorithm, ..self }
    }
}

impl Default for IterationPolicy {
    fn default() -> Self {
        Self {
            iterations: Self::DEFAULT_ITERATIONS,
            key_len: Self::DEFAULT_KEY_LEN,
            algorithm: HashAlgorithm::Sha1,
        }
    }
}

/// Derives the access key for `password` salted with the token id.
///
/// # Errors
///
/// Returns [`Error::InvalidKeyLength`] if the policy asks for an empty key.
pub fn derive(password: &Password, salt: &[u8], policy: &IterationPolicy) -> Result<AccessKey> {
    if policy.key_len == 0 {
        return Err(Error::InvalidKeyLength);
    }

    let mut key = Zeroizing::new(vec![0u8; policy.key_len]);
    let rounds = policy.iterations.max(1);
    match policy.algorithm {
        HashAlgorithm::Sha1 => {
            pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, rounds, &mut key);
        }
        HashAlgorithm::Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut key);
        }
        HashAlgorithm::Sha512 => {
            pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, rounds, &mut key);
        }
    }

    Ok(AccessKey {
        key,
        algorithm: policy.algorithm,
    })
}

/// Computes the response to `challenge` with `key`.
///
/// # Errors
///
/// Returns [`Error::InvalidKeyLength`] if the key cannot seed the MAC.
pub fn respond_to(challenge: &[u8], key: &AccessKey) -> Result<Vec<u8>> {
    hmac(key.algorithm, key.expose(), challenge)
}

/// Verifies the token's answer to our challenge in constant time.
///
/// # Errors
///
/// Returns [`Error::AuthMismatch`] if `response` is not
/// `HMAC(key, challenge)`.
pub fn verify(challenge: &[u8], key: &AccessKey, response: &[u8]) -> Result<()> {
    let expected = respond_to(challenge, key)?;
    if bool::from(expected.ct_eq(response)) {
        Ok(())
    } else {
        Err(Error::AuthMismatch)
    }
}

/// Computes `HMAC(algorithm, key, message)`.
///
/// # Errors
///
/// Returns [`Error::InvalidKeyLength`] if the key cannot seed the MAC.
pub fn hmac(algorithm: HashAlgorithm, key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    macro_rules! mac {
        ($digest:ty) => {{
            let mut mac =
                Hmac::<$digest>::new_from_slice(key).map_err(|_| Error::InvalidKeyLength)?;
            mac.update(message);
            Ok(mac.finalize().into_bytes().to_vec())
        }};
    }

    match algorithm {
        HashAlgorithm::Sha1 => mac!(Sha1),
        HashAlgorithm::Sha256 => mac!(Sha256),
        HashAlgorithm::Sha512 => mac!(Sha512),
    }
}

/// Hashes `data` with `algorithm`.
#[must_use]
pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

/// A random challenge sent by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostChallenge([u8; CHALLENGE_LEN]);

impl HostChallenge {
    /// Draws a challenge from the operating system RNG.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps fixed challenge bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CHALLENGE_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the challenge bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CHALLENGE_LEN] {
        &self.0
    }
}

/// Identifies one requested derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DerivationTicket(pub(crate) u64);

/// A password derivation to run off the event path.
pub struct DerivationJob {
    ticket: DerivationTicket,
    password: Password,
    salt: Vec<u8>,
    policy: IterationPolicy,
}

impl DerivationJob {
    pub(crate) fn new(
        ticket: DerivationTicket,
        password: Password,
        salt: Vec<u8>,
        policy: IterationPolicy,
    ) -> Self {
        Self {
            ticket,
            password,
            salt,
            policy,
        }
    }

    /// Returns the ticket the result will carry.
    #[must_use]
    pub const fn ticket(&self) -> DerivationTicket {
        self.ticket
    }

    /// Runs PBKDF2. CPU bound; call it from a worker, not the event loop.
    #[must_use]
    pub fn run(self) -> DerivedKey {
        let key = derive(&self.password, &self.salt, &self.policy);
        DerivedKey {
            ticket: self.ticket,
            key,
        }
    }
}

impl fmt::Debug for DerivationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivationJob")
            .field("ticket", &self.ticket)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Result of a [`DerivationJob`].
#[derive(Debug)]
pub struct DerivedKey {
    /// Ticket of the job that produced this key.
    pub ticket: DerivationTicket,
    /// The derived key, or why derivation failed.
    pub key: Result<AccessKey>,
}
