//! A simulated OATH applet.
//!
//! It decodes the frames the engine sends exactly as a token would: command
//! chaining, 0x61xx continuations, mutual authentication and the OATH
//! instruction set. Faults are injected by cutting the link at a chosen frame.

#![allow(dead_code)]

use yubikey_oath_core::auth::{self, AccessKey, IterationPolicy, Password};
use yubikey_oath_core::credential::HashAlgorithm;
use yubikey_oath_core::yubikey::Transport;
use yubikey_oath_core::{Error, Result};

const OK: u16 = 0x9000;

#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub name: Vec<u8>,
    pub type_alg: u8,
    pub digits: u8,
    pub key: Vec<u8>,
    pub counter: u64,
    pub touch: bool,
}

#[derive(Debug, Clone, Copy)]
struct Cut {
    at_frame: usize,
    applied: bool,
}

#[derive(Debug)]
pub struct SimulatedToken {
    pub device_id: Vec<u8>,
    pub credentials: Vec<StoredCredential>,
    pub access_key: Option<Vec<u8>>,
    /// Most credentials the applet accepts.
    pub capacity: usize,
    /// Largest response body sent before switching to 0x61xx.
    pub max_response: usize,
    /// SELECTs to answer with 0x6883 before answering normally.
    pub not_ready: u8,
    /// Answer VALIDATE with a wrong proof.
    pub forge_proof: bool,
    /// Every frame received, across presentments.
    pub received: Vec<Vec<u8>>,
    present: bool,
    validated: bool,
    challenge: [u8; 8],
    selects: u8,
    chain: Vec<u8>,
    remaining: Vec<u8>,
    cut: Option<Cut>,
}

impl SimulatedToken {
    pub fn new(device_id: &[u8]) -> Self {
        Self {
            device_id: device_id.to_vec(),
            credentials: Vec::new(),
            access_key: None,
            capacity: 32,
            max_response: 250,
            not_ready: 0,
            forge_proof: false,
            received: Vec::new(),
            present: true,
            validated: false,
            challenge: [0; 8],
            selects: 0,
            chain: Vec::new(),
            remaining: Vec::new(),
            cut: None,
        }
    }

    pub fn with_totp(mut self, name: &str, secret: &[u8]) -> Self {
        self.credentials.push(StoredCredential {
            name: name.as_bytes().to_vec(),
            type_alg: 0x21,
            digits: 6,
            key: secret.to_vec(),
            counter: 0,
            touch: false,
        });
        self
    }

    pub fn with_hotp(mut self, name: &str, secret: &[u8]) -> Self {
        self.credentials.push(StoredCredential {
            name: name.as_bytes().to_vec(),
            type_alg: 0x11,
            digits: 6,
            key: secret.to_vec(),
            counter: 0,
            touch: false,
        });
        self
    }

    /// Protects the applet the way a client would, with the default policy.
    pub fn with_password(mut self, password: &str) -> Self {
        self.access_key = Some(self.key_for(password).expose().to_vec());
        self
    }

    pub fn key_for(&self, password: &str) -> AccessKey {
        let password = Password::new(password).unwrap();
        auth::derive(&password, &self.device_id, &IterationPolicy::default()).unwrap()
    }

    pub fn has(&self, name: &str) -> bool {
        self.credential(name).is_some()
    }

    pub fn credential(&self, name: &str) -> Option<&StoredCredential> {
        self.credentials.iter().find(|c| c.name == name.as_bytes())
    }

    pub fn names(&self) -> Vec<String> {
        self.credentials
            .iter()
            .map(|c| String::from_utf8_lossy(&c.name).into_owned())
            .collect()
    }

    /// Drops the link on the `n`th frame from now. With `applied`, the token
    /// executes that frame before the link goes down.
    pub fn cut_after(&mut self, n: usize, applied: bool) {
        self.cut = Some(Cut {
            at_frame: self.received.len() + n,
            applied,
        });
    }

    /// Brings the token back into the field.
    pub fn reinsert(&mut self) {
        self.present = true;
    }

    /// Instruction bytes of the frames received since index `from`.
    pub fn instructions_since(&self, from: usize) -> Vec<u8> {
        self.received[from..].iter().map(|frame| frame[1]).collect()
    }

    fn process(&mut self, frame: &[u8]) -> Vec<u8> {
        let Some((cla, ins, p1, data)) = split_command(frame) else {
            return status(0x6700);
        };
        if ins != 0xA5 {
            self.remaining.clear();
        }
        if cla & 0x10 != 0 {
            self.chain.extend_from_slice(data);
            return status(OK);
        }
        let mut payload = std::mem::take(&mut self.chain);
        payload.extend_from_slice(data);

        let locked = self.access_key.is_some() && !self.validated;
        let (body, sw) = match (ins, p1) {
            (0xA4, 0x04) => self.select(),
            (0xA5, _) => return self.next_chunk(),
            (0xA3, _) => self.validate(&payload),
            _ if locked => (Vec::new(), 0x6982),
            (0xA1, _) => self.list(),
            (0x01, _) => self.put(&payload),
            (0x02, _) => self.delete(&payload),
            (0x03, _) => self.set_code(&payload),
            (0x04, _) => self.reset(),
            (0xA2, _) => self.calculate(&payload),
            (0xA4, _) => self.calculate_all(&payload),
            _ => (Vec::new(), 0x6D00),
        };
        if sw == OK {
            self.respond(body)
        } else {
            status(sw)
        }
    }

    fn respond(&mut self, mut body: Vec<u8>) -> Vec<u8> {
        if body.len() <= self.max_response {
            body.extend_from_slice(&OK.to_be_bytes());
            return body;
        }
        self.remaining = body.split_off(self.max_response);
        let left = u8::try_from(self.remaining.len()).unwrap_or(0xFF);
        body.extend_from_slice(&[0x61, left]);
        body
    }

    fn next_chunk(&mut self) -> Vec<u8> {
        let body = std::mem::take(&mut self.remaining);
        self.respond(body)
    }

    fn select(&mut self) -> (Vec<u8>, u16) {
        self.validated = false;
        self.chain.clear();
        if self.not_ready > 0 {
            self.not_ready -= 1;
            return (Vec::new(), 0x6883);
        }
        self.selects = self.selects.wrapping_add(1);
        self.challenge = [self.selects, 0xC4, 0xA1, 0x1E, 0x46, 0xE0, 0x42, self.selects];

        let mut body = vec![0x79, 0x03, 0x05, 0x04, 0x03];
        push(&mut body, 0x71, &self.device_id);
        if self.access_key.is_some() {
            push(&mut body, 0x74, &self.challenge);
            body.extend_from_slice(&[0x7B, 0x01, 0x01]);
        }
        (body, OK)
    }

    fn validate(&mut self, payload: &[u8]) -> (Vec<u8>, u16) {
        let Some(key) = self.access_key.clone() else {
            return (Vec::new(), 0x6984);
        };
        let fields = fields(payload);
        let (Some(response), Some(host_challenge)) = (find(&fields, 0x75), find(&fields, 0x74))
        else {
            return (Vec::new(), 0x6A80);
        };
        if response != mac(HashAlgorithm::Sha1, &key, &self.challenge) {
            return (Vec::new(), 0x6A80);
        }
        self.validated = true;
        let mut proof = mac(HashAlgorithm::Sha1, &key, host_challenge);
        if self.forge_proof {
            proof[0] ^= 0xFF;
        }
        let mut body = Vec::new();
        push(&mut body, 0x75, &proof);
        (body, OK)
    }

    fn list(&self) -> (Vec<u8>, u16) {
        let mut body = Vec::new();
        for credential in &self.credentials {
            let mut value = vec![credential.type_alg];
            value.extend_from_slice(&credential.name);
            push(&mut body, 0x72, &value);
        }
        (body, OK)
    }

    fn put(&mut self, payload: &[u8]) -> (Vec<u8>, u16) {
        let fields = fields(payload);
        let (Some(name), Some(key)) = (find(&fields, 0x71), find(&fields, 0x73)) else {
            return (Vec::new(), 0x6A80);
        };
        let [type_alg, digits, secret @ ..] = key else {
            return (Vec::new(), 0x6A80);
        };
        let counter = find(&fields, 0x7A)
            .and_then(|imf| <[u8; 4]>::try_from(imf).ok())
            .map_or(0, |imf| u64::from(u32::from_be_bytes(imf)));
        let credential = StoredCredential {
            name: name.to_vec(),
            type_alg: *type_alg,
            digits: *digits,
            key: secret.to_vec(),
            counter,
            touch: find(&fields, 0x78).is_some_and(|p| p == [0x02].as_slice()),
        };

        if let Some(existing) = self.credentials.iter_mut().find(|c| c.name == name) {
            *existing = credential;
        } else if self.credentials.len() >= self.capacity {
            return (Vec::new(), 0x6A84);
        } else {
            self.credentials.push(credential);
        }
        (Vec::new(), OK)
    }

    fn delete(&mut self, payload: &[u8]) -> (Vec<u8>, u16) {
        let fields = fields(payload);
        let Some(name) = find(&fields, 0x71) else {
            return (Vec::new(), 0x6A80);
        };
        let before = self.credentials.len();
        self.credentials.retain(|c| c.name != name);
        if self.credentials.len() == before {
            (Vec::new(), 0x6984)
        } else {
            (Vec::new(), OK)
        }
    }

    fn set_code(&mut self, payload: &[u8]) -> (Vec<u8>, u16) {
        let fields = fields(payload);
        match find(&fields, 0x73) {
            Some([]) => {
                self.access_key = None;
                (Vec::new(), OK)
            }
            Some([_algorithm, key @ ..]) => {
                let (Some(challenge), Some(response)) = (find(&fields, 0x74), find(&fields, 0x75))
                else {
                    return (Vec::new(), 0x6A80);
                };
                if response != mac(HashAlgorithm::Sha1, key, challenge) {
                    return (Vec::new(), 0x6A80);
                }
                self.access_key = Some(key.to_vec());
                (Vec::new(), OK)
            }
            None => (Vec::new(), 0x6A80),
        }
    }

    fn reset(&mut self) -> (Vec<u8>, u16) {
        self.credentials.clear();
        self.access_key = None;
        self.validated = false;
        if let Some(last) = self.device_id.last_mut() {
            *last = last.wrapping_add(1);
        }
        (Vec::new(), OK)
    }

    fn calculate(&mut self, payload: &[u8]) -> (Vec<u8>, u16) {
        let fields = fields(payload);
        let (Some(name), Some(challenge)) = (find(&fields, 0x71), find(&fields, 0x74)) else {
            return (Vec::new(), 0x6A80);
        };
        let Some(credential) = self.credentials.iter_mut().find(|c| c.name == name) else {
            return (Vec::new(), 0x6984);
        };
        let message = if credential.type_alg & 0xF0 == 0x10 {
            let counter = credential.counter;
            credential.counter += 1;
            counter.to_be_bytes().to_vec()
        } else {
            challenge.to_vec()
        };
        let credential = credential.clone();
        let mut body = Vec::new();
        push(&mut body, 0x76, &truncate(&credential, &message));
        (body, OK)
    }

    fn calculate_all(&self, payload: &[u8]) -> (Vec<u8>, u16) {
        let fields = fields(payload);
        let Some(challenge) = find(&fields, 0x74) else {
            return (Vec::new(), 0x6A80);
        };
        let mut body = Vec::new();
        for credential in &self.credentials {
            push(&mut body, 0x71, &credential.name);
            if credential.type_alg & 0xF0 == 0x10 {
                push(&mut body, 0x77, &[credential.digits]);
            } else if credential.touch {
                push(&mut body, 0x7C, &[credential.digits]);
            } else {
                push(&mut body, 0x76, &truncate(credential, challenge));
            }
        }
        (body, OK)
    }
}

impl Transport for SimulatedToken {
    fn transmit(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if !self.present {
            return Err(Error::TransportError("token left the field".to_string()));
        }
        self.received.push(frame.to_vec());
        if let Some(cut) = self.cut
            && self.received.len() >= cut.at_frame
        {
            self.cut = None;
            self.present = false;
            if cut.applied {
                let _ = self.process(frame);
            }
            return Err(Error::TransportError("token left the field".to_string()));
        }
        Ok(self.process(frame))
    }

    fn is_connected(&self) -> bool {
        self.present
    }
}

fn split_command(frame: &[u8]) -> Option<(u8, u8, u8, &[u8])> {
    let [cla, ins, p1, _p2, rest @ ..] = frame else {
        return None;
    };
    let data = match rest {
        [] => &[][..],
        [0x00, hi, lo, data @ ..] => {
            let len = usize::from(u16::from_be_bytes([*hi, *lo]));
            data.get(..len)?
        }
        [len, data @ ..] => data.get(..usize::from(*len))?,
    };
    Some((*cla, *ins, *p1, data))
}

/// Decodes command fields. The property tag 0x78 carries one byte and no
/// length, like the applet expects.
fn fields(mut data: &[u8]) -> Vec<(u8, &[u8])> {
    let mut out = Vec::new();
    while let [tag, rest @ ..] = data {
        if *tag == 0x78 {
            let Some((value, rest)) = rest.split_first_chunk::<1>() else {
                break;
            };
            out.push((*tag, &value[..]));
            data = rest;
            continue;
        }
        let (len, rest) = match rest {
            [0x81, len, rest @ ..] => (usize::from(*len), rest),
            [0x82, hi, lo, rest @ ..] => (usize::from(u16::from_be_bytes([*hi, *lo])), rest),
            [len, rest @ ..] => (usize::from(*len), rest),
            [] => break,
        };
        if rest.len() < len {
            break;
        }
        let (value, rest) = rest.split_at(len);
        out.push((*tag, value));
        data = rest;
    }
    out
}

fn find<'a>(fields: &[(u8, &'a [u8])], tag: u8) -> Option<&'a [u8]> {
    fields.iter().find(|(t, _)| *t == tag).map(|(_, v)| *v)
}

fn push(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    let len = u8::try_from(value.len()).unwrap();
    if len >= 0x80 {
        out.push(0x81);
    }
    out.push(len);
    out.extend_from_slice(value);
}

fn status(sw: u16) -> Vec<u8> {
    sw.to_be_bytes().to_vec()
}

fn algorithm(type_alg: u8) -> HashAlgorithm {
    HashAlgorithm::from_alg_bits(type_alg).unwrap()
}

fn mac(algorithm: HashAlgorithm, key: &[u8], message: &[u8]) -> Vec<u8> {
    auth::hmac(algorithm, key, message).unwrap()
}

/// Digit count followed by the dynamically truncated 31-bit value.
fn truncate(credential: &StoredCredential, message: &[u8]) -> Vec<u8> {
    let digest = mac(algorithm(credential.type_alg), &credential.key, message);
    let offset = usize::from(digest[digest.len() - 1] & 0x0F);
    let value = u32::from_be_bytes([
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]) & 0x7FFF_FFFF;
    let mut out = vec![credential.digits];
    out.extend_from_slice(&value.to_be_bytes());
    out
}
