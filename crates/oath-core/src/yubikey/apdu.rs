//! APDU (Application Protocol Data Unit) command and response types.
//!
//! This module is the frame codec of the engine: it encodes ISO 7816-4
//! command APDUs and decodes status-word-terminated responses. It is pure and
//! stateless; the session decides what to send and when.
//!
//! # APDU Command Structure
//!
//! ```text
//! | CLA | INS | P1 | P2 | Lc | Data |
//! |-----|-----|----|----|----|----- |
//! | 1B  | 1B  | 1B | 1B | 1B | Var  |
//! ```
//!
//! Commands whose data does not fit one frame are split with command
//! chaining: every frame but the last carries CLA bit `0x10`.
//!
//! # APDU Response Structure
//!
//! ```text
//! | Data | SW1 | SW2 |
//! |------|-----|-----|
//! | Var  | 1B  | 1B  |
//! ```
//!
//! The OATH applet answers `61 xx` when more response data is waiting; the
//! host fetches it with `SEND REMAINING` and concatenates the payloads.
//!
//! # Example
//!
//! ```
//! use yubikey_oath_core::yubikey::{Apdu, ApduResponse};
//!
//! // SELECT the OATH applet
//! let apdu = Apdu::new(0x00, 0xA4, 0x04, 0x00, vec![
//!     0xA0, 0x00, 0x00, 0x05, 0x27, 0x21, 0x01
//! ]);
//! assert_eq!(apdu.to_bytes().len(), 12);
//!
//! let response = ApduResponse::parse(&[0x79, 0x03, 0x05, 0x04, 0x03, 0x90, 0x00]).unwrap();
//! assert!(response.is_success());
//! ```

use crate::error::{Error, Result};

/// Status words used by the OATH applet.
pub mod sw {
    /// Command completed.
    pub const SUCCESS: u16 = 0x9000;

    /// High byte signalling that more response data is available.
    pub const MORE_DATA: u8 = 0x61;

    /// No space left for a new credential.
    pub const NO_SPACE: u16 = 0x6A84;

    /// The named object does not exist.
    pub const NO_SUCH_OBJECT: u16 = 0x6984;

    /// The command requires a prior VALIDATE.
    pub const AUTH_REQUIRED: u16 = 0x6982;

    /// Wrong syntax; VALIDATE answers this for a wrong response.
    pub const WRONG_SYNTAX: u16 = 0x6A80;

    /// Generic applet error.
    pub const GENERIC_ERROR: u16 = 0x6581;

    /// SELECT answered before the applet finished initialising.
    pub const NOT_READY: u16 = 0x6883;
}

/// CLA bit marking a frame that is followed by more chained data.
const CLA_CHAINING: u8 = 0x10;

/// An APDU command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    /// Class byte.
    cla: u8,

    /// Instruction byte.
    ins: u8,

    /// Parameter 1.
    p1: u8,

    /// Parameter 2.
    p2: u8,

    /// Command data.
    data: Vec<u8>,
}

impl Apdu {
    /// Maximum short APDU data length.
    pub const MAX_SHORT_DATA: usize = 255;

    /// Creates a new APDU command.
    ///
    /// # Arguments
    ///
    /// * `cla` - Class byte
    /// * `ins` - Instruction byte
    /// * `p1` - Parameter 1
    /// * `p2` - Parameter 2
    /// * `data` - Command data
    #[must_use]
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
        }
    }

    /// Returns the class byte.
    #[must_use]
    pub const fn cla(&self) -> u8 {
        self.cla
    }

    /// Returns the instruction byte.
    #[must_use]
    pub const fn ins(&self) -> u8 {
        self.ins
    }

    /// Returns parameter 1.
    #[must_use]
    pub const fn p1(&self) -> u8 {
        self.p1
    }

    /// Returns parameter 2.
    #[must_use]
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// Returns the command data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes the APDU to bytes.
    ///
    /// Uses the short form when the data fits in 255 bytes and the extended
    /// form otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// use yubikey_oath_core::yubikey::Apdu;
    ///
    /// let apdu = Apdu::new(0x00, 0xA1, 0x00, 0x00, vec![]);
    /// assert_eq!(apdu.to_bytes(), vec![0x00, 0xA1, 0x00, 0x00]);
    /// ```
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(7 + self.data.len());
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if self.data.is_empty() {
            return bytes;
        }

        if let Ok(len) = u8::try_from(self.data.len()) {
            bytes.push(len);
            bytes.extend_from_slice(&self.data);
        } else {
            // Extended Lc; data beyond 65535 bytes cannot be expressed.
            let len = u16::try_from(self.data.len()).unwrap_or(u16::MAX);
            bytes.push(0x00);
            bytes.extend_from_slice(&len.to_be_bytes());
            bytes.extend_from_slice(&self.data[..usize::from(len)]);
        }

        bytes
    }

    /// Splits the command into chained frames of at most `max_payload` data
    /// bytes each.
    ///
    /// A command that fits returns a single frame identical to
    /// [`to_bytes`](Self::to_bytes). A `max_payload` of zero is treated as
    /// [`MAX_SHORT_DATA`](Self::MAX_SHORT_DATA).
    ///
    /// # Example
    ///
    /// ```
    /// use yubikey_oath_core::yubikey::Apdu;
    ///
    /// let apdu = Apdu::new(0x00, 0x01, 0x00, 0x00, vec![0xAB; 10]);
    /// let frames = apdu.to_chained_frames(4);
    /// assert_eq!(frames.len(), 3);
    /// assert_eq!(frames[0][0], 0x10);
    /// assert_eq!(frames[2][0], 0x00);
    /// ```
    #[must_use]
    pub fn to_chained_frames(&self, max_payload: usize) -> Vec<Vec<u8>> {
        let max_payload = if max_payload == 0 {
            Self::MAX_SHORT_DATA
        } else {
            max_payload
        };

        if self.data.len() <= max_payload {
            return vec![self.to_bytes()];
        }

        let chunks: Vec<&[u8]> = self.data.chunks(max_payload).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let cla = if i == last {
                    self.cla
                } else {
                    self.cla | CLA_CHAINING
                };
                Apdu::new(cla, self.ins, self.p1, self.p2, chunk.to_vec()).to_bytes()
            })
            .collect()
    }
}

/// An APDU response from a smart card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    /// Response data.
    data: Vec<u8>,

    /// Status word 1.
    sw1: u8,

    /// Status word 2.
    sw2: u8,
}

impl ApduResponse {
    /// Parses a response frame into payload and status word.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] if the frame is shorter than the
    /// two-byte status word terminator.
    ///
    /// # Example
    ///
    /// ```
    /// use yubikey_oath_core::yubikey::ApduResponse;
    ///
    /// let response = ApduResponse::parse(&[0x01, 0x02, 0x90, 0x00]).unwrap();
    /// assert_eq!(response.data(), &[0x01, 0x02]);
    /// assert!(ApduResponse::parse(&[0x90]).is_err());
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let Some((data, status)) = bytes.split_last_chunk::<2>() else {
            return Err(Error::MalformedFrame(format!(
                "response of {} bytes has no status word",
                bytes.len()
            )));
        };

        Ok(Self {
            data: data.to_vec(),
            sw1: status[0],
            sw2: status[1],
        })
    }

    /// Returns the response data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the response and returns the data.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Returns status word 1.
    #[must_use]
    pub const fn sw1(&self) -> u8 {
        self.sw1
    }

    /// Returns status word 2.
    #[must_use]
    pub const fn sw2(&self) -> u8 {
        self.sw2
    }

    /// Returns the full status word as a [`u16`].
    #[must_use]
    pub const fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// Checks if the response indicates success (`SW = 0x9000`).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status_word() == sw::SUCCESS
    }

    /// Checks if more data is available (`SW1 = 0x61`).
    #[must_use]
    pub const fn has_more_data(&self) -> bool {
        self.sw1 == sw::MORE_DATA
    }

    /// Checks the response status and returns an error if not successful.
    ///
    /// # Errors
    ///
    /// Returns the error mapped by [`to_error`](Self::to_error) if the status
    /// word is neither `0x9000` nor `0x61xx`.
    pub fn check(&self) -> Result<()> {
        if self.is_success() || self.has_more_data() {
            Ok(())
        } else {
            Err(self.to_error())
        }
    }

    /// Converts the status word to a descriptive error.
    ///
    /// Errors that name a credential carry an empty name; callers that know
    /// the credential replace it.
    #[must_use]
    pub fn to_error(&self) -> Error {
        match self.status_word() {
            sw::NO_SPACE => Error::NoSpace,
            sw::NO_SUCH_OBJECT => Error::NotFound(String::new()),
            sw::AUTH_REQUIRED => Error::AuthRequired,
            sw::WRONG_SYNTAX => Error::WrongPassword,
            other => Error::UnexpectedStatusWord(other),
        }
    }
}
