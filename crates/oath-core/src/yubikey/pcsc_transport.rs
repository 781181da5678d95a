//! PC/SC transport for native readers.
//!
//! This module provides a [`Transport`] implementation using the PC/SC
//! (Personal Computer/Smart Card) interface. It serves both USB-attached
//! YubiKeys and NFC readers with a YubiKey held against them.
//!
//! # Example
//!
//! ```ignore
//! use yubikey_oath_core::yubikey::PcscTransport;
//!
//! let mut transport = PcscTransport::connect()?;
//! engine.run_presentment(&mut transport);
//! ```

use pcsc::{Card, Context, Protocols, Scope, ShareMode};
use tracing::debug;

use super::Transport;
use crate::error::{Error, Result};

/// Substrings identifying readers that can host an OATH token.
const READER_HINTS: [&str; 3] = ["Yubico", "YubiKey", "NFC"];

/// Largest response a short APDU exchange can return.
const MAX_RESPONSE_LEN: usize = 258;

/// A PC/SC transport bound to one reader.
pub struct PcscTransport {
    /// The PC/SC card handle.
    card: Card,
}

impl std::fmt::Debug for PcscTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscTransport").finish_non_exhaustive()
    }
}

impl PcscTransport {
    /// Connects to the first reader with a token present.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if no suitable reader is found
    /// - [`Error::ConnectionFailed`] if connection fails
    pub fn connect() -> Result<Self> {
        let ctx = establish()?;

        let mut readers_buf = vec![0u8; 2048];
        let readers = ctx
            .list_readers(&mut readers_buf)
            .map_err(|e| Error::ConnectionFailed(format!("failed to list readers: {e}")))?;

        let reader = readers
            .into_iter()
            .find(|reader| is_token_reader(&reader.to_string_lossy()))
            .ok_or(Error::DeviceNotFound)?;
        debug!(reader = %reader.to_string_lossy(), "connecting");

        let card = ctx
            .connect(reader, ShareMode::Shared, Protocols::ANY)
            .map_err(|e| Error::ConnectionFailed(format!("failed to connect to reader: {e}")))?;

        Ok(Self { card })
    }

    /// Lists readers that can host an OATH token.
    ///
    /// # Errors
    ///
    /// Returns an error if the PC/SC context cannot be established.
    pub fn list_readers() -> Result<Vec<String>> {
        let ctx = establish()?;

        let mut readers_buf = vec![0u8; 2048];
        let readers = ctx
            .list_readers(&mut readers_buf)
            .map_err(|e| Error::ConnectionFailed(format!("failed to list readers: {e}")))?;

        Ok(readers
            .into_iter()
            .map(|r| r.to_string_lossy().into_owned())
            .filter(|name| is_token_reader(name))
            .collect())
    }
}

fn establish() -> Result<Context> {
    Context::establish(Scope::User)
        .map_err(|e| Error::ConnectionFailed(format!("failed to establish PC/SC context: {e}")))
}

fn is_token_reader(name: &str) -> bool {
    READER_HINTS.iter().any(|hint| name.contains(hint))
}

impl Transport for PcscTransport {
    fn transmit(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut response_buf = vec![0u8; MAX_RESPONSE_LEN];

        let response = self
            .card
            .transmit(frame, &mut response_buf)
            .map_err(|e| Error::TransportError(format!("transmit failed: {e}")))?;

        Ok(response.to_vec())
    }

    fn is_connected(&self) -> bool {
        self.card.status2_owned().is_ok()
    }
}
