//! YubiKey OATH wire layer.
//!
//! This module contains everything that touches bytes on the wire:
//!
//! - [`apdu`]: command/response envelopes and command chaining
//! - [`tlv`]: tag-length-value payload helpers
//! - [`oath`]: OATH request builders and response parsers
//!
//! # Transport Abstraction
//!
//! The engine itself is sans-IO: it consumes [`TransportEvent`]s and emits
//! frames to send. Drivers that expose a blocking exchange (PC/SC readers,
//! test doubles) implement [`Transport`] instead and let
//! [`Engine::run_presentment`](crate::Engine::run_presentment) pump the
//! events for them.
//!
//! # Example
//!
//! ```ignore
//! use yubikey_oath_core::{Engine, MemoryKeyCache};
//! use yubikey_oath_core::yubikey::PcscTransport;
//!
//! let mut transport = PcscTransport::connect()?;
//! let mut engine = Engine::new(Default::default(), MemoryKeyCache::default());
//! engine.run_presentment(&mut transport);
//! for credential in engine.snapshot().credentials() {
//!     println!("{}", credential.id);
//! }
//! ```

pub mod apdu;
pub mod oath;
pub mod tlv;

#[cfg(feature = "pcsc")]
pub mod pcsc_transport;

pub use apdu::{Apdu, ApduResponse};

#[cfg(feature = "pcsc")]
pub use pcsc_transport::PcscTransport;

use crate::error::Result;

/// An event reported by the transport driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A token entered the field and can be addressed.
    PresenceDetected,
    /// The token answered the last frame.
    FrameReceived(Vec<u8>),
    /// The token left the field.
    PresenceLost,
}

/// A blocking transport for exchanging frames with a token.
pub trait Transport {
    /// Sends one command frame and receives the response frame.
    ///
    /// # Arguments
    ///
    /// * `frame` - The encoded command APDU
    ///
    /// # Returns
    ///
    /// The raw response, status word included.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame could not be exchanged; the engine
    /// treats this as the token leaving the field.
    fn transmit(&mut self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Checks if a token is still reachable.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A mock transport for testing.
    struct MockTransport {
        responses: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl MockTransport {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                responses: responses.into_iter().collect(),
                sent: Vec::new(),
            }
        }
    }

    impl Transport for MockTransport {
        fn transmit(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
            self.sent.push(frame.to_vec());
            self.responses
                .pop_front()
                .ok_or_else(|| crate::error::Error::TransportError("no response".to_string()))
        }

        fn is_connected(&self) -> bool {
            !self.responses.is_empty()
        }
    }

    #[test]
    fn mock_transport() {
        let mut transport = MockTransport::new(vec![vec![0x90, 0x00]]);

        let frame = oath::select().to_bytes();
        let response = transport.transmit(&frame).unwrap();

        assert!(ApduResponse::parse(&response).unwrap().is_success());
        assert_eq!(transport.sent, vec![frame]);
        assert!(!transport.is_connected());
        assert!(transport.transmit(&[]).is_err());
    }
}
