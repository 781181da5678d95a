//! Engine configuration.
//!
//! Every field has a default, so a host only spells out what it changes:
//!
//! ```
//! use yubikey_oath_core::EngineConfig;
//!
//! let config = EngineConfig::from_json(r#"{ "response_timeout_ms": 2000 }"#).unwrap();
//! assert_eq!(config.response_timeout_ms, 2000);
//! assert_eq!(config.pbkdf2_iterations, 1000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::IterationPolicy;
use crate::credential::HashAlgorithm;
use crate::error::{Error, Result};

/// Tunables of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// PBKDF2 rounds used to derive access keys.
    pub pbkdf2_iterations: u32,
    /// How long a command may stay unanswered before the session aborts.
    pub response_timeout_ms: u64,
    /// Largest command payload sent in one frame; longer ones are chained.
    pub max_frame_payload: usize,
    /// Whether the default refresh also runs CALCULATE ALL.
    pub calculate_on_refresh: bool,
    /// TOTP time step in seconds.
    pub totp_period: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 1000,
            response_timeout_ms: 5000,
            max_frame_payload: 255,
            calculate_on_refresh: true,
            totp_period: 30,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON configuration, filling missing fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid JSON or out-of-range values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the values can drive a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.pbkdf2_iterations == 0 {
            return Err(Error::Config("pbkdf2_iterations must be positive".to_string()));
        }
        if self.max_frame_payload == 0 {
            return Err(Error::Config("max_frame_payload must be positive".to_string()));
        }
        if self.totp_period == 0 {
            return Err(Error::Config("totp_period must be positive".to_string()));
        }
        Ok(())
    }

    /// Returns the response timeout.
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Returns the derivation policy for a token using `algorithm`.
    #[must_use]
    pub fn iteration_policy(&self, algorithm: HashAlgorithm) -> IterationPolicy {
        IterationPolicy {
            iterations: self.pbkdf2_iterations,
            ..IterationPolicy::default()
        }
        .with_algorithm(algorithm)
    }
}
