//! YubiKey OATH Engine Core Library
//!
//! This crate manages one-time-password credentials stored on a YubiKey's
//! OATH applet when the token is only reachable intermittently, as with NFC
//! taps on a phone.
//!
//! # Overview
//!
//! Every tap is a short *presentment*. The engine selects the applet,
//! authenticates if a password is set, runs one queued operation (or a
//! refresh of the credential list and codes), and copes with the token
//! leaving at any point in between.
//!
//! This library provides:
//!
//! - **Wire Layer**: APDU frames, command chaining, 0x61xx continuations and
//!   the OATH TLV commands
//! - **Mutual Authentication**: PBKDF2 access keys and HMAC challenge-response
//! - **Session State Machine**: sans-IO, resumable across presentments
//! - **Credential Store**: host-side mirror with merge diffs
//! - **Operation Queue**: user intents that outlive presentments
//! - **Provisioning**: `otpauth://` and `otpauth-migration://` parsing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │        intents ▼                         ▲ notifications    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                          Engine                             │
//! │  ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌──────────┐  │
//! │  │  Pending  │  │   Oath     │  │Credential│  │ KeyCache │  │
//! │  │  Queue    │──▶  Session   │──▶  Store   │  │  Clock   │  │
//! │  └───────────┘  └────────────┘  └──────────┘  └──────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   YubiKey OATH Layer                        │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────────────┐ │
//! │  │  APDU   │  │   TLV   │  │  OATH   │  │    Transport    │ │
//! │  │ Frames  │  │         │  │ Commands│  │   Abstraction   │ │
//! │  └─────────┘  └─────────┘  └─────────┘  └─────────────────┘ │
//! ├─────────────────────────────────────────────────────────────┤
//! │               Transport Layer (NFC / PC/SC)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ## Driving the Engine
//!
//! ```rust
//! use yubikey_oath_core::{Effect, Engine, EngineConfig, MemoryKeyCache, TransportEvent};
//!
//! let mut engine = Engine::new(EngineConfig::default(), MemoryKeyCache::default());
//!
//! for effect in engine.handle(TransportEvent::PresenceDetected) {
//!     match effect {
//!         Effect::SendFrame(frame) => { /* write to the NFC tag */ }
//!         Effect::Notify(notification) => println!("{notification:?}"),
//!     }
//! }
//! ```
//!
//! ## Queueing a Credential
//!
//! ```rust
//! use yubikey_oath_core::{provisioning, Engine, EngineConfig, MemoryKeyCache};
//!
//! let mut engine = Engine::new(EngineConfig::default(), MemoryKeyCache::default());
//! let draft = provisioning::parse("otpauth://totp/Example:alice?secret=JBSWY3DPEHPK3PXP").unwrap();
//! let outcome = engine.request_add(draft).unwrap();
//!
//! // Runs on the next token that shows up.
//! assert_eq!(engine.pending().len(), 1);
//! assert!(outcome.id().is_some());
//! ```
//!
//! ## Unlocking
//!
//! ```ignore
//! use yubikey_oath_core::{auth::Password, Notification};
//!
//! let notifications = engine.run_presentment(&mut transport);
//! if notifications.iter().any(|n| matches!(n, Notification::PasswordRequired(_))) {
//!     let job = engine.begin_unlock(Password::new("hunter2")?, true)?;
//!     let effects = engine.key_derived(job.run())?;
//!     engine.drive(&mut transport, effects);
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `pcsc`: [`yubikey::PcscTransport`], a blocking transport over PC/SC
//!   readers, and the `oath-cli` example.
//!
//! # Security Considerations
//!
//! - Passwords never reach the token; only PBKDF2-derived keys prove them
//! - The token's proof is checked in constant time before any command runs
//! - Secrets and keys are zeroized on drop and redacted from `Debug`
//! - Destructive commands are never replayed after an ambiguous loss

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod credential;
pub mod engine;
pub mod error;
pub mod provisioning;
pub mod queue;
pub mod session;
pub mod store;
pub mod yubikey;

pub use cache::{KeyCache, MemoryKeyCache, NoKeyCache};
pub use config::EngineConfig;
pub use credential::{Credential, CredentialDraft, CredentialId, DeviceId, TokenIdentity};
pub use engine::Engine;
pub use error::{Error, Result};
pub use queue::{EnqueueOutcome, OperationId, OperationKind, PendingOperation, PendingState};
pub use session::{AuthState, Effect, Notification, ResumePoint, SessionState};
pub use store::{CoverCriteria, StoreDiff, StoreSnapshot};
pub use yubikey::{Transport, TransportEvent};
