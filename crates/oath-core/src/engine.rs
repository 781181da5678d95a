//! The engine facade.
//!
//! [`Engine`] owns the session, the credential store, the operation queue,
//! the key cache and the clock. Hosts talk to it in two directions: transport
//! events in, [`Effect`]s out; user intents in, queue outcomes out.
//!
//! # Example
//!
//! ```
//! use yubikey_oath_core::{Effect, Engine, EngineConfig, MemoryKeyCache, TransportEvent};
//!
//! let mut engine = Engine::new(EngineConfig::default(), MemoryKeyCache::default());
//! let effects = engine.handle(TransportEvent::PresenceDetected);
//!
//! // The first thing the engine does with a token is SELECT the applet.
//! assert!(matches!(&effects[..], [Effect::SendFrame(frame)] if frame[1] == 0xA4));
//! ```

use std::collections::VecDeque;
use std::fmt;

use tracing::{info, instrument, warn};

use crate::auth::{AccessKey, DerivationJob, DerivedKey, Password};
use crate::cache::{KeyCache, MemoryKeyCache};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::credential::{
    Credential, CredentialDraft, CredentialId, Secret, TokenIdentity, Variant,
};
use crate::error::{Error, Result};
use crate::queue::{
    EnqueueOutcome, OperationId, OperationKind, PendingOperation, PendingOperationQueue,
    RenamePhase,
};
use crate::session::{AuthState, Context, Effect, Notification, OathSession, SessionState};
use crate::store::{CoverCriteria, CredentialStore, StoreDiff, StoreSnapshot};
use crate::yubikey::{Transport, TransportEvent};

/// Event-driven OATH engine.
pub struct Engine<C: KeyCache = MemoryKeyCache> {
    config: EngineConfig,
    session: OathSession,
    store: CredentialStore,
    queue: PendingOperationQueue,
    cache: C,
    clock: Box<dyn Clock>,
}

impl<C: KeyCache> fmt::Debug for Engine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("store", &self.store)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<C: KeyCache> Engine<C> {
    /// Creates an engine reading the system clock.
    #[must_use]
    pub fn new(config: EngineConfig, cache: C) -> Self {
        Self::with_clock(config, cache, SystemClock)
    }

    /// Creates an engine reading `clock`.
    #[must_use]
    pub fn with_clock(config: EngineConfig, cache: C, clock: impl Clock + 'static) -> Self {
        Self {
            config,
            session: OathSession::new(),
            store: CredentialStore::new(),
            queue: PendingOperationQueue::new(),
            cache,
            clock: Box::new(clock),
        }
    }

    fn parts(&mut self) -> (&mut OathSession, Context<'_>) {
        (
            &mut self.session,
            Context {
                store: &mut self.store,
                queue: &mut self.queue,
                cache: &mut self.cache,
                config: &self.config,
                clock: self.clock.as_ref(),
            },
        )
    }

    // =========================================================================
    // Transport
    // =========================================================================

    /// Feeds one transport event to the session.
    #[instrument(skip_all)]
    pub fn handle(&mut self, event: TransportEvent) -> Vec<Effect> {
        let (session, mut cx) = self.parts();
        session.handle(event, &mut cx)
    }

    /// Checks the response timeout. Call it periodically while a token is
    /// present.
    pub fn tick(&mut self) -> Vec<Effect> {
        let (session, mut cx) = self.parts();
        session.tick(&mut cx)
    }

    /// Runs one presentment over a blocking transport.
    ///
    /// Returns the notifications produced. The presentment stays open, so a
    /// host that receives [`Notification::PasswordRequired`] can unlock and
    /// continue with [`drive`](Self::drive).
    #[instrument(skip_all)]
    pub fn run_presentment(&mut self, transport: &mut dyn Transport) -> Vec<Notification> {
        let effects = self.handle(TransportEvent::PresenceDetected);
        self.drive(transport, effects)
    }

    /// Sends `effects` through `transport` until the session stops asking.
    ///
    /// A failed exchange is reported to the session as presence loss.
    pub fn drive(&mut self, transport: &mut dyn Transport, effects: Vec<Effect>) -> Vec<Notification> {
        let mut notifications = Vec::new();
        let mut pending = VecDeque::from(effects);
        while let Some(effect) = pending.pop_front() {
            match effect {
                Effect::Notify(notification) => notifications.push(notification),
                Effect::SendFrame(frame) => {
                    let event = match transport.transmit(&frame) {
                        Ok(response) => TransportEvent::FrameReceived(response),
                        Err(error) => {
                            warn!(error = %error, "exchange failed; treating the token as gone");
                            TransportEvent::PresenceLost
                        }
                    };
                    pending.extend(self.handle(event));
                }
            }
        }
        notifications
    }

    /// Reports that the token left and returns the resulting notifications.
    pub fn end_presentment(&mut self) -> Vec<Notification> {
        self.handle(TransportEvent::PresenceLost)
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::Notify(notification) => Some(notification),
                Effect::SendFrame(_) => None,
            })
            .collect()
    }

    // =========================================================================
    // Passwords
    // =========================================================================

    /// Starts unlocking the current or last seen token.
    ///
    /// Run the returned job off the event path and hand its result to
    /// [`key_derived`](Self::key_derived). With `remember`, the key is put in
    /// the cache once the token accepts it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if no token was seen yet, or if the token
    /// already rejected a password during this presentment.
    #[instrument(skip(self, password))]
    pub fn begin_unlock(&mut self, password: Password, remember: bool) -> Result<DerivationJob> {
        self.session.begin_unlock(password, remember, &self.config)
    }

    /// Accepts a finished derivation.
    ///
    /// Results nobody waits for, or whose presentment ended, are dropped.
    ///
    /// # Errors
    ///
    /// The derivation error, or [`Error::InvalidState`] if the token rejected
    /// a password earlier in this presentment.
    #[instrument(skip_all, fields(ticket = ?derived.ticket))]
    pub fn key_derived(&mut self, derived: DerivedKey) -> Result<Vec<Effect>> {
        let (session, mut cx) = self.parts();
        session.key_derived(derived, &mut cx)
    }

    /// Builds a derivation for the password intents, salted for the current
    /// or last seen token.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if no token was seen yet.
    pub fn derivation_job(&mut self, password: Password) -> Result<DerivationJob> {
        self.session.derivation_job(password, &self.config)
    }

    /// Derives a key on the calling thread.
    ///
    /// # Errors
    ///
    /// Same as [`derivation_job`](Self::derivation_job), plus derivation
    /// failures.
    pub fn derive_key(&mut self, password: Password) -> Result<AccessKey> {
        self.derivation_job(password)?.run().key
    }

    // =========================================================================
    // Intents
    // =========================================================================

    fn enqueue(&mut self, kind: OperationKind) -> EnqueueOutcome {
        let token = self.session.last_seen().map(|identity| identity.device_id.clone());
        let name = kind.name();
        let outcome = self.queue.enqueue(kind, token, self.clock.unix_seconds());
        info!(kind = name, ?outcome, "intent recorded");
        outcome
    }

    /// Queues writing a new credential.
    ///
    /// # Errors
    ///
    /// Whatever [`CredentialDraft::validate`] rejects.
    #[instrument(skip_all)]
    pub fn request_add(&mut self, draft: CredentialDraft) -> Result<EnqueueOutcome> {
        draft.validate()?;
        Ok(self.enqueue(OperationKind::Add(draft)))
    }

    /// Queues removing a credential.
    #[instrument(skip(self))]
    pub fn request_delete(&mut self, id: CredentialId) -> EnqueueOutcome {
        self.enqueue(OperationKind::Delete(id))
    }

    /// Queues moving a credential to `new_label`.
    ///
    /// The issuer is kept unless `new_label` carries an `issuer:` prefix. The
    /// secret must be supplied again because tokens never export it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the store does not know `id`
    /// - whatever validating the renamed credential rejects
    #[instrument(skip(self, secret))]
    pub fn request_rename(
        &mut self,
        id: CredentialId,
        new_label: &str,
        secret: Secret,
    ) -> Result<EnqueueOutcome> {
        let current = self
            .store
            .get(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let draft = renamed_draft(current, new_label, secret);
        draft.validate()?;
        Ok(self.enqueue(OperationKind::Rename {
            from: id,
            to: Box::new(draft),
            phase: RenamePhase::Delete,
        }))
    }

    /// Queues computing one code.
    #[instrument(skip(self))]
    pub fn request_calculate(&mut self, id: CredentialId) -> EnqueueOutcome {
        self.enqueue(OperationKind::Calculate(id))
    }

    /// Queues protecting an unprotected token with `new_key`.
    #[instrument(skip_all)]
    pub fn request_set_password(&mut self, new_key: AccessKey) -> EnqueueOutcome {
        self.enqueue(OperationKind::SetPassword { new_key })
    }

    /// Queues replacing the password.
    #[instrument(skip_all)]
    pub fn request_change_password(&mut self, old_key: AccessKey, new_key: AccessKey) -> EnqueueOutcome {
        self.enqueue(OperationKind::ChangePassword { old_key, new_key })
    }

    /// Queues removing the password.
    #[instrument(skip_all)]
    pub fn request_clear_password(&mut self, old_key: AccessKey) -> EnqueueOutcome {
        self.enqueue(OperationKind::ClearPassword { old_key })
    }

    /// Queues wiping the applet.
    #[instrument(skip(self))]
    pub fn request_reset(&mut self) -> EnqueueOutcome {
        self.enqueue(OperationKind::Reset)
    }

    /// Drops a queued operation.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownOperation`] if `id` is not queued
    /// - [`Error::OperationInFlight`] if it is running on a token right now,
    ///   or is a rename whose old name is already deleted
    #[instrument(skip(self))]
    pub fn cancel_pending(&mut self, id: OperationId) -> Result<PendingOperation> {
        let op = self.queue.cancel(id)?;
        info!(op = %id, "operation cancelled");
        Ok(op)
    }

    /// Lets an operation held after an ambiguous failure run again.
    ///
    /// # Errors
    ///
    /// See [`PendingOperationQueue::confirm`].
    #[instrument(skip(self))]
    pub fn confirm_pending(&mut self, id: OperationId) -> Result<()> {
        self.queue.confirm(id)?;
        info!(op = %id, "retry confirmed");
        Ok(())
    }

    // =========================================================================
    // Local metadata
    // =========================================================================

    /// Designates the cover credential.
    pub fn select_cover(&mut self, criteria: &CoverCriteria) -> Option<&Credential> {
        self.store.select(criteria)
    }

    /// Changes how a credential's codes are rendered.
    pub fn set_variant(&mut self, id: &CredentialId, variant: Variant) -> StoreDiff {
        self.store.set_variant(id, variant)
    }

    // =========================================================================
    // Observations
    // =========================================================================

    /// Returns a copy of the credential store.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    /// Returns the queued operations in FIFO order.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.queue.snapshot()
    }

    /// Authentication status of the current presentment.
    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.session.auth_state()
    }

    /// Session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Identity of the token in the field.
    #[must_use]
    pub fn identity(&self) -> Option<&TokenIdentity> {
        self.session.identity()
    }

    /// The session itself, for resume inspection.
    #[must_use]
    pub const fn session(&self) -> &OathSession {
        &self.session
    }

    /// The key cache.
    #[must_use]
    pub const fn cache(&self) -> &C {
        &self.cache
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn renamed_draft(current: &Credential, new_label: &str, secret: Secret) -> CredentialDraft {
    let new_id = CredentialId::new(new_label);
    let (issuer, label) = new_id.parts();
    CredentialDraft {
        issuer: issuer.map(str::to_string).or_else(|| current.issuer.clone()),
        label: label.to_string(),
        mode: current.mode,
        algorithm: current.algorithm,
        digits: current.digits,
        variant: current.variant,
        counter: current.counter.unwrap_or(0),
        requires_touch: current.requires_touch,
        secret,
    }
}
