//! Presentment state machine.
//!
//! [`OathSession`] turns transport events into frames to send and
//! notifications to surface. It performs no I/O and never blocks: the host
//! feeds it [`TransportEvent`]s, sends the frames it returns, and runs
//! password derivations wherever it likes.
//!
//! # States
//!
//! ```text
//!            presence            locked             9000 + verified
//!   Idle ──────────────▶ Selected ───────▶ Validating ──────────────▶ Validated ─┐
//!    ▲                       │                  │                                  │
//!    │                       │ unlocked         │ 6A80 / mismatch                  ▼
//!    │                       └──────────▶ Unlocked ─────────────────────────▶ Executing
//!    │                                          │                                  │
//!    │  presence lost                           ▼                                  ▼
//!    └──────────────────────────────────── Aborted                            Complete
//!
//!   any mid-sequence state ── presence lost ──▶ Suspended ── presence ──▶ Selected
//! ```
//!
//! One unit of work runs per presentment: the interrupted operation if the
//! same token came back, else the first queued operation for the token, else
//! a refresh of the credential list and codes. ADD and RENAME read the names
//! with LIST first, since the applet overwrites a credential of the same name
//! without complaint.
//!
//! # Interruptions
//!
//! A presence loss mid-command records a [`ResumePoint`]. Commands whose
//! effect cannot be observed afterwards (DELETE, RESET, SET CODE, HOTP
//! CALCULATE) are never replayed once fully transmitted: the operation is
//! parked for confirmation and [`Notification::MaybePartiallyApplied`] is
//! emitted instead. The same happens to a rename whose new name is refused
//! after the old one was deleted.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::auth::{
    self, AccessKey, DerivationJob, DerivationTicket, DerivedKey, HostChallenge, Password,
};
use crate::cache::KeyCache;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::credential::{CredentialId, DeviceId, Mode, TokenIdentity};
use crate::error::{Error, Result};
use crate::queue::{
    OperationId, OperationKind, PendingOperation, PendingOperationQueue, PendingState,
    RenamePhase,
};
use crate::store::{Completeness, CredentialStore, ListResult, StoreDiff};
use crate::yubikey::apdu::{Apdu, ApduResponse, sw};
use crate::yubikey::{TransportEvent, oath};

/// Where the session is within a presentment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// No token.
    #[default]
    Idle,
    /// SELECT sent or answered; authentication not settled yet.
    Selected,
    /// VALIDATE sent.
    Validating,
    /// The password was verified both ways.
    Validated,
    /// The applet has no password.
    Unlocked,
    /// An operation or refresh is running.
    Executing,
    /// This presentment's work is done.
    Complete,
    /// This presentment failed; waiting for the token to leave.
    Aborted,
    /// The token left mid-sequence.
    Suspended,
}

/// Authentication status of the current presentment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthState {
    /// No SELECT answered yet.
    #[default]
    Unknown,
    /// The applet has no password.
    Unlocked,
    /// The applet is protected and no accepted key was presented.
    LockedAwaitingPassword,
    /// Mutual authentication succeeded.
    Validated,
}

/// Output of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Transmit this frame to the token.
    SendFrame(Vec<u8>),
    /// Tell the user interface something.
    Notify(Notification),
}

/// Something observers should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The credential store changed.
    StoreChanged(StoreDiff),
    /// The authentication status changed.
    AuthStateChanged(AuthState),
    /// A queued operation was applied to the token.
    OperationCompleted(OperationId),
    /// A queued operation was rejected and dropped.
    OperationFailed {
        /// The dropped operation.
        id: OperationId,
        /// Why the token or the host refused it.
        error: Error,
    },
    /// The token left after receiving a destructive command; it may or may
    /// not have been applied. Also sent when the second half of a rename is
    /// refused after the old name was deleted. The operation waits for
    /// confirmation.
    MaybePartiallyApplied(OperationId),
    /// The token is locked and no key is known for it.
    PasswordRequired(DeviceId),
    /// A different token appeared while an interrupted sequence waited.
    SessionIdentityMismatch {
        /// Token the interrupted sequence belongs to.
        expected: DeviceId,
        /// Token that appeared instead.
        found: DeviceId,
    },
    /// The presentment failed.
    Aborted(Error),
}

/// Where an interrupted sequence stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    /// Token the sequence ran on.
    pub device_id: DeviceId,
    /// Operation that was running, `None` for a refresh.
    pub op: Option<OperationId>,
    /// Instruction byte of the interrupted command.
    pub command: u8,
    /// Command payload bytes transmitted before the loss.
    pub payload_offset: usize,
    /// Command payload length.
    pub total: usize,
}

/// Everything the session reads or mutates besides its own state.
pub(crate) struct Context<'a> {
    pub(crate) store: &'a mut CredentialStore,
    pub(crate) queue: &'a mut PendingOperationQueue,
    pub(crate) cache: &'a mut dyn KeyCache,
    pub(crate) config: &'a EngineConfig,
    pub(crate) clock: &'a dyn Clock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Select,
    Reselect,
    Validate,
    List,
    CalculateAll,
    Put,
    Delete,
    Calculate,
    Reset,
    SetCode,
}

/// A command between its first frame and its final status word.
#[derive(Debug)]
struct InFlight {
    purpose: Purpose,
    ins: u8,
    frames: Vec<Vec<u8>>,
    /// Frames handed to the transport so far.
    sent: usize,
    chunk: usize,
    total: usize,
    /// Response data gathered across 61xx continuations.
    response: Vec<u8>,
    non_idempotent: bool,
    sent_at: Instant,
}

impl InFlight {
    fn fully_transmitted(&self) -> bool {
        self.sent >= self.frames.len()
    }

    fn payload_offset(&self) -> usize {
        (self.sent * self.chunk).min(self.total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    Operation(OperationId),
    Cache,
    Entered { remember: bool },
}

#[derive(Debug)]
struct Validation {
    key: AccessKey,
    host_challenge: HostChallenge,
    source: KeySource,
}

#[derive(Debug)]
enum Task {
    Refresh,
    Operation(PendingOperation),
}

#[derive(Debug)]
struct PendingUnlock {
    ticket: DerivationTicket,
    device: DeviceId,
    /// Presentment the password was entered in; `None` if the token was away.
    presentment: Option<u64>,
    remember: bool,
}

#[derive(Debug, Clone)]
struct EnteredKey {
    key: AccessKey,
    remember: bool,
}

/// The presentment state machine.
#[derive(Debug, Default)]
pub struct OathSession {
    state: SessionState,
    auth: AuthState,
    present: bool,
    presentment: u64,
    identity: Option<TokenIdentity>,
    last_seen: Option<TokenIdentity>,
    token_challenge: Option<Vec<u8>>,
    select_retried: bool,
    unlock_refused: bool,
    /// The token's names were read in full during this presentment.
    listed: bool,
    in_flight: Option<InFlight>,
    validation: Option<Validation>,
    task: Option<Task>,
    resume: Option<ResumePoint>,
    pending_unlock: Option<PendingUnlock>,
    next_ticket: u64,
    /// Keys typed in this process, per token.
    entered: HashMap<DeviceId, EnteredKey>,
    /// Id of a token reset whose new id is not known yet.
    reset_from: Option<DeviceId>,
}

impl OathSession {
    /// Creates an idle session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Authentication status of the current presentment.
    #[must_use]
    pub const fn auth_state(&self) -> AuthState {
        self.auth
    }

    /// Identity of the token in the field.
    #[must_use]
    pub const fn identity(&self) -> Option<&TokenIdentity> {
        self.identity.as_ref()
    }

    /// Identity of the most recent token, present or not.
    #[must_use]
    pub const fn last_seen(&self) -> Option<&TokenIdentity> {
        self.last_seen.as_ref()
    }

    /// Where the last interrupted sequence stopped.
    #[must_use]
    pub const fn resume_point(&self) -> Option<&ResumePoint> {
        self.resume.as_ref()
    }

    /// Returns `true` while a token is in the field.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.present
    }

    pub(crate) fn handle(&mut self, event: TransportEvent, cx: &mut Context<'_>) -> Vec<Effect> {
        let mut out = Vec::new();
        match event {
            TransportEvent::PresenceDetected => self.on_presence(cx, &mut out),
            TransportEvent::FrameReceived(frame) => self.on_frame(&frame, cx, &mut out),
            TransportEvent::PresenceLost => self.on_presence_lost(cx, &mut out),
        }
        out
    }

    /// Aborts the command in flight if it outlived the response timeout.
    pub(crate) fn tick(&mut self, cx: &mut Context<'_>) -> Vec<Effect> {
        let mut out = Vec::new();
        let expired = self.in_flight.as_ref().is_some_and(|flight| {
            cx.clock.now().duration_since(flight.sent_at) >= cx.config.response_timeout()
        });
        if expired {
            self.abort(Error::Timeout, cx, &mut out);
        }
        out
    }

    // =========================================================================
    // Passwords
    // =========================================================================

    pub(crate) fn begin_unlock(
        &mut self,
        password: Password,
        remember: bool,
        config: &EngineConfig,
    ) -> Result<DerivationJob> {
        if self.present && self.unlock_refused {
            return Err(Error::InvalidState(
                "password was rejected during this presentment",
            ));
        }
        let target = self
            .identity
            .as_ref()
            .or(self.last_seen.as_ref())
            .ok_or(Error::InvalidState("no token has been seen"))?;
        let device = target.device_id.clone();
        let policy = config.iteration_policy(target.auth_algorithm);
        let presentment = self.identity.is_some().then_some(self.presentment);

        let ticket = self.issue_ticket();
        self.pending_unlock = Some(PendingUnlock {
            ticket,
            device: device.clone(),
            presentment,
            remember,
        });
        Ok(DerivationJob::new(
            ticket,
            password,
            device.as_bytes().to_vec(),
            policy,
        ))
    }

    /// Derivation for a new password, salted for the current or last token.
    pub(crate) fn derivation_job(
        &mut self,
        password: Password,
        config: &EngineConfig,
    ) -> Result<DerivationJob> {
        let target = self
            .identity
            .as_ref()
            .or(self.last_seen.as_ref())
            .ok_or(Error::InvalidState("no token has been seen"))?;
        let salt = target.device_id.as_bytes().to_vec();
        let policy = config.iteration_policy(target.auth_algorithm);
        Ok(DerivationJob::new(self.issue_ticket(), password, salt, policy))
    }

    pub(crate) fn key_derived(
        &mut self,
        derived: DerivedKey,
        cx: &mut Context<'_>,
    ) -> Result<Vec<Effect>> {
        let mut out = Vec::new();
        let Some(pending) = self
            .pending_unlock
            .take_if(|pending| pending.ticket == derived.ticket)
        else {
            debug!(ticket = ?derived.ticket, "discarding derivation nobody waits for");
            return Ok(out);
        };
        let key = derived.key?;

        match pending.presentment {
            None => {
                debug!(device = %pending.device, "keeping password entered while the token was away");
                self.entered.insert(
                    pending.device,
                    EnteredKey {
                        key,
                        remember: pending.remember,
                    },
                );
            }
            Some(presentment) if presentment != self.presentment || !self.present => {
                debug!(ticket = ?derived.ticket, "discarding derivation from an ended presentment");
            }
            Some(_) => {
                if self.unlock_refused {
                    return Err(Error::InvalidState(
                        "password was rejected during this presentment",
                    ));
                }
                let waiting = self.state == SessionState::Selected
                    && self.auth == AuthState::LockedAwaitingPassword
                    && self.in_flight.is_none();
                if waiting {
                    let source = KeySource::Entered {
                        remember: pending.remember,
                    };
                    self.validate_with(key, source, cx, &mut out);
                } else {
                    self.entered.insert(
                        pending.device,
                        EnteredKey {
                            key,
                            remember: pending.remember,
                        },
                    );
                }
            }
        }
        Ok(out)
    }

    fn issue_ticket(&mut self) -> DerivationTicket {
        self.next_ticket += 1;
        DerivationTicket(self.next_ticket)
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    fn on_presence(&mut self, cx: &mut Context<'_>, out: &mut Vec<Effect>) {
        if self.present {
            debug!("presence reported twice; restarting the presentment");
            self.on_presence_lost(cx, out);
        }
        self.present = true;
        self.presentment += 1;
        self.select_retried = false;
        self.unlock_refused = false;
        self.listed = false;
        self.set_state(SessionState::Selected);
        self.send(oath::select(), Purpose::Select, false, cx, out);
    }

    fn on_presence_lost(&mut self, cx: &mut Context<'_>, out: &mut Vec<Effect>) {
        if !self.present {
            return;
        }
        self.present = false;

        match self.state {
            SessionState::Idle | SessionState::Suspended => {}
            SessionState::Complete | SessionState::Aborted => self.set_state(SessionState::Idle),
            _ => {
                if let Some(point) = self.interrupt(cx, out) {
                    info!(
                        device = %point.device_id,
                        command = point.command,
                        offset = point.payload_offset,
                        total = point.total,
                        "token lost mid-command; recorded resume point"
                    );
                    self.resume = Some(point);
                }
                self.set_state(SessionState::Suspended);
            }
        }

        self.identity = None;
        self.token_challenge = None;
        self.in_flight = None;
        self.validation = None;
        self.task = None;
        self.set_auth(AuthState::Unknown, out);
    }

    fn on_frame(&mut self, frame: &[u8], cx: &mut Context<'_>, out: &mut Vec<Effect>) {
        let Some(flight) = self.in_flight.as_mut() else {
            debug!(frame = %hex::encode(frame), "ignoring unsolicited frame");
            return;
        };
        debug!(frame = %hex::encode(frame), "received");

        let response = match ApduResponse::parse(frame) {
            Ok(response) => response,
            Err(error) => return self.abort(error, cx, out),
        };

        if !flight.fully_transmitted() && response.is_success() {
            let next = flight.frames[flight.sent].clone();
            flight.sent += 1;
            flight.sent_at = cx.clock.now();
            emit_frame(next, out);
            return;
        }
        if flight.fully_transmitted() && response.has_more_data() {
            flight.response.extend_from_slice(response.data());
            flight.sent_at = cx.clock.now();
            emit_frame(oath::send_remaining().to_bytes(), out);
            return;
        }

        let Some(flight) = self.in_flight.take() else {
            return;
        };
        let mut data = flight.response;
        data.extend_from_slice(response.data());
        let status = response.status_word();
        let result = status_result(&response, flight.purpose);
        self.on_response(flight.purpose, status, result, &data, cx, out);
    }

    fn on_response(
        &mut self,
        purpose: Purpose,
        status: u16,
        result: Result<()>,
        data: &[u8],
        cx: &mut Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        match purpose {
            Purpose::Select => self.on_select(status, result, data, cx, out),
            Purpose::Reselect => self.on_reselect(result, data, cx, out),
            Purpose::Validate => self.on_validate(result, data, cx, out),
            Purpose::List => self.on_list(result, data, cx, out),
            Purpose::CalculateAll => self.on_calculate_all(result, data, cx, out),
            Purpose::Put
            | Purpose::Delete
            | Purpose::Calculate
            | Purpose::Reset
            | Purpose::SetCode => self.on_operation_reply(purpose, result, data, cx, out),
        }
    }

    // =========================================================================
    // SELECT and authentication
    // =========================================================================

    fn on_select(
        &mut self,
        status: u16,
        result: Result<()>,
        data: &[u8],
        cx: &mut Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        if status == sw::NOT_READY && !self.select_retried {
            debug!("applet not ready; retrying SELECT");
            self.select_retried = true;
            self.send(oath::select(), Purpose::Select, false, cx, out);
            return;
        }
        let select = match result.and_then(|()| oath::parse_select(data)) {
            Ok(select) => select,
            Err(error) => return self.abort(error, cx, out),
        };
        let identity = TokenIdentity {
            device_id: select.device_id.clone(),
            version: select.version,
            locked: select.is_locked(),
            auth_algorithm: select.algorithm,
        };
        info!(
            device = %identity.device_id,
            version = %identity.version,
            locked = identity.locked,
            "token selected"
        );

        if let Some(old) = self.reset_from.take()
            && old != identity.device_id
        {
            cx.queue.retarget(&old, &identity.device_id);
        }

        if let Some(point) = &self.resume
            && point.device_id != identity.device_id
        {
            warn!(
                expected = %point.device_id,
                found = %identity.device_id,
                "different token; discarding suspended sequence"
            );
            out.push(Effect::Notify(Notification::SessionIdentityMismatch {
                expected: point.device_id.clone(),
                found: identity.device_id.clone(),
            }));
            self.resume = None;
        }

        notify_diff(cx.store.bind(&identity.device_id), out);
        self.token_challenge = select.challenge;
        self.last_seen = Some(identity.clone());
        let locked = identity.locked;
        self.identity = Some(identity);

        if locked {
            self.set_auth(AuthState::LockedAwaitingPassword, out);
            self.try_validate(cx, out);
        } else {
            self.set_auth(AuthState::Unlocked, out);
            self.set_state(SessionState::Unlocked);
            self.execute(cx, out);
        }
    }

    /// Validates with the best known key or asks for a password.
    fn try_validate(&mut self, cx: &mut Context<'_>, out: &mut Vec<Effect>) {
        let Some(device) = self.identity.as_ref().map(|i| i.device_id.clone()) else {
            return;
        };

        let candidate = self
            .next_operation(cx.queue, &device)
            .and_then(|op| {
                op.kind
                    .unlock_key()
                    .map(|key| (key.clone(), KeySource::Operation(op.id)))
            })
            .or_else(|| cx.cache.load(&device).map(|key| (key, KeySource::Cache)))
            .or_else(|| {
                self.entered.get(&device).map(|entered| {
                    (
                        entered.key.clone(),
                        KeySource::Entered {
                            remember: entered.remember,
                        },
                    )
                })
            });

        match candidate {
            Some((key, source)) => self.validate_with(key, source, cx, out),
            None => {
                info!(device = %device, "password required");
                out.push(Effect::Notify(Notification::PasswordRequired(device)));
            }
        }
    }

    fn validate_with(
        &mut self,
        key: AccessKey,
        source: KeySource,
        cx: &mut Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        let Some(challenge) = self.token_challenge.clone() else {
            return self.abort(
                Error::InvalidState("locked token sent no challenge"),
                cx,
                out,
            );
        };
        let host_challenge = HostChallenge::random();
        match oath::validate(&key, &challenge, &host_challenge) {
            Ok(apdu) => {
                self.validation = Some(Validation {
                    key,
                    host_challenge,
                    source,
                });
                self.set_state(SessionState::Validating);
                self.send(apdu, Purpose::Validate, false, cx, out);
            }
            Err(error) => self.abort(error, cx, out),
        }
    }

    fn on_validate(
        &mut self,
        result: Result<()>,
        data: &[u8],
        cx: &mut Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        let (Some(validation), Some(device)) = (
            self.validation.take(),
            self.identity.as_ref().map(|i| i.device_id.clone()),
        ) else {
            return self.abort(Error::InvalidState("VALIDATE reply without a validation"), cx, out);
        };

        let verified = result
            .and_then(|()| oath::parse_validate(data))
            .and_then(|response| {
                auth::verify(
                    validation.host_challenge.as_bytes(),
                    &validation.key,
                    &response,
                )
            });

        match verified {
            Ok(()) => {
                if let KeySource::Entered { remember } = validation.source {
                    if remember {
                        cx.cache.store(&device, validation.key.clone());
                    }
                    self.entered.insert(
                        device.clone(),
                        EnteredKey {
                            key: validation.key,
                            remember,
                        },
                    );
                }
                info!(device = %device, "password verified");
                self.set_auth(AuthState::Validated, out);
                self.set_state(SessionState::Validated);
                self.execute(cx, out);
            }
            Err(Error::WrongPassword) => {
                self.unlock_refused = true;
                match validation.source {
                    KeySource::Cache => cx.cache.remove(&device),
                    KeySource::Entered { .. } => {
                        self.entered.remove(&device);
                    }
                    KeySource::Operation(id) => {
                        if cx.queue.complete(id).is_some() {
                            out.push(Effect::Notify(Notification::OperationFailed {
                                id,
                                error: Error::WrongPassword,
                            }));
                        }
                    }
                }
                self.abort(Error::WrongPassword, cx, out);
            }
            Err(error) => self.abort(error, cx, out),
        }
    }

    /// The operation this presentment will run, if any.
    fn next_operation<'q>(
        &self,
        queue: &'q PendingOperationQueue,
        device: &DeviceId,
    ) -> Option<&'q PendingOperation> {
        self.resume
            .as_ref()
            .and_then(|point| point.op)
            .and_then(|id| queue.get(id))
            .filter(|op| {
                op.state == PendingState::Ready && op.token.as_ref().is_none_or(|t| t == device)
            })
            .or_else(|| queue.peek_matching(device))
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(&mut self, cx: &mut Context<'_>, out: &mut Vec<Effect>) {
        let Some(device) = self.identity.as_ref().map(|i| i.device_id.clone()) else {
            return;
        };
        self.set_state(SessionState::Executing);

        // A PUT cut short on this token already passed the name check.
        let resumed = self
            .resume
            .take()
            .and_then(|point| point.op.map(|id| (id, point.command == oath::ins::PUT)))
            .and_then(|(id, put)| cx.queue.activate(id, &device).map(|op| (op, put)));
        let next = resumed.or_else(|| cx.queue.dequeue_matching(&device).map(|op| (op, false)));

        match next {
            Some((op, resuming_put)) => self.run_operation(op, resuming_put, &device, cx, out),
            None => {
                debug!("nothing queued; refreshing");
                self.task = Some(Task::Refresh);
                self.send(oath::list(), Purpose::List, false, cx, out);
            }
        }
    }

    fn run_operation(
        &mut self,
        op: PendingOperation,
        resuming_put: bool,
        device: &DeviceId,
        cx: &mut Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        // The applet overwrites on a name clash, so names are checked against
        // a LIST read in this presentment.
        let checks_names = match &op.kind {
            OperationKind::Add(_) => !resuming_put,
            OperationKind::Rename {
                phase: RenamePhase::Delete,
                ..
            } => true,
            _ => false,
        };
        if checks_names && !self.listed {
            debug!(op = %op.id, "reading names before writing");
            self.task = Some(Task::Operation(op));
            self.send(oath::list(), Purpose::List, false, cx, out);
            return;
        }

        info!(op = %op.id, kind = op.kind.name(), resuming_put, "running operation");

        let command = match &op.kind {
            OperationKind::Add(draft) => {
                let id = draft.id();
                if !resuming_put && cx.store.contains_on(device, &id) {
                    Err(Error::DuplicateName(id.to_string()))
                } else {
                    oath::put(draft, &id).map(|apdu| (apdu, Purpose::Put, false))
                }
            }
            OperationKind::Delete(id) => Ok((oath::delete(id), Purpose::Delete, true)),
            OperationKind::Rename {
                from,
                to,
                phase: RenamePhase::Delete,
            } => {
                let new_id = to.id();
                if new_id != *from && cx.store.contains_on(device, &new_id) {
                    Err(Error::DuplicateName(new_id.to_string()))
                } else {
                    Ok((oath::delete(from), Purpose::Delete, true))
                }
            }
            OperationKind::Rename {
                from,
                to,
                phase: RenamePhase::Put,
            } => {
                let new_id = to.id();
                notify_diff(cx.store.mark_in_transition(from, &new_id), out);
                oath::put(to, &new_id).map(|apdu| (apdu, Purpose::Put, false))
            }
            OperationKind::Calculate(id) => {
                let mode = cx.store.get(id).map(|c| c.mode);
                let challenge = match mode {
                    Some(Mode::Counter) => Vec::new(),
                    _ => oath::totp_challenge(cx.clock.unix_seconds(), cx.config.totp_period)
                        .to_vec(),
                };
                let counting = mode != Some(Mode::Time);
                Ok((oath::calculate(id, &challenge), Purpose::Calculate, counting))
            }
            OperationKind::Reset => Ok((oath::reset(), Purpose::Reset, true)),
            OperationKind::SetPassword { new_key }
            | OperationKind::ChangePassword { new_key, .. } => {
                oath::set_code(new_key, &HostChallenge::random())
                    .map(|apdu| (apdu, Purpose::SetCode, true))
            }
            OperationKind::ClearPassword { .. } => {
                Ok((oath::clear_code(), Purpose::SetCode, true))
            }
        };

        self.task = Some(Task::Operation(op));
        match command {
            Ok((apdu, purpose, non_idempotent)) => {
                self.send(apdu, purpose, non_idempotent, cx, out);
            }
            Err(error) => self.operation_error(error, cx, out),
        }
    }

    fn on_operation_reply(
        &mut self,
        purpose: Purpose,
        result: Result<()>,
        data: &[u8],
        cx: &mut Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        let op = match self.task.as_ref() {
            Some(Task::Operation(op)) => op.clone(),
            _ => return self.abort(Error::InvalidState("reply without an operation"), cx, out),
        };
        let Some(device) = self.identity.as_ref().map(|i| i.device_id.clone()) else {
            return self.abort(Error::InvalidState("reply without a token"), cx, out);
        };

        match (&op.kind, purpose) {
            (OperationKind::Add(draft), Purpose::Put) => match result {
                Ok(()) => {
                    notify_diff(cx.store.insert_from_draft(draft), out);
                    self.finish_operation(op.id, cx, out);
                }
                Err(error) => self.operation_error(error, cx, out),
            },

            (OperationKind::Delete(id), Purpose::Delete) => match result {
                Ok(()) | Err(Error::NotFound(_)) => {
                    notify_diff(cx.store.remove(id), out);
                    self.finish_operation(op.id, cx, out);
                }
                Err(error) => self.operation_error(named(error, id), cx, out),
            },

            (OperationKind::Rename { from, to, .. }, Purpose::Delete) => match result {
                Ok(()) | Err(Error::NotFound(_)) => {
                    cx.queue.advance_rename(op.id);
                    if let Some(Task::Operation(PendingOperation {
                        kind: OperationKind::Rename { phase, .. },
                        ..
                    })) = self.task.as_mut()
                    {
                        *phase = RenamePhase::Put;
                    }
                    let new_id = to.id();
                    info!(from = %from, to = %new_id, "old name removed; writing new name");
                    notify_diff(cx.store.mark_in_transition(from, &new_id), out);
                    match oath::put(to, &new_id) {
                        Ok(apdu) => self.send(apdu, Purpose::Put, false, cx, out),
                        Err(error) => self.operation_error(error, cx, out),
                    }
                }
                Err(error) => self.operation_error(named(error, from), cx, out),
            },

            (OperationKind::Rename { from, to, .. }, Purpose::Put) => match result {
                Ok(()) => {
                    notify_diff(cx.store.rename(from, to.to_credential()), out);
                    self.finish_operation(op.id, cx, out);
                }
                Err(error) if error.is_command_local() => {
                    // The old name is gone and the secret only lives in the
                    // queue now; keep it there until the user retries.
                    warn!(
                        op = %op.id,
                        from = %from,
                        error = %error,
                        "new name refused after the old one was deleted; holding rename"
                    );
                    cx.queue.hold(op.id);
                    out.push(Effect::Notify(Notification::MaybePartiallyApplied(op.id)));
                    self.complete();
                }
                Err(error) => self.abort(error, cx, out),
            },

            (OperationKind::Calculate(id), Purpose::Calculate) => {
                match result.and_then(|()| oath::parse_calculate(data)) {
                    Ok(code) => {
                        notify_diff(cx.store.record_calculation(id, code), out);
                        self.finish_operation(op.id, cx, out);
                    }
                    Err(error) => self.operation_error(named(error, id), cx, out),
                }
            }

            (OperationKind::Reset, Purpose::Reset) => match result {
                Ok(()) => {
                    info!(device = %device, "applet reset");
                    notify_diff(cx.store.clear(), out);
                    cx.cache.remove(&device);
                    self.entered.remove(&device);
                    cx.queue.complete(op.id);
                    out.push(Effect::Notify(Notification::OperationCompleted(op.id)));
                    self.task = None;
                    self.reset_from = Some(device);
                    self.send(oath::select(), Purpose::Reselect, false, cx, out);
                }
                Err(error) => self.operation_error(error, cx, out),
            },

            (
                OperationKind::SetPassword { new_key }
                | OperationKind::ChangePassword { new_key, .. },
                Purpose::SetCode,
            ) => match result {
                Ok(()) => {
                    let remembered = cx.cache.load(&device).is_some();
                    if remembered {
                        cx.cache.store(&device, new_key.clone());
                    }
                    self.entered.insert(
                        device,
                        EnteredKey {
                            key: new_key.clone(),
                            remember: remembered,
                        },
                    );
                    self.finish_operation(op.id, cx, out);
                }
                Err(error) => self.operation_error(error, cx, out),
            },

            (OperationKind::ClearPassword { .. }, Purpose::SetCode) => match result {
                Ok(()) => {
                    cx.cache.remove(&device);
                    self.entered.remove(&device);
                    self.finish_operation(op.id, cx, out);
                }
                Err(error) => self.operation_error(error, cx, out),
            },

            _ => self.abort(
                Error::InvalidState("reply does not match the running operation"),
                cx,
                out,
            ),
        }
    }

    fn on_reselect(
        &mut self,
        result: Result<()>,
        data: &[u8],
        cx: &mut Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        let select = match result.and_then(|()| oath::parse_select(data)) {
            Ok(select) => select,
            Err(error) => return self.abort(error, cx, out),
        };
        let identity = TokenIdentity {
            device_id: select.device_id,
            version: select.version,
            locked: select.challenge.is_some(),
            auth_algorithm: select.algorithm,
        };
        if let Some(old) = self.reset_from.take() {
            info!(old = %old, new = %identity.device_id, "token has a new id after reset");
            cx.queue.retarget(&old, &identity.device_id);
        }
        cx.store.rebind_after_reset(&identity.device_id);
        self.token_challenge = select.challenge;
        self.last_seen = Some(identity.clone());
        self.identity = Some(identity);
        self.set_auth(AuthState::Unlocked, out);
        self.complete();
    }

    fn on_list(
        &mut self,
        result: Result<()>,
        data: &[u8],
        cx: &mut Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        let entries = match result.and_then(|()| oath::parse_list(data)) {
            Ok(entries) => entries,
            Err(error) => return self.abort(error, cx, out),
        };
        notify_diff(
            cx.store.merge(ListResult {
                entries,
                completeness: Completeness::Full,
            }),
            out,
        );
        self.listed = true;

        match self.task.take() {
            Some(Task::Operation(op)) => {
                let Some(device) = self.identity.as_ref().map(|i| i.device_id.clone()) else {
                    self.task = Some(Task::Operation(op));
                    return self.abort(Error::InvalidState("LIST reply without a token"), cx, out);
                };
                return self.run_operation(op, false, &device, cx, out);
            }
            task => self.task = task,
        }

        let has_totp = cx.store.credentials().iter().any(|c| c.mode == Mode::Time);
        if cx.config.calculate_on_refresh && has_totp {
            let challenge = oath::totp_challenge(cx.clock.unix_seconds(), cx.config.totp_period);
            self.send(oath::calculate_all(&challenge), Purpose::CalculateAll, false, cx, out);
        } else {
            self.complete();
        }
    }

    fn on_calculate_all(
        &mut self,
        result: Result<()>,
        data: &[u8],
        cx: &mut Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        match result.and_then(|()| oath::parse_calculate_all(data)) {
            Ok(codes) => {
                notify_diff(cx.store.apply_codes(&codes), out);
                self.complete();
            }
            Err(error) => self.abort(error, cx, out),
        }
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    fn finish_operation(&mut self, id: OperationId, cx: &mut Context<'_>, out: &mut Vec<Effect>) {
        info!(op = %id, "operation completed");
        cx.queue.complete(id);
        out.push(Effect::Notify(Notification::OperationCompleted(id)));
        self.complete();
    }

    /// Drops the operation for command-local errors, aborts otherwise.
    fn operation_error(&mut self, error: Error, cx: &mut Context<'_>, out: &mut Vec<Effect>) {
        if !error.is_command_local() {
            return self.abort(error, cx, out);
        }
        if let Some(Task::Operation(op)) = self.task.take() {
            warn!(op = %op.id, error = %error, "operation rejected");
            cx.queue.complete(op.id);
            out.push(Effect::Notify(Notification::OperationFailed {
                id: op.id,
                error,
            }));
        }
        self.complete();
    }

    fn complete(&mut self) {
        self.task = None;
        self.set_state(SessionState::Complete);
    }

    fn abort(&mut self, error: Error, cx: &mut Context<'_>, out: &mut Vec<Effect>) {
        warn!(error = %error, state = ?self.state, "presentment aborted");
        self.interrupt(cx, out);
        self.set_state(SessionState::Aborted);
        out.push(Effect::Notify(Notification::Aborted(error)));
    }

    /// Settles whatever was running when the exchange stopped early.
    ///
    /// Returns the resume point for a sequence that can be picked up again.
    fn interrupt(&mut self, cx: &mut Context<'_>, out: &mut Vec<Effect>) -> Option<ResumePoint> {
        self.validation = None;
        let task = self.task.take();
        let Some(flight) = self.in_flight.take() else {
            if let Some(Task::Operation(op)) = task {
                cx.queue.release(op.id);
            }
            return None;
        };

        if flight.purpose == Purpose::List {
            let entries = oath::parse_list_prefix(&flight.response);
            notify_diff(
                cx.store.merge(ListResult {
                    entries,
                    completeness: Completeness::Partial,
                }),
                out,
            );
        }

        let op = match task {
            Some(Task::Operation(op)) => {
                if flight.non_idempotent && flight.fully_transmitted() {
                    warn!(op = %op.id, command = flight.ins, "command may have been applied; holding");
                    cx.queue.hold(op.id);
                    out.push(Effect::Notify(Notification::MaybePartiallyApplied(op.id)));
                    return None;
                }
                cx.queue.release(op.id);
                Some(op.id)
            }
            Some(Task::Refresh) | None => None,
        };

        if matches!(
            flight.purpose,
            Purpose::Select | Purpose::Reselect | Purpose::Validate
        ) {
            return None;
        }
        let device_id = self.identity.as_ref()?.device_id.clone();
        Some(ResumePoint {
            device_id,
            op,
            command: flight.ins,
            payload_offset: flight.payload_offset(),
            total: flight.total,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn send(
        &mut self,
        apdu: Apdu,
        purpose: Purpose,
        non_idempotent: bool,
        cx: &Context<'_>,
        out: &mut Vec<Effect>,
    ) {
        let chunk = if cx.config.max_frame_payload == 0 {
            Apdu::MAX_SHORT_DATA
        } else {
            cx.config.max_frame_payload
        };
        let frames = apdu.to_chained_frames(chunk);
        let Some(first) = frames.first().cloned() else {
            return;
        };
        self.in_flight = Some(InFlight {
            purpose,
            ins: apdu.ins(),
            frames,
            sent: 1,
            chunk,
            total: apdu.data().len(),
            response: Vec::new(),
            non_idempotent,
            sent_at: cx.clock.now(),
        });
        emit_frame(first, out);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "session state");
            self.state = state;
        }
    }

    fn set_auth(&mut self, auth: AuthState, out: &mut Vec<Effect>) {
        if self.auth != auth {
            self.auth = auth;
            out.push(Effect::Notify(Notification::AuthStateChanged(auth)));
        }
    }
}

fn emit_frame(frame: Vec<u8>, out: &mut Vec<Effect>) {
    debug!(frame = %hex::encode(&frame), "sending");
    out.push(Effect::SendFrame(frame));
}

fn notify_diff(diff: StoreDiff, out: &mut Vec<Effect>) {
    if !diff.is_empty() {
        out.push(Effect::Notify(Notification::StoreChanged(diff)));
    }
}

/// Maps the final status word; 6A80 only means a wrong password on VALIDATE.
fn status_result(response: &ApduResponse, purpose: Purpose) -> Result<()> {
    match response.check() {
        Err(Error::WrongPassword) if purpose != Purpose::Validate => {
            Err(Error::UnexpectedStatusWord(response.status_word()))
        }
        other => other,
    }
}

fn named(error: Error, id: &CredentialId) -> Error {
    match error {
        Error::NotFound(_) => Error::NotFound(id.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::MemoryKeyCache;
    use crate::clock::ManualClock;

    const SELECT_UNLOCKED: &[u8] = &[
        0x79, 0x03, 0x05, 0x04, 0x03, 0x71, 0x04, 0x0A, 0x0B, 0x0C, 0x0D, 0x90, 0x00,
    ];

    struct Fixture {
        session: OathSession,
        store: CredentialStore,
        queue: PendingOperationQueue,
        cache: MemoryKeyCache,
        config: EngineConfig,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                session: OathSession::new(),
                store: CredentialStore::new(),
                queue: PendingOperationQueue::new(),
                cache: MemoryKeyCache::default(),
                config: EngineConfig {
                    calculate_on_refresh: false,
                    ..EngineConfig::default()
                },
                clock: ManualClock::new(1_000),
            }
        }

        fn handle(&mut self, event: TransportEvent) -> Vec<Effect> {
            let mut cx = Context {
                store: &mut self.store,
                queue: &mut self.queue,
                cache: &mut self.cache,
                config: &self.config,
                clock: &self.clock,
            };
            self.session.handle(event, &mut cx)
        }

        fn tick(&mut self) -> Vec<Effect> {
            let mut cx = Context {
                store: &mut self.store,
                queue: &mut self.queue,
                cache: &mut self.cache,
                config: &self.config,
                clock: &self.clock,
            };
            self.session.tick(&mut cx)
        }

        fn frame(&mut self, bytes: &[u8]) -> Vec<Effect> {
            self.handle(TransportEvent::FrameReceived(bytes.to_vec()))
        }
    }

    fn sent(effects: &[Effect]) -> Vec<&[u8]> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::SendFrame(frame) => Some(frame.as_slice()),
                Effect::Notify(_) => None,
            })
            .collect()
    }

    fn notified(effects: &[Effect]) -> Vec<&Notification> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(n) => Some(n),
                Effect::SendFrame(_) => None,
            })
            .collect()
    }

    #[test]
    fn select_retried_once_when_not_ready() {
        let mut fx = Fixture::new();
        let effects = fx.handle(TransportEvent::PresenceDetected);
        assert_eq!(sent(&effects), vec![oath::select().to_bytes().as_slice()]);

        let effects = fx.frame(&[0x68, 0x83]);
        assert_eq!(sent(&effects).len(), 1);

        let effects = fx.frame(&[0x68, 0x83]);
        assert_eq!(fx.session.state(), SessionState::Aborted);
        assert!(notified(&effects)
            .contains(&&Notification::Aborted(Error::UnexpectedStatusWord(0x6883))));
    }

    #[test]
    fn unlocked_token_refreshes() {
        let mut fx = Fixture::new();
        fx.handle(TransportEvent::PresenceDetected);
        let effects = fx.frame(SELECT_UNLOCKED);

        assert_eq!(fx.session.auth_state(), AuthState::Unlocked);
        assert_eq!(fx.session.state(), SessionState::Executing);
        assert_eq!(sent(&effects), vec![oath::list().to_bytes().as_slice()]);

        let effects = fx.frame(&[0x72, 0x05, 0x21, b'm', b'a', b'i', b'l', 0x90, 0x00]);
        assert_eq!(fx.session.state(), SessionState::Complete);
        assert!(matches!(
            notified(&effects)[..],
            [Notification::StoreChanged(StoreDiff { added, .. })] if added.len() == 1
        ));

        fx.handle(TransportEvent::PresenceLost);
        assert_eq!(fx.session.state(), SessionState::Idle);
        assert_eq!(fx.session.auth_state(), AuthState::Unknown);
    }

    #[test]
    fn list_continuation_is_assembled() {
        let mut fx = Fixture::new();
        fx.handle(TransportEvent::PresenceDetected);
        fx.frame(SELECT_UNLOCKED);

        let effects = fx.frame(&[0x72, 0x02, 0x21, b'a', 0x61, 0x04]);
        assert_eq!(sent(&effects), vec![oath::send_remaining().to_bytes().as_slice()]);

        fx.frame(&[0x72, 0x02, 0x21, b'b', 0x90, 0x00]);
        assert_eq!(fx.store.credentials().len(), 2);
    }

    #[test]
    fn partial_list_is_merged_on_loss() {
        let mut fx = Fixture::new();
        fx.handle(TransportEvent::PresenceDetected);
        fx.frame(SELECT_UNLOCKED);
        fx.frame(&[0x72, 0x02, 0x21, b'a', 0x72, 0x05, 0x21, b'b', 0x61, 0x10]);
        fx.handle(TransportEvent::PresenceLost);

        assert_eq!(fx.session.state(), SessionState::Suspended);
        assert_eq!(fx.store.credentials().len(), 1);
        let point = fx.session.resume_point().unwrap();
        assert_eq!(point.op, None);
        assert_eq!(point.command, oath::ins::LIST);
    }

    #[test]
    fn delete_in_flight_is_held() {
        let mut fx = Fixture::new();
        let id = fx
            .queue
            .enqueue(OperationKind::Delete(CredentialId::new("mail")), None, 0)
            .id()
            .unwrap();
        fx.handle(TransportEvent::PresenceDetected);
        let effects = fx.frame(SELECT_UNLOCKED);
        assert_eq!(sent(&effects), vec![oath::delete(&CredentialId::new("mail")).to_bytes().as_slice()]);

        let effects = fx.handle(TransportEvent::PresenceLost);
        assert!(notified(&effects).contains(&&Notification::MaybePartiallyApplied(id)));
        assert_eq!(fx.queue.get(id).unwrap().state, PendingState::AwaitingConfirmation);
        assert!(fx.session.resume_point().is_none());
    }

    #[test]
    fn timeout_aborts() {
        let mut fx = Fixture::new();
        fx.handle(TransportEvent::PresenceDetected);
        assert!(fx.tick().is_empty());

        fx.clock.advance(Duration::from_secs(6));
        let effects = fx.tick();
        assert_eq!(fx.session.state(), SessionState::Aborted);
        assert_eq!(notified(&effects), vec![&Notification::Aborted(Error::Timeout)]);
        assert!(fx.frame(SELECT_UNLOCKED).is_empty());
    }

    #[test]
    fn malformed_frame_aborts() {
        let mut fx = Fixture::new();
        fx.handle(TransportEvent::PresenceDetected);
        fx.frame(&[0x90]);
        assert_eq!(fx.session.state(), SessionState::Aborted);
    }

    #[test]
    fn wrong_syntax_is_not_a_password_error_outside_validate() {
        let response = ApduResponse::parse(&[0x6A, 0x80]).unwrap();
        assert_eq!(
            status_result(&response, Purpose::Put),
            Err(Error::UnexpectedStatusWord(0x6A80))
        );
        assert_eq!(
            status_result(&response, Purpose::Validate),
            Err(Error::WrongPassword)
        );
    }
}
