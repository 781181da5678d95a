//! User intents waiting for a token.
//!
//! Intents are recorded whether or not a token is present and drained one per
//! presentment by the session. The queue keeps at most one operation per
//! `(target, category)`; the supersession rules are:
//!
//! | New operation | Effect on the queue |
//! |---------------|---------------------|
//! | same target and category as a queued one | replaces it in place |
//! | DELETE of a credential | cancels every other operation on it |
//! | non-ADD operation on a credential with a queued DELETE | dropped |
//! | RESET | cancels earlier credential operations on the same token |
//!
//! Operations that are currently executing are never replaced or cancelled,
//! and neither is a rename whose old name is already deleted: it holds the
//! only copy of the secret. Only RESET, which wipes the token anyway, drops it.

use std::fmt;

use crate::auth::AccessKey;
use crate::credential::{CredentialDraft, CredentialId, DeviceId};
use crate::error::{Error, Result};

/// Identifies a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Which half of a rename runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenamePhase {
    /// The old name still has to be deleted.
    Delete,
    /// The old name is gone; the credential has to be written under the new one.
    Put,
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Write a new credential.
    Add(CredentialDraft),
    /// Remove a credential.
    Delete(CredentialId),
    /// Move a credential to a new name.
    ///
    /// The token never exports secrets, so the caller supplies it again and
    /// `to` carries it.
    Rename {
        /// Current name.
        from: CredentialId,
        /// The credential as it will be written under the new name.
        to: Box<CredentialDraft>,
        /// Next half to run.
        phase: RenamePhase,
    },
    /// Ask the token for one code.
    Calculate(CredentialId),
    /// Wipe the applet.
    Reset,
    /// Protect an unprotected applet.
    SetPassword {
        /// Key to install.
        new_key: AccessKey,
    },
    /// Replace the password.
    ChangePassword {
        /// Key that unlocks the token today.
        old_key: AccessKey,
        /// Key to install.
        new_key: AccessKey,
    },
    /// Remove the password.
    ClearPassword {
        /// Key that unlocks the token today.
        old_key: AccessKey,
    },
}

/// Supersession category of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// ADD.
    Add,
    /// DELETE.
    Delete,
    /// RENAME.
    Rename,
    /// CALCULATE.
    Calculate,
    /// RESET.
    Reset,
    /// SET, CHANGE and CLEAR PASSWORD.
    Password,
}

/// What an operation acts on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// One credential.
    Credential(CredentialId),
    /// The token as a whole.
    Token,
}

impl OperationKind {
    /// Returns the supersession category.
    #[must_use]
    pub const fn category(&self) -> Category {
        match self {
            Self::Add(_) => Category::Add,
            Self::Delete(_) => Category::Delete,
            Self::Rename { .. } => Category::Rename,
            Self::Calculate(_) => Category::Calculate,
            Self::Reset => Category::Reset,
            Self::SetPassword { .. } | Self::ChangePassword { .. } | Self::ClearPassword { .. } => {
                Category::Password
            }
        }
    }

    /// Returns the target.
    #[must_use]
    pub fn target(&self) -> Target {
        match self {
            Self::Add(draft) => Target::Credential(draft.id()),
            Self::Delete(id) | Self::Calculate(id) | Self::Rename { from: id, .. } => {
                Target::Credential(id.clone())
            }
            Self::Reset
            | Self::SetPassword { .. }
            | Self::ChangePassword { .. }
            | Self::ClearPassword { .. } => Target::Token,
        }
    }

    /// Returns the key a locked token must be validated with before this
    /// operation, when the operation brings its own.
    #[must_use]
    pub const fn unlock_key(&self) -> Option<&AccessKey> {
        match self {
            Self::ChangePassword { old_key, .. } | Self::ClearPassword { old_key } => Some(old_key),
            _ => None,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Delete(_) => "delete",
            Self::Rename { .. } => "rename",
            Self::Calculate(_) => "calculate",
            Self::Reset => "reset",
            Self::SetPassword { .. } => "set-password",
            Self::ChangePassword { .. } => "change-password",
            Self::ClearPassword { .. } => "clear-password",
        }
    }
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Waiting for its token.
    Ready,
    /// Dispatched on a present token.
    Active,
    /// Interrupted after it may have taken effect; waits for the user.
    AwaitingConfirmation,
}

/// A user intent waiting for a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    /// Queue-assigned id.
    pub id: OperationId,
    /// What to do.
    pub kind: OperationKind,
    /// Token the operation is bound to; `None` runs on the next token seen.
    pub token: Option<DeviceId>,
    /// Unix seconds at which the intent was recorded.
    pub created_at: u64,
    /// Lifecycle state.
    pub state: PendingState,
}

impl PendingOperation {
    /// Returns `true` while part of the operation has been applied to its
    /// token: it is executing, or it is a rename past its DELETE half.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state == PendingState::Active
            || matches!(
                self.kind,
                OperationKind::Rename {
                    phase: RenamePhase::Put,
                    ..
                }
            )
    }

    fn runs_on(&self, device: &DeviceId) -> bool {
        self.token.as_ref().is_none_or(|token| token == device)
    }

    fn same_token(&self, token: Option<&DeviceId>) -> bool {
        match (self.token.as_ref(), token) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Result of [`PendingOperationQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to the queue.
    Queued(OperationId),
    /// Took the place of an operation with the same target and category.
    Replaced {
        /// The dropped operation.
        previous: OperationId,
        /// The new operation.
        id: OperationId,
    },
    /// Dropped because a queued DELETE makes it moot.
    Superseded {
        /// The DELETE that wins.
        by: OperationId,
    },
}

impl EnqueueOutcome {
    /// Returns the id of the queued operation, if it was kept.
    #[must_use]
    pub const fn id(&self) -> Option<OperationId> {
        match self {
            Self::Queued(id) | Self::Replaced { id, .. } => Some(*id),
            Self::Superseded { .. } => None,
        }
    }
}

/// FIFO of pending operations.
#[derive(Debug, Default)]
pub struct PendingOperationQueue {
    ops: Vec<PendingOperation>,
    next_id: u64,
}

impl PendingOperationQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Iterates in FIFO order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.ops.iter()
    }

    /// Looks an operation up.
    #[must_use]
    pub fn get(&self, id: OperationId) -> Option<&PendingOperation> {
        self.ops.iter().find(|op| op.id == id)
    }

    /// Returns an owned copy for readers.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingOperation> {
        self.ops.clone()
    }

    /// Records an intent, applying the supersession rules.
    pub fn enqueue(
        &mut self,
        kind: OperationKind,
        token: Option<DeviceId>,
        created_at: u64,
    ) -> EnqueueOutcome {
        let category = kind.category();
        let target = kind.target();

        if !matches!(category, Category::Add | Category::Delete)
            && let Target::Credential(_) = &target
            && let Some(delete) = self.ops.iter().find(|op| {
                op.kind.category() == Category::Delete
                    && op.kind.target() == target
                    && op.same_token(token.as_ref())
            })
        {
            return EnqueueOutcome::Superseded { by: delete.id };
        }

        self.next_id += 1;
        let id = OperationId(self.next_id);
        let op = PendingOperation {
            id,
            kind,
            token,
            created_at,
            state: PendingState::Ready,
        };

        match category {
            Category::Delete => self.ops.retain(|other| {
                other.is_committed()
                    || other.kind.target() != target
                    || !other.same_token(op.token.as_ref())
                    || other.kind.category() == Category::Delete
            }),
            Category::Reset => self.ops.retain(|other| {
                other.state == PendingState::Active
                    || !matches!(other.kind.target(), Target::Credential(_))
                    || !other.same_token(op.token.as_ref())
            }),
            _ => {}
        }

        let existing = self.ops.iter_mut().find(|other| {
            !other.is_committed()
                && other.kind.category() == category
                && other.kind.target() == target
                && other.token == op.token
        });
        match existing {
            Some(slot) => {
                let previous = slot.id;
                *slot = op;
                EnqueueOutcome::Replaced { previous, id }
            }
            None => {
                self.ops.push(op);
                EnqueueOutcome::Queued(id)
            }
        }
    }

    /// Returns the first ready operation that may run on `device`.
    #[must_use]
    pub fn peek_matching(&self, device: &DeviceId) -> Option<&PendingOperation> {
        self.ops
            .iter()
            .find(|op| op.state == PendingState::Ready && op.runs_on(device))
    }

    /// Activates the first ready operation for `device` and binds it there.
    pub fn dequeue_matching(&mut self, device: &DeviceId) -> Option<PendingOperation> {
        let id = self.peek_matching(device)?.id;
        self.activate(id, device)
    }

    /// Activates a specific ready operation on `device`.
    pub fn activate(&mut self, id: OperationId, device: &DeviceId) -> Option<PendingOperation> {
        let op = self
            .ops
            .iter_mut()
            .find(|op| op.id == id && op.state == PendingState::Ready && op.runs_on(device))?;
        op.state = PendingState::Active;
        op.token = Some(device.clone());
        Some(op.clone())
    }

    /// Removes an operation the user gave up on.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownOperation`] if `id` is not queued
    /// - [`Error::OperationInFlight`] if it is executing, or is a rename
    ///   whose old name is already deleted
    pub fn cancel(&mut self, id: OperationId) -> Result<PendingOperation> {
        let index = self.index_of(id)?;
        if self.ops[index].is_committed() {
            return Err(Error::OperationInFlight(id));
        }
        Ok(self.ops.remove(index))
    }

    /// Lets a held operation run again.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownOperation`] if `id` is not queued
    /// - [`Error::InvalidState`] if the operation is not awaiting confirmation
    pub fn confirm(&mut self, id: OperationId) -> Result<()> {
        let index = self.index_of(id)?;
        let op = &mut self.ops[index];
        if op.state != PendingState::AwaitingConfirmation {
            return Err(Error::InvalidState("operation is not awaiting confirmation"));
        }
        op.state = PendingState::Ready;
        Ok(())
    }

    /// Removes a finished operation.
    pub fn complete(&mut self, id: OperationId) -> Option<PendingOperation> {
        let index = self.index_of(id).ok()?;
        Some(self.ops.remove(index))
    }

    /// Parks an interrupted operation until the user confirms a retry.
    pub fn hold(&mut self, id: OperationId) {
        self.set_state(id, PendingState::AwaitingConfirmation);
    }

    /// Returns an interrupted operation to the ready state.
    pub fn release(&mut self, id: OperationId) {
        self.set_state(id, PendingState::Ready);
    }

    /// Records that the DELETE half of a rename is done.
    pub fn advance_rename(&mut self, id: OperationId) {
        if let Some(PendingOperation {
            kind: OperationKind::Rename { phase, .. },
            ..
        }) = self.ops.iter_mut().find(|op| op.id == id)
        {
            *phase = RenamePhase::Put;
        }
    }

    /// Moves operations bound to `old` onto `new`, as after RESET.
    pub fn retarget(&mut self, old: &DeviceId, new: &DeviceId) {
        for op in &mut self.ops {
            if op.token.as_ref() == Some(old) {
                op.token = Some(new.clone());
            }
        }
    }

    fn set_state(&mut self, id: OperationId, state: PendingState) {
        if let Some(op) = self.ops.iter_mut().find(|op| op.id == id) {
            op.state = state;
        }
    }

    fn index_of(&self, id: OperationId) -> Result<usize> {
        self.ops
            .iter()
            .position(|op| op.id == id)
            .ok_or(Error::UnknownOperation(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{Digits, HashAlgorithm, Mode, Secret, Variant};

    fn draft(label: &str) -> CredentialDraft {
        CredentialDraft {
            issuer: None,
            label: label.to_string(),
            mode: Mode::Time,
            algorithm: HashAlgorithm::Sha1,
            digits: Digits::SIX,
            variant: Variant::Standard,
            counter: 0,
            requires_touch: false,
            secret: Secret::new(vec![7; 20]),
        }
    }

    fn rename(from: &str, to: &str) -> OperationKind {
        OperationKind::Rename {
            from: CredentialId::new(from),
            to: Box::new(draft(to)),
            phase: RenamePhase::Delete,
        }
    }

    fn delete(name: &str) -> OperationKind {
        OperationKind::Delete(CredentialId::new(name))
    }

    fn device(byte: u8) -> DeviceId {
        DeviceId::new(vec![byte])
    }

    #[test]
    fn second_rename_replaces_first() {
        let mut queue = PendingOperationQueue::new();
        let first = queue.enqueue(rename("mail", "work"), Some(device(1)), 0);
        let second = queue.enqueue(rename("mail", "home"), Some(device(1)), 1);

        assert_eq!(
            second,
            EnqueueOutcome::Replaced {
                previous: first.id().unwrap(),
                id: second.id().unwrap()
            }
        );
        assert_eq!(queue.len(), 1);
        let Some(OperationKind::Rename { to, .. }) = queue.iter().next().map(|op| &op.kind) else {
            panic!("expected a rename");
        };
        assert_eq!(to.label, "home");
    }

    #[test]
    fn delete_supersedes_later_rename() {
        let mut queue = PendingOperationQueue::new();
        let delete_id = queue.enqueue(delete("mail"), Some(device(1)), 0).id().unwrap();
        let outcome = queue.enqueue(rename("mail", "work"), Some(device(1)), 1);

        assert_eq!(outcome, EnqueueOutcome::Superseded { by: delete_id });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.iter().next().unwrap().kind, delete("mail"));
    }

    #[test]
    fn delete_cancels_earlier_ops_on_credential() {
        let mut queue = PendingOperationQueue::new();
        queue.enqueue(OperationKind::Calculate(CredentialId::new("mail")), None, 0);
        queue.enqueue(rename("mail", "work"), None, 0);
        queue.enqueue(OperationKind::Calculate(CredentialId::new("vpn")), None, 0);
        queue.enqueue(delete("mail"), None, 1);

        let kinds: Vec<_> = queue.iter().map(|op| op.kind.name()).collect();
        assert_eq!(kinds, vec!["calculate", "delete"]);
    }

    #[test]
    fn add_after_delete_is_kept() {
        let mut queue = PendingOperationQueue::new();
        queue.enqueue(delete("mail"), None, 0);
        let outcome = queue.enqueue(OperationKind::Add(draft("mail")), None, 1);
        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn reset_cancels_credential_ops_on_same_token() {
        let mut queue = PendingOperationQueue::new();
        queue.enqueue(OperationKind::Add(draft("a")), Some(device(1)), 0);
        queue.enqueue(OperationKind::Add(draft("b")), Some(device(2)), 0);
        queue.enqueue(
            OperationKind::SetPassword {
                new_key: AccessKey::from_bytes(vec![1; 16], HashAlgorithm::Sha1),
            },
            Some(device(1)),
            0,
        );
        queue.enqueue(OperationKind::Reset, Some(device(1)), 1);

        let kinds: Vec<_> = queue.iter().map(|op| op.kind.name()).collect();
        assert_eq!(kinds, vec!["add", "set-password", "reset"]);
        assert_eq!(queue.iter().next().unwrap().token, Some(device(2)));
    }

    #[test]
    fn dequeue_binds_token_and_skips_others() {
        let mut queue = PendingOperationQueue::new();
        queue.enqueue(delete("a"), Some(device(2)), 0);
        let unbound = queue.enqueue(delete("b"), None, 0).id().unwrap();

        let op = queue.dequeue_matching(&device(1)).unwrap();
        assert_eq!(op.id, unbound);
        assert_eq!(op.token, Some(device(1)));
        assert_eq!(op.state, PendingState::Active);
        assert!(queue.dequeue_matching(&device(1)).is_none());
    }

    #[test]
    fn active_ops_are_not_replaced() {
        let mut queue = PendingOperationQueue::new();
        queue.enqueue(delete("a"), Some(device(1)), 0);
        queue.dequeue_matching(&device(1)).unwrap();

        let outcome = queue.enqueue(delete("a"), Some(device(1)), 1);
        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn hold_confirm_release() {
        let mut queue = PendingOperationQueue::new();
        let id = queue.enqueue(delete("a"), None, 0).id().unwrap();
        queue.dequeue_matching(&device(1));

        assert!(matches!(queue.confirm(id), Err(Error::InvalidState(_))));
        queue.hold(id);
        assert!(queue.peek_matching(&device(1)).is_none());
        queue.confirm(id).unwrap();
        assert_eq!(queue.peek_matching(&device(1)).unwrap().id, id);

        queue.dequeue_matching(&device(1));
        queue.release(id);
        assert_eq!(queue.get(id).unwrap().state, PendingState::Ready);
    }

    #[test]
    fn cancel_and_complete() {
        let mut queue = PendingOperationQueue::new();
        let id = queue.enqueue(delete("a"), None, 0).id().unwrap();
        assert_eq!(queue.cancel(id).unwrap().id, id);
        assert_eq!(queue.cancel(id), Err(Error::UnknownOperation(id)));
        assert!(queue.complete(id).is_none());
    }

    #[test]
    fn rename_phase_and_retarget() {
        let mut queue = PendingOperationQueue::new();
        let id = queue.enqueue(rename("a", "b"), Some(device(1)), 0).id().unwrap();
        queue.advance_rename(id);
        queue.retarget(&device(1), &device(9));

        let op = queue.get(id).unwrap();
        assert_eq!(op.token, Some(device(9)));
        assert!(matches!(
            op.kind,
            OperationKind::Rename {
                phase: RenamePhase::Put,
                ..
            }
        ));
    }

    #[test]
    fn half_done_rename_is_kept() {
        let mut queue = PendingOperationQueue::new();
        let id = queue.enqueue(rename("a", "b"), Some(device(1)), 0).id().unwrap();
        queue.advance_rename(id);

        assert!(queue.get(id).unwrap().is_committed());
        assert_eq!(queue.cancel(id), Err(Error::OperationInFlight(id)));

        let again = queue.enqueue(rename("a", "c"), Some(device(1)), 1);
        assert!(matches!(again, EnqueueOutcome::Queued(_)));
        queue.enqueue(delete("a"), Some(device(1)), 2);
        assert!(queue.get(id).is_some());

        queue.enqueue(OperationKind::Reset, Some(device(1)), 3);
        assert!(queue.get(id).is_none());
    }

    #[test]
    fn operation_id_display() {
        assert_eq!(OperationId(3).to_string(), "op-3");
    }
}
