//! Host-side cache of the credentials on the current token.
//!
//! The token is the source of truth; [`CredentialStore`] mirrors it and adds
//! metadata the applet cannot hold: Steam rendering, the single credential
//! shown on the cover, and rename bookkeeping. Every mutation returns a
//! [`StoreDiff`] for observers.
//!
//! # Reads
//!
//! | Completeness | Added | Updated | Removed |
//! |--------------|-------|---------|---------|
//! | `Full` | yes | yes | absent ones, unless in transition |
//! | `Partial` | yes | yes | never |
//!
//! A LIST cut short by presence loss is merged as `Partial`, so a lifted
//! token never makes credentials disappear.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::credential::{
    Credential, CredentialDraft, CredentialId, DeviceId, Digits, Mode, OtpCode, Variant,
};
use crate::yubikey::oath::{CalculatedCode, ListEntry, Truncated};

/// Whether a read covered the whole token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Completeness {
    /// Every credential on the token was read.
    Full,
    /// The read was interrupted; absent credentials may still exist.
    Partial,
}

/// Entries returned by a LIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResult {
    /// Credentials read from the token.
    pub entries: Vec<ListEntry>,
    /// Whether the read is authoritative.
    pub completeness: Completeness,
}

/// Changes made by one store mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreDiff {
    /// Credentials that appeared.
    pub added: Vec<CredentialId>,
    /// Credentials that disappeared.
    pub removed: Vec<CredentialId>,
    /// Credentials whose attributes or code changed.
    pub updated: Vec<CredentialId>,
}

impl StoreDiff {
    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Appends another diff.
    pub fn extend(&mut self, other: StoreDiff) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
        self.updated.extend(other.updated);
    }
}

/// How to pick the credential shown on the cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverCriteria {
    /// This exact credential.
    Id(CredentialId),
    /// The first credential of this mode.
    FirstOfMode(Mode),
    /// The current choice if it still exists, otherwise the first credential.
    KeepOrFirst,
}

/// Immutable copy of the store for readers outside the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSnapshot {
    device: Option<String>,
    credentials: Vec<Credential>,
    cover: Option<CredentialId>,
    in_transition: Vec<CredentialId>,
    authoritative: bool,
}

impl StoreSnapshot {
    /// Hex id of the token the credentials belong to.
    #[must_use]
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Credentials in token order.
    #[must_use]
    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Looks a credential up by id.
    #[must_use]
    pub fn get(&self, id: &CredentialId) -> Option<&Credential> {
        self.credentials.iter().find(|c| &c.id == id)
    }

    /// The credential shown on the cover.
    #[must_use]
    pub fn cover(&self) -> Option<&Credential> {
        self.cover.as_ref().and_then(|id| self.get(id))
    }

    /// Returns `true` if a rename of `id` is half done.
    #[must_use]
    pub fn is_in_transition(&self, id: &CredentialId) -> bool {
        self.in_transition.contains(id)
    }

    /// Returns `true` if the last LIST was a full read.
    #[must_use]
    pub const fn is_authoritative(&self) -> bool {
        self.authoritative
    }
}

/// The credential cache for one token.
#[derive(Debug, Default)]
pub struct CredentialStore {
    device: Option<DeviceId>,
    credentials: Vec<Credential>,
    steam: HashSet<CredentialId>,
    cover: Option<CredentialId>,
    /// Old id to new id for renames whose PUT half is pending.
    in_transition: HashMap<CredentialId, CredentialId>,
    authoritative: bool,
}

impl CredentialStore {
    /// Creates an empty store bound to no token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token the store mirrors.
    #[must_use]
    pub const fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    /// Returns the credentials in token order.
    #[must_use]
    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Looks a credential up by id.
    #[must_use]
    pub fn get(&self, id: &CredentialId) -> Option<&Credential> {
        self.credentials.iter().find(|c| &c.id == id)
    }

    /// Returns `true` if `id` is known on `device`.
    ///
    /// Name comparison is exact and case-sensitive, like the applet's.
    #[must_use]
    pub fn contains_on(&self, device: &DeviceId, id: &CredentialId) -> bool {
        self.device.as_ref() == Some(device) && self.get(id).is_some()
    }

    /// Returns `true` if `id` is waiting for the PUT half of a rename.
    #[must_use]
    pub fn is_in_transition(&self, id: &CredentialId) -> bool {
        self.in_transition.contains_key(id)
    }

    /// Switches the store to another token.
    ///
    /// Rebinding to a different device drops every credential and reports
    /// them as removed; rebinding to the same device changes nothing.
    pub fn bind(&mut self, device: &DeviceId) -> StoreDiff {
        if self.device.as_ref() == Some(device) {
            return StoreDiff::default();
        }
        let diff = self.clear();
        self.device = Some(device.clone());
        diff
    }

    /// Moves the store to the id a token received after RESET.
    pub fn rebind_after_reset(&mut self, device: &DeviceId) {
        self.device = Some(device.clone());
    }

    /// Reconciles a LIST result with the cached set.
    pub fn merge(&mut self, result: ListResult) -> StoreDiff {
        let mut diff = StoreDiff::default();

        for entry in &result.entries {
            match self.credentials.iter_mut().find(|c| c.id == entry.id) {
                Some(existing) => {
                    if existing.mode != entry.mode || existing.algorithm != entry.algorithm {
                        existing.mode = entry.mode;
                        existing.algorithm = entry.algorithm;
                        existing.counter = match entry.mode {
                            Mode::Counter => existing.counter.or(Some(0)),
                            Mode::Time => None,
                        };
                        diff.updated.push(entry.id.clone());
                    }
                }
                None => {
                    let mut credential =
                        Credential::from_listing(entry.id.clone(), entry.mode, entry.algorithm);
                    if self.steam.contains(&entry.id) {
                        credential.variant = Variant::Steam;
                    }
                    diff.added.push(entry.id.clone());
                    self.credentials.push(credential);
                }
            }
        }

        if result.completeness == Completeness::Full {
            let seen: HashSet<&CredentialId> = result.entries.iter().map(|e| &e.id).collect();
            let in_transition = &self.in_transition;
            let mut removed = Vec::new();
            self.credentials.retain(|c| {
                let keep = seen.contains(&c.id) || in_transition.contains_key(&c.id);
                if !keep {
                    removed.push(c.id.clone());
                }
                keep
            });
            for id in &removed {
                self.forget_cover(id);
            }
            diff.removed = removed;
        }

        self.authoritative = result.completeness == Completeness::Full;
        diff
    }

    /// Applies the outcome of a CALCULATE ALL.
    pub fn apply_codes(&mut self, codes: &[(CredentialId, CalculatedCode)]) -> StoreDiff {
        let mut diff = StoreDiff::default();
        for (id, outcome) in codes {
            let Some(credential) = self.credentials.iter_mut().find(|c| &c.id == id) else {
                continue;
            };
            let before = credential.clone();
            match outcome {
                CalculatedCode::Code(truncated) => apply_truncated(credential, *truncated),
                CalculatedCode::TouchRequired => {
                    credential.requires_touch = true;
                    credential.code = None;
                }
                CalculatedCode::NotCalculated => {}
            }
            if *credential != before {
                diff.updated.push(id.clone());
            }
        }
        diff
    }

    /// Records the result of a single CALCULATE.
    ///
    /// For counter credentials the local counter mirror advances by one,
    /// matching the increment the token just made.
    pub fn record_calculation(&mut self, id: &CredentialId, truncated: Truncated) -> StoreDiff {
        let mut diff = StoreDiff::default();
        if let Some(credential) = self.credentials.iter_mut().find(|c| &c.id == id) {
            apply_truncated(credential, truncated);
            if let Some(counter) = credential.counter.as_mut() {
                *counter = counter.saturating_add(1);
            }
            diff.updated.push(id.clone());
        }
        diff
    }

    /// Inserts a credential written by a successful PUT.
    pub fn insert(&mut self, mut credential: Credential) -> StoreDiff {
        let mut diff = StoreDiff::default();
        if credential.variant == Variant::Steam {
            self.steam.insert(credential.id.clone());
        } else if self.steam.contains(&credential.id) {
            credential.variant = Variant::Steam;
        }
        let id = credential.id.clone();
        match self.credentials.iter_mut().find(|c| c.id == id) {
            Some(existing) => {
                *existing = credential;
                diff.updated.push(id);
            }
            None => {
                self.credentials.push(credential);
                diff.added.push(id);
            }
        }
        diff
    }

    /// Inserts the credential a draft was written as.
    pub fn insert_from_draft(&mut self, draft: &CredentialDraft) -> StoreDiff {
        self.insert(draft.to_credential())
    }

    /// Removes a credential after DELETE.
    pub fn remove(&mut self, id: &CredentialId) -> StoreDiff {
        let mut diff = StoreDiff::default();
        let before = self.credentials.len();
        self.credentials.retain(|c| &c.id != id);
        self.in_transition.remove(id);
        if self.credentials.len() != before {
            diff.removed.push(id.clone());
        }
        self.forget_cover(id);
        diff
    }

    /// Marks `old` as renamed to `new` with the PUT half still pending.
    pub fn mark_in_transition(&mut self, old: &CredentialId, new: &CredentialId) -> StoreDiff {
        self.in_transition.insert(old.clone(), new.clone());
        let mut diff = StoreDiff::default();
        if self.get(old).is_some() {
            diff.updated.push(old.clone());
        }
        diff
    }

    /// Finishes a rename once its PUT half succeeded.
    ///
    /// The new credential inherits the cover designation and Steam rendering
    /// of the old one.
    pub fn rename(&mut self, old: &CredentialId, mut renamed: Credential) -> StoreDiff {
        self.in_transition.remove(old);

        let was_cover = self.cover.as_ref() == Some(old);
        if self.steam.remove(old) {
            renamed.variant = Variant::Steam;
        }
        let new_id = renamed.id.clone();

        let mut diff = self.remove(old);
        diff.extend(self.insert(renamed));
        if was_cover {
            self.cover = Some(new_id);
        }
        diff
    }

    /// Drops every credential, as after RESET or a token switch.
    pub fn clear(&mut self) -> StoreDiff {
        let removed = self.credentials.drain(..).map(|c| c.id).collect();
        self.cover = None;
        self.in_transition.clear();
        self.authoritative = false;
        StoreDiff {
            removed,
            ..StoreDiff::default()
        }
    }

    /// Sets the rendering of a credential.
    ///
    /// Steam credentials always use six digits.
    pub fn set_variant(&mut self, id: &CredentialId, variant: Variant) -> StoreDiff {
        match variant {
            Variant::Steam => self.steam.insert(id.clone()),
            Variant::Standard => self.steam.remove(id),
        };
        let mut diff = StoreDiff::default();
        if let Some(credential) = self.credentials.iter_mut().find(|c| &c.id == id)
            && credential.variant != variant
        {
            credential.variant = variant;
            if variant == Variant::Steam {
                credential.digits = Digits::SIX;
            }
            if let Some(code) = credential.code.as_mut() {
                code.variant = variant;
            }
            diff.updated.push(id.clone());
        }
        diff
    }

    /// Designates the credential shown on the cover.
    ///
    /// Exactly one credential holds the designation at a time; selecting
    /// another one moves it. Returns `None` and clears the designation when
    /// nothing matches.
    pub fn select(&mut self, criteria: &CoverCriteria) -> Option<&Credential> {
        let chosen = match criteria {
            CoverCriteria::Id(id) => self.get(id).map(|c| c.id.clone()),
            CoverCriteria::FirstOfMode(mode) => self
                .credentials
                .iter()
                .find(|c| c.mode == *mode)
                .map(|c| c.id.clone()),
            CoverCriteria::KeepOrFirst => self
                .cover
                .clone()
                .filter(|id| self.get(id).is_some())
                .or_else(|| self.credentials.first().map(|c| c.id.clone())),
        };
        self.cover = chosen;
        self.cover()
    }

    /// Returns the credential shown on the cover.
    #[must_use]
    pub fn cover(&self) -> Option<&Credential> {
        self.cover.as_ref().and_then(|id| self.get(id))
    }

    /// Returns an immutable copy for readers.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            device: self.device.as_ref().map(ToString::to_string),
            credentials: self.credentials.clone(),
            cover: self.cover.clone(),
            in_transition: self.in_transition.keys().cloned().collect(),
            authoritative: self.authoritative,
        }
    }

    fn forget_cover(&mut self, id: &CredentialId) {
        if self.cover.as_ref() == Some(id) {
            self.cover = None;
        }
    }
}

fn apply_truncated(credential: &mut Credential, truncated: Truncated) {
    if let Ok(digits) = Digits::new(truncated.digits)
        && credential.variant == Variant::Standard
    {
        credential.digits = digits;
    }
    credential.code = Some(OtpCode {
        value: truncated.value,
        digits: truncated.digits,
        variant: credential.variant,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::HashAlgorithm;

    fn entry(name: &str, mode: Mode) -> ListEntry {
        ListEntry {
            id: CredentialId::new(name),
            mode,
            algorithm: HashAlgorithm::Sha1,
        }
    }

    fn list(names: &[&str], completeness: Completeness) -> ListResult {
        ListResult {
            entries: names.iter().map(|n| entry(n, Mode::Time)).collect(),
            completeness,
        }
    }

    fn id(name: &str) -> CredentialId {
        CredentialId::new(name)
    }

    fn bound_store() -> CredentialStore {
        let mut store = CredentialStore::new();
        store.bind(&DeviceId::new(vec![1]));
        store
    }

    #[test]
    fn full_merge_reports_additions_and_removals() {
        let mut store = bound_store();

        let diff = store.merge(list(&["a", "b"], Completeness::Full));
        assert_eq!(diff.added, vec![id("a"), id("b")]);

        let diff = store.merge(list(&["b", "c"], Completeness::Full));
        assert_eq!(diff.added, vec![id("c")]);
        assert_eq!(diff.removed, vec![id("a")]);
        assert!(store.snapshot().is_authoritative());
    }

    #[test]
    fn partial_merge_never_removes() {
        let mut store = bound_store();
        store.merge(list(&["a", "b", "c"], Completeness::Full));

        let diff = store.merge(list(&["a"], Completeness::Partial));
        assert!(diff.removed.is_empty());
        assert_eq!(store.credentials().len(), 3);
        assert!(!store.snapshot().is_authoritative());
    }

    #[test]
    fn merge_sequence_only_reports_seen_credentials() {
        let mut store = bound_store();
        let reads = [
            (vec!["a"], Completeness::Partial),
            (vec!["a", "b"], Completeness::Full),
            (vec![], Completeness::Partial),
            (vec!["c"], Completeness::Partial),
            (vec!["c"], Completeness::Full),
        ];
        let mut seen: HashSet<CredentialId> = HashSet::new();

        for (names, completeness) in reads {
            seen.extend(names.iter().map(|n| id(n)));
            let diff = store.merge(list(&names, completeness));
            for reported in diff.added.iter().chain(&diff.removed).chain(&diff.updated) {
                assert!(seen.contains(reported));
            }
            if completeness == Completeness::Partial {
                assert!(diff.removed.is_empty());
            }
        }
        assert_eq!(store.credentials().len(), 1);
    }

    #[test]
    fn mode_change_is_an_update() {
        let mut store = bound_store();
        store.merge(list(&["a"], Completeness::Full));

        let diff = store.merge(ListResult {
            entries: vec![entry("a", Mode::Counter)],
            completeness: Completeness::Full,
        });
        assert_eq!(diff.updated, vec![id("a")]);
        assert_eq!(store.get(&id("a")).unwrap().counter, Some(0));
    }

    #[test]
    fn in_transition_survives_full_read() {
        let mut store = bound_store();
        store.merge(list(&["mail"], Completeness::Full));
        store.mark_in_transition(&id("mail"), &id("work"));

        let diff = store.merge(list(&[], Completeness::Full));
        assert!(diff.removed.is_empty());
        assert!(store.is_in_transition(&id("mail")));
    }

    #[test]
    fn rename_moves_cover_and_steam() {
        let mut store = bound_store();
        store.merge(list(&["mail", "other"], Completeness::Full));
        store.set_variant(&id("mail"), Variant::Steam);
        store.select(&CoverCriteria::Id(id("mail")));
        store.mark_in_transition(&id("mail"), &id("work"));

        let renamed = Credential::from_listing(id("work"), Mode::Time, HashAlgorithm::Sha1);
        let diff = store.rename(&id("mail"), renamed);

        assert_eq!(diff.removed, vec![id("mail")]);
        assert_eq!(diff.added, vec![id("work")]);
        assert_eq!(store.cover().unwrap().id, id("work"));
        assert_eq!(store.get(&id("work")).unwrap().variant, Variant::Steam);
        assert!(!store.is_in_transition(&id("mail")));
    }

    #[test]
    fn cover_is_exclusive() {
        let mut store = bound_store();
        store.merge(ListResult {
            entries: vec![entry("a", Mode::Time), entry("b", Mode::Counter)],
            completeness: Completeness::Full,
        });

        assert_eq!(store.select(&CoverCriteria::KeepOrFirst).unwrap().id, id("a"));
        assert_eq!(
            store.select(&CoverCriteria::FirstOfMode(Mode::Counter)).unwrap().id,
            id("b")
        );
        assert_eq!(store.snapshot().cover().unwrap().id, id("b"));
        assert_eq!(store.select(&CoverCriteria::KeepOrFirst).unwrap().id, id("b"));
        assert!(store.select(&CoverCriteria::Id(id("zzz"))).is_none());
        assert!(store.cover().is_none());
    }

    #[test]
    fn removing_cover_clears_it() {
        let mut store = bound_store();
        store.merge(list(&["a"], Completeness::Full));
        store.select(&CoverCriteria::Id(id("a")));
        store.remove(&id("a"));
        assert!(store.cover().is_none());
    }

    #[test]
    fn bind_other_device_clears() {
        let mut store = bound_store();
        store.merge(list(&["a"], Completeness::Full));

        assert!(store.bind(&DeviceId::new(vec![1])).is_empty());
        let diff = store.bind(&DeviceId::new(vec![2]));
        assert_eq!(diff.removed, vec![id("a")]);
        assert!(store.credentials().is_empty());
        assert!(!store.contains_on(&DeviceId::new(vec![2]), &id("a")));
    }

    #[test]
    fn codes_and_counters() {
        let mut store = bound_store();
        store.merge(ListResult {
            entries: vec![entry("totp", Mode::Time), entry("hotp", Mode::Counter)],
            completeness: Completeness::Full,
        });

        let diff = store.apply_codes(&[
            (
                id("totp"),
                CalculatedCode::Code(Truncated {
                    digits: 8,
                    value: 12_345_678,
                }),
            ),
            (id("hotp"), CalculatedCode::NotCalculated),
        ]);
        assert_eq!(diff.updated, vec![id("totp")]);
        let totp = store.get(&id("totp")).unwrap();
        assert_eq!(totp.digits.get(), 8);
        assert_eq!(totp.code.unwrap().to_string(), "12345678");

        store.record_calculation(&id("hotp"), Truncated { digits: 6, value: 1 });
        store.record_calculation(&id("hotp"), Truncated { digits: 6, value: 2 });
        assert_eq!(store.get(&id("hotp")).unwrap().counter, Some(2));
    }

    #[test]
    fn steam_variant_survives_relist() {
        let mut store = bound_store();
        store.merge(list(&["Steam:me"], Completeness::Full));
        store.set_variant(&id("Steam:me"), Variant::Steam);
        store.merge(list(&[], Completeness::Full));
        store.merge(list(&["Steam:me"], Completeness::Full));
        assert_eq!(store.get(&id("Steam:me")).unwrap().variant, Variant::Steam);
    }
}
