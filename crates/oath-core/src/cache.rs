//! Remembered access keys.
//!
//! When the user opts in, the engine stores the derived access key (never the
//! password) bound to the token it unlocks. The host decides where that key
//! lives by implementing [`KeyCache`]; a missing entry just means "no
//! remembered password".

use std::collections::HashMap;
use std::fmt;

use crate::auth::AccessKey;
use crate::credential::DeviceId;

/// Storage for access keys remembered across presentments.
pub trait KeyCache {
    /// Returns the remembered key for `device`, if any.
    fn load(&self, device: &DeviceId) -> Option<AccessKey>;

    /// Remembers `key` for `device`, replacing any previous key.
    fn store(&mut self, device: &DeviceId, key: AccessKey);

    /// Forgets the key for `device`.
    fn remove(&mut self, device: &DeviceId);
}

/// Process-lifetime cache kept in memory.
#[derive(Default)]
pub struct MemoryKeyCache {
    keys: HashMap<DeviceId, AccessKey>,
}

impl MemoryKeyCache {
    /// Returns the number of remembered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for MemoryKeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryKeyCache")
            .field("devices", &self.keys.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl KeyCache for MemoryKeyCache {
    fn load(&self, device: &DeviceId) -> Option<AccessKey> {
        self.keys.get(device).cloned()
    }

    fn store(&mut self, device: &DeviceId, key: AccessKey) {
        self.keys.insert(device.clone(), key);
    }

    fn remove(&mut self, device: &DeviceId) {
        self.keys.remove(device);
    }
}

/// A cache that never remembers anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeyCache;

impl KeyCache for NoKeyCache {
    fn load(&self, _device: &DeviceId) -> Option<AccessKey> {
        None
    }

    fn store(&mut self, _device: &DeviceId, _key: AccessKey) {}

    fn remove(&mut self, _device: &DeviceId) {}
}
