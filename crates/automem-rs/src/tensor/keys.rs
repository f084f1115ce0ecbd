//! Device identifiers and the dispatch-key bit set cached on cells.

use std::fmt;

/// Placement of a tensor's backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    /// Accelerator device with an ordinal.
    Accel(u32),
}

/// Bit set of dispatch keys carried by a tensor.
///
/// Only the keys the memory core inspects are modeled; the set is cached on a
/// cell at first fill so metadata queries never force a rematerialization.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct KeySet(u32);

impl KeySet {
    pub const EMPTY: KeySet = KeySet(0);
    /// Ordinary dense tensor.
    pub const DENSE: KeySet = KeySet(1 << 0);
    /// Gradient tracking requested.
    pub const AUTOGRAD: KeySet = KeySet(1 << 1);
    /// Tensor is routed through the checkpoint wrapper.
    pub const CHECKPOINT: KeySet = KeySet(1 << 2);

    /// Returns the union of `self` and `key`.
    pub fn add(self, key: KeySet) -> KeySet {
        KeySet(self.0 | key.0)
    }

    /// Reports whether every bit of `key` is present.
    pub fn has(self, key: KeySet) -> bool {
        self.0 & key.0 == key.0
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.has(KeySet::DENSE) {
            set.entry(&"dense");
        }
        if self.has(KeySet::AUTOGRAD) {
            set.entry(&"autograd");
        }
        if self.has(KeySet::CHECKPOINT) {
            set.entry(&"checkpoint");
        }
        set.finish()
    }
}

/// Adds the checkpoint key to a key set that must not already carry it.
pub fn convert_key_set(keys: KeySet) -> KeySet {
    assert!(
        !keys.has(KeySet::CHECKPOINT),
        "key set already carries the checkpoint key"
    );
    keys.add(KeySet::CHECKPOINT)
}
