//! Callback registration table.
//!
//! One slot per operation family; the latest registration wins. Lookups copy the
//! entry out so no map guard is alive while the guest runs.

use crate::memory::FunctionHandle;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;

/// A guest callback and the opaque word passed back to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Guest function to call
    pub callback: FunctionHandle,
    /// Opaque user context word
    pub user_context: u32,
}

/// Per-domain mapping from operation family to guest callback
pub struct RegistrationTable<F: Eq + Hash> {
    entries: DashMap<F, Registration>,
}

impl<F: Eq + Hash + Copy> RegistrationTable<F> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store `callback` for `family`, returning the entry it replaced
    ///
    /// Handles are not validated here; a bad handle surfaces later as an
    /// invocation failure that the dispatcher absorbs.
    pub fn register(
        &self,
        family: F,
        callback: FunctionHandle,
        user_context: u32,
    ) -> Option<Registration> {
        self.entries.insert(
            family,
            Registration {
                callback,
                user_context,
            },
        )
    }

    /// Remove the entry for `family`
    pub fn unregister(&self, family: F) -> Option<Registration> {
        self.entries.remove(&family).map(|(_, entry)| entry)
    }

    /// Current entry for `family`
    pub fn lookup(&self, family: F) -> Option<Registration> {
        self.entries.get(&family).map(|entry| *entry)
    }

    /// Number of families with a registration
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<F: Eq + Hash + Copy> Default for RegistrationTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Family {
        Config,
        Rpc,
    }

    #[test]
    fn test_register_and_lookup() {
        let table = RegistrationTable::new();
        assert!(table.lookup(Family::Config).is_none());

        table.register(Family::Config, FunctionHandle(3), 11);
        assert_eq!(
            table.lookup(Family::Config),
            Some(Registration {
                callback: FunctionHandle(3),
                user_context: 11
            })
        );
        assert!(table.lookup(Family::Rpc).is_none());
    }

    #[test]
    fn test_later_registration_overwrites() {
        let table = RegistrationTable::new();
        assert!(table.register(Family::Rpc, FunctionHandle(1), 0).is_none());
        let previous = table.register(Family::Rpc, FunctionHandle(2), 5);
        assert_eq!(previous.map(|r| r.callback), Some(FunctionHandle(1)));
        assert_eq!(table.lookup(Family::Rpc).map(|r| r.callback), Some(FunctionHandle(2)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let table = RegistrationTable::new();
        table.register(Family::Config, FunctionHandle(9), 0);
        assert!(table.unregister(Family::Config).is_some());
        assert!(table.is_empty());
    }
}
