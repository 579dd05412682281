// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The set of open sessions, used to keep writers apart.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::policy::{Denied, Grant};

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: BTreeMap<u64, Grant>,
}

/// Grants of all open sessions.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    fn inner(&self) -> MutexGuard<Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `grant` unless it conflicts with an open session.
    ///
    /// Two overlapping sessions must not both be writeable. An overlap where only one side is
    /// writeable is allowed, but logged. The check and the insertion happen atomically.
    pub fn register(self: &Arc<Self>, grant: &Grant) -> Result<Registration, Denied> {
        let mut inner = self.inner();

        for other in inner.entries.values() {
            if !grant.overlaps(other) {
                continue;
            }
            if grant.writeable && other.writeable {
                return Err(Denied::WriteConflict {
                    other: other.label.clone(),
                });
            }
            if grant.writeable || other.writeable {
                warn!(
                    "Session '{}' overlaps with session '{}' [{}, {}), one side is writeable",
                    grant.label, other.label, other.offset, other.end()
                );
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, grant.clone());

        Ok(Registration {
            registry: self.clone(),
            id,
        })
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    /// Whether no session is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the grants of all open sessions, in registration order.
    pub fn sessions(&self) -> Vec<Grant> {
        self.inner().entries.values().cloned().collect()
    }
}

/// Keeps a grant registered until dropped.
pub struct Registration {
    registry: Arc<Registry>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.inner().entries.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(label: &str, offset: u64, span: u64, writeable: bool) -> Grant {
        Grant {
            label: label.to_string(),
            offset,
            span,
            readable: true,
            writeable,
        }
    }

    #[test]
    fn test_write_conflict() {
        let registry = Arc::new(Registry::new());

        let a = registry.register(&grant("a", 100, 50, true)).unwrap();
        assert_eq!(
            registry.register(&grant("b", 149, 10, true)).err(),
            Some(Denied::WriteConflict {
                other: "a".to_string()
            })
        );

        // Adjacent windows do not overlap.
        let _c = registry.register(&grant("c", 150, 10, true)).unwrap();
        let _d = registry.register(&grant("d", 90, 10, true)).unwrap();
        assert_eq!(registry.len(), 3);

        drop(a);
        assert_eq!(registry.len(), 2);
        let _b = registry.register(&grant("b", 149, 1, true)).unwrap();
    }

    #[test]
    fn test_read_only_overlap() {
        let registry = Arc::new(Registry::new());

        let _w = registry.register(&grant("w", 0, 100, true)).unwrap();
        let _r1 = registry.register(&grant("r1", 50, 100, false)).unwrap();
        let _r2 = registry.register(&grant("r2", 0, 200, false)).unwrap();

        let labels: Vec<_> = registry.sessions().into_iter().map(|g| g.label).collect();
        assert_eq!(labels, ["w", "r1", "r2"]);

        // A writer overlapping only readers is fine, one overlapping a writer is not.
        assert!(registry.register(&grant("w2", 150, 50, true)).is_ok());
        assert!(registry.register(&grant("w3", 99, 2, true)).is_err());
    }
}
