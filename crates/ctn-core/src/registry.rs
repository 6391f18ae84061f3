//! Ordered record of open sessions for teardown.

use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// LIFO stack of session ids. The first session opened holds the lock
/// decision and must be the last one closed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: u64,
    stack: Vec<SessionId>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and push it.
    pub fn register(&mut self) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.stack.push(id);
        id
    }

    /// Remove `id`; returns false if it was not registered.
    ///
    /// Closing out of order is allowed but logged, since it means the
    /// lock-holding session may go away before its dependents.
    pub fn unregister(&mut self, id: SessionId) -> bool {
        let Some(pos) = self.stack.iter().rposition(|s| *s == id) else {
            return false;
        };
        if pos + 1 != self.stack.len() {
            warn!(session = %id, depth = self.stack.len() - pos - 1, "session closed out of order");
        }
        self.stack.remove(pos);
        true
    }

    #[must_use]
    pub fn top(&self) -> Option<SessionId> {
        self.stack.last().copied()
    }

    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.stack.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Newest first.
    pub fn iter_lifo(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.stack.iter().rev().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_pop_newest_first() {
        let mut registry = SessionRegistry::new();
        let master = registry.register();
        let op = registry.register();
        assert_eq!(registry.top(), Some(op));
        assert_eq!(registry.iter_lifo().collect::<Vec<_>>(), vec![op, master]);

        assert!(registry.unregister(op));
        assert_eq!(registry.top(), Some(master));
        assert!(registry.unregister(master));
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_is_exactly_once() {
        let mut registry = SessionRegistry::new();
        let id = registry.register();
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
    }

    #[test]
    fn out_of_order_removal_keeps_the_rest() {
        let mut registry = SessionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        let c = registry.register();
        assert!(registry.unregister(a));
        assert_eq!(registry.iter_lifo().collect::<Vec<_>>(), vec![c, b]);
        assert!(!registry.contains(a));
    }
}
