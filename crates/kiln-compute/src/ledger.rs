//! Creation-ordered handle ledger.
//!
//! Backends push every handle right after creating it and drain the ledger
//! once at teardown. Draining pops last-in first-out, so release order is
//! always the exact reverse of creation order, including for a session that
//! failed halfway.

use std::fmt;

/// Stack of live handles.
pub struct HandleLedger<H> {
    handles: Vec<H>,
}

impl<H> Default for HandleLedger<H> {
    fn default() -> Self {
        Self { handles: Vec::new() }
    }
}

impl<H: fmt::Debug> fmt::Debug for HandleLedger<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.handles).finish()
    }
}

impl<H> HandleLedger<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly created handle.
    pub fn track(&mut self, handle: H) {
        self.handles.push(handle);
    }

    /// Handles not yet released.
    pub fn outstanding(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Live handles in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &H> {
        self.handles.iter()
    }

    /// Releases everything, newest first. Returns how many were released.
    /// Calling again on an empty ledger is a no-op.
    pub fn release_all(&mut self, mut release: impl FnMut(H)) -> usize {
        let mut count = 0;
        while let Some(handle) = self.handles.pop() {
            release(handle);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_order() {
        let mut ledger = HandleLedger::new();
        for h in ["instance", "device", "image", "memory", "view"] {
            ledger.track(h);
        }
        assert_eq!(ledger.outstanding(), 5);

        let mut released = Vec::new();
        assert_eq!(ledger.release_all(|h| released.push(h)), 5);
        assert_eq!(released, vec!["view", "memory", "image", "device", "instance"]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ledger = HandleLedger::new();
        ledger.track(1u32);
        assert_eq!(ledger.release_all(|_| {}), 1);
        assert_eq!(ledger.release_all(|_| panic!("already released")), 0);
    }

    #[test]
    fn test_iter_creation_order() {
        let mut ledger = HandleLedger::new();
        ledger.track('a');
        ledger.track('b');
        assert_eq!(ledger.iter().copied().collect::<String>(), "ab");
    }
}
