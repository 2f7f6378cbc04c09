// ── Test-payload id allocation ──
//
// Tpld ids are session-scoped on the chassis side: a deleted stream's
// tracking state can linger in receiving ports, so ids are handed out
// monotonically and never reused within a session.

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic tpld-id allocator, shared by every port of a session.
///
/// The counter only moves forward: explicit ids and ids observed
/// during stream discovery both advance it past themselves, and
/// stream deletion never returns an id to the pool.
#[derive(Debug, Default)]
pub struct TpldAllocator {
    next: AtomicU32,
}

impl TpldAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a tpld id. An explicit request is honored as-is and
    /// bumps the counter past it; otherwise the next free id is used.
    pub fn allocate(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(id) => {
                self.observe(id);
                id
            }
            None => self.next.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Record an id seen on the device (stream discovery) so it is
    /// never handed out again.
    pub fn observe(&self, id: u32) {
        self.next.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// The id the next implicit allocation would return.
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_allocation_is_sequential() {
        let alloc = TpldAllocator::new();
        assert_eq!(alloc.allocate(None), 0);
        assert_eq!(alloc.allocate(None), 1);
        assert_eq!(alloc.peek(), 2);
    }

    #[test]
    fn explicit_ids_never_reused() {
        let alloc = TpldAllocator::new();
        assert_eq!(alloc.allocate(Some(5)), 5);
        assert_eq!(alloc.allocate(Some(3)), 3);
        // max seen + 1, never back to 3 or 5.
        assert_eq!(alloc.allocate(None), 6);
    }

    #[test]
    fn discovery_advances_past_observed_ids() {
        let alloc = TpldAllocator::new();
        alloc.observe(0);
        alloc.observe(7);
        alloc.observe(2);
        assert_eq!(alloc.allocate(None), 8);
    }

    #[test]
    fn counter_is_monotonic() {
        let alloc = TpldAllocator::new();
        assert_eq!(alloc.allocate(Some(10)), 10);
        alloc.observe(4);
        assert_eq!(alloc.peek(), 11);
    }
}
