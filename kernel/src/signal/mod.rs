//! The signal subsystem: atomic pending-signal bitmaps (process-scope and
//! per-task), the shared action table, and the delivery routine that picks
//! the next signal to deliver and hands it to [`sigframe`].
//!
//! Grounded on the original implementation's `src/ipc/signal.c`:
//! `sigbits_*` (atomic bitmap primitives), `sighand`/`sigaction` (the
//! action table), `should_deliver`/`get_procsig_to_deliver`/
//! `get_tasksig_to_deliver`/`deliver_signal` (the delivery path).

pub(crate) mod sigframe;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::config::NSIG;

/// A lock-free, atomic pending-signal bitmap, bit `i` meaning "signal `i`
/// is pending" (1-indexed, as in Linux). Must stay lock-free because the
/// per-task instance is written to from an asynchronous host signal
/// handler (see `task::install_signal_trampoline`).
#[derive(Default)]
pub(crate) struct AtomicSigBits(AtomicU64);

impl AtomicSigBits {
    pub(crate) fn empty() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) fn is_member(&self, signum: u32) -> bool {
        self.0.load(Ordering::SeqCst) & bit(signum) != 0
    }

    pub(crate) fn add(&self, signum: u32) {
        self.0.fetch_or(bit(signum), Ordering::SeqCst);
    }

    /// Clears `signum` and reports whether it was set beforehand. Callers
    /// performing a compare-and-clear retry loop (the task-signal delivery
    /// path) use the return value to decide whether their scan result is
    /// still valid.
    pub(crate) fn del(&self, signum: u32) -> bool {
        let old = self.0.fetch_and(!bit(signum), Ordering::SeqCst);
        old & bit(signum) != 0
    }

    pub(crate) fn add_set(&self, mask: u64) {
        self.0.fetch_or(mask, Ordering::SeqCst);
    }

    pub(crate) fn del_set(&self, mask: u64) {
        self.0.fetch_and(!mask, Ordering::SeqCst);
    }

    /// Atomically replaces the whole bitmap, returning the previous value.
    pub(crate) fn replace(&self, value: u64) -> u64 {
        self.0.swap(value, Ordering::SeqCst)
    }

    pub(crate) fn load(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the lowest-numbered pending, unmasked signal, if any,
    /// scanning bits 1..=NSIG as `get_procsig_to_deliver`/
    /// `get_tasksig_to_deliver` do.
    pub(crate) fn next_deliverable(&self, sigmask: u64) -> Option<u32> {
        let pending = self.0.load(Ordering::SeqCst) & !sigmask;
        if pending == 0 {
            return None;
        }
        Some(pending.trailing_zeros())
    }
}

fn bit(signum: u32) -> u64 {
    assert!((1..NSIG as u32).contains(&signum), "signal number out of range");
    1u64 << signum
}

/// One entry of the per-process signal action table.
#[derive(Clone, Copy, Default)]
pub(crate) struct SigAction {
    pub(crate) handler: u64,
    pub(crate) flags: u64,
    pub(crate) restorer: u64,
    pub(crate) mask: u64,
}

/// Default (ignore-or-terminate) action, the sentinel stored before a guest
/// ever calls `rt_sigaction`.
pub(crate) const SIG_DFL: u64 = 0;
/// Sentinel meaning "ignore this signal".
pub(crate) const SIG_IGN: u64 = 1;

/// The process-wide, rwlock-protected signal action table, shared by every
/// task in the process (as `CLONE_SIGHAND` implies on Linux).
pub(crate) struct SigHand {
    actions: RwLock<[SigAction; NSIG]>,
}

impl SigHand {
    pub(crate) fn new() -> Self {
        Self { actions: RwLock::new([SigAction::default(); NSIG]) }
    }

    pub(crate) fn get(&self, signum: u32) -> SigAction {
        self.actions.read().unwrap()[signum as usize]
    }

    pub(crate) fn set(&self, signum: u32, action: SigAction) -> SigAction {
        let mut actions = self.actions.write().unwrap();
        std::mem::replace(&mut actions[signum as usize], action)
    }
}

/// Whether `signum` should be delivered given `sigmask`: pending, in range,
/// and not blocked. Mirrors `should_deliver`.
pub(crate) fn should_deliver(signum: u32, sigmask: u64) -> bool {
    signum != 0 && (sigmask & bit(signum)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn add_then_del_restores_emptiness() {
        let bits = AtomicSigBits::empty();
        bits.add(10);
        assert!(bits.is_member(10));
        assert!(bits.del(10));
        assert!(!bits.is_member(10));
        assert!(!bits.del(10));
    }

    proptest! {
        #[test]
        fn ismember_agrees_with_bit_set(signums in prop::collection::vec(1u32..63, 0..32)) {
            let bits = AtomicSigBits::empty();
            for &s in &signums {
                bits.add(s);
            }
            let mut expected = 0u64;
            for &s in &signums {
                expected |= 1u64 << s;
            }
            for s in 1u32..63 {
                prop_assert_eq!(bits.is_member(s), (expected & (1u64 << s)) != 0);
            }
        }
    }
}
