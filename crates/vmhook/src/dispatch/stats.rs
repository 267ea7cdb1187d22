use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use strum::{EnumCount, IntoEnumIterator};

use super::event::EventKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub dispatched: u64,
    pub overridden: u64,
    pub suppressed: u64,
    /// Decisions the event kind does not accept; handled as pass-through.
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    overridden: AtomicU64,
    suppressed: AtomicU64,
    rejected: AtomicU64,
}

/// Per-kind dispatch counters. Updated from `&self` so nested dispatches
/// during a decision never need exclusive access.
pub struct DispatchStats {
    counters: [Counters; EventKind::COUNT],
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| Counters::default()),
        }
    }
}

impl DispatchStats {
    fn counters(&self, kind: EventKind) -> &Counters {
        &self.counters[kind as usize]
    }

    pub(crate) fn dispatched(&self, kind: EventKind) {
        self.counters(kind).dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn overridden(&self, kind: EventKind) {
        self.counters(kind).overridden.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn suppressed(&self, kind: EventKind) {
        self.counters(kind).suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self, kind: EventKind) {
        self.counters(kind).rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, kind: EventKind) -> KindStats {
        let c = self.counters(kind);
        KindStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            overridden: c.overridden.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Non-zero entries only, in kind order.
    pub fn snapshot(&self) -> Vec<(EventKind, KindStats)> {
        EventKind::iter()
            .map(|kind| (kind, self.get(kind)))
            .filter(|(_, stats)| *stats != KindStats::default())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_kind() {
        let stats = DispatchStats::default();
        stats.dispatched(EventKind::Frame);
        stats.dispatched(EventKind::Frame);
        stats.suppressed(EventKind::ConsolePrint);

        assert_eq!(stats.get(EventKind::Frame).dispatched, 2);
        assert_eq!(stats.get(EventKind::ConsolePrint).suppressed, 1);
        assert_eq!(stats.get(EventKind::ClientSpawn), KindStats::default());
        assert_eq!(stats.snapshot().len(), 2);
    }
}
