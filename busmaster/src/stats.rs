//! Subsystem statistics.

use core::fmt;

use crate::completion::QueueStats;
use crate::dma::MappingKind;

/// Counters owned by the mapper. Updated under `&mut`, so plain integers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MapCounters {
    pub direct: u32,
    pub translated: u32,
    pub bounced: u32,
    pub active: u32,
    pub errors: u32,
    /// Direct or translated attempts that ended on the bounce path.
    pub fallbacks: u32,
    pub release_errors: u32,
}

impl MapCounters {
    pub fn record_map(&mut self, kind: MappingKind) {
        let counter = match kind {
            MappingKind::Direct => &mut self.direct,
            MappingKind::Translated => &mut self.translated,
            MappingKind::Bounced => &mut self.bounced,
        };
        *counter = counter.wrapping_add(1);
        self.active += 1;
    }

    pub fn record_unmap(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn record_error(&mut self) {
        self.errors = self.errors.wrapping_add(1);
    }

    pub fn record_fallback(&mut self) {
        self.fallbacks = self.fallbacks.wrapping_add(1);
    }

    pub fn record_release_error(&mut self) {
        self.release_errors = self.release_errors.wrapping_add(1);
    }
}

/// Point-in-time view of the whole subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub direct_mappings: u32,
    pub translated_mappings: u32,
    pub bounce_mappings: u32,
    pub active_mappings: u32,
    pub map_errors: u32,
    pub bounce_fallbacks: u32,
    pub translation_release_errors: u32,
    pub tx_pool_exhausted: u32,
    pub rx_pool_exhausted: u32,
    pub cache_syncs: u32,
    pub global_flushes: u32,
    pub coalesced_flushes: u32,
    pub boundary_violations: u32,
    pub total_violations: u32,
    pub enqueued: u32,
    pub completed: u32,
    pub overflow_events: u32,
    pub timeouts: u32,
    pub recovered: u32,
    pub seqlock_fallbacks: u32,
    pub queue_high_water: u32,
}

impl StatsSnapshot {
    /// Fill in the completion-queue half.
    pub fn with_queue(mut self, queue: &QueueStats) -> Self {
        self.enqueued = queue.enqueued;
        self.completed = queue.completed;
        self.overflow_events = queue.overflow_events;
        self.timeouts = queue.timeouts;
        self.recovered = queue.recovered;
        self.seqlock_fallbacks = queue.seqlock_fallbacks;
        self.queue_high_water = queue.high_water;
        self
    }

    pub fn total_mappings(&self) -> u32 {
        self.direct_mappings + self.translated_mappings + self.bounce_mappings
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "mappings: {} direct, {} translated, {} bounced, {} active",
            self.direct_mappings, self.translated_mappings, self.bounce_mappings, self.active_mappings
        )?;
        writeln!(
            f,
            "failures: {} errors, {} bounce fallbacks, {} release errors, exhausted tx={} rx={}",
            self.map_errors,
            self.bounce_fallbacks,
            self.translation_release_errors,
            self.tx_pool_exhausted,
            self.rx_pool_exhausted
        )?;
        writeln!(
            f,
            "cache: {} syncs, {} global flushes covering {} deferred",
            self.cache_syncs, self.global_flushes, self.coalesced_flushes
        )?;
        writeln!(
            f,
            "violations: {} total, {} boundary",
            self.total_violations, self.boundary_violations
        )?;
        write!(
            f,
            "queue: {} enqueued, {} completed, {} overflows, {} timeouts, {} recovered, {} fallbacks, high water {}",
            self.enqueued,
            self.completed,
            self.overflow_events,
            self.timeouts,
            self.recovered,
            self.seqlock_fallbacks,
            self.queue_high_water
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_active() {
        let mut c = MapCounters::default();
        c.record_map(MappingKind::Direct);
        c.record_map(MappingKind::Bounced);
        assert_eq!(c.active, 2);
        c.record_unmap();
        c.record_unmap();
        c.record_unmap();
        assert_eq!(c.active, 0);
        assert_eq!((c.direct, c.translated, c.bounced), (1, 0, 1));
    }

    #[test]
    fn test_with_queue_fills_queue_half_only() {
        let mapper = StatsSnapshot {
            bounce_mappings: 2,
            active_mappings: 1,
            ..StatsSnapshot::default()
        };
        let queue = QueueStats {
            enqueued: 9,
            completed: 7,
            overflow_events: 1,
            timeouts: 2,
            recovered: 1,
            seqlock_fallbacks: 3,
            high_water: 4,
            lost: 0,
        };
        let snap = mapper.with_queue(&queue);
        assert_eq!(
            (snap.enqueued, snap.completed, snap.overflow_events, snap.timeouts),
            (9, 7, 1, 2)
        );
        assert_eq!((snap.recovered, snap.seqlock_fallbacks, snap.queue_high_water), (1, 3, 4));
        assert_eq!((snap.bounce_mappings, snap.active_mappings), (2, 1));
        assert_eq!(snap.total_mappings(), 2);
    }

    #[test]
    fn test_display_mentions_every_section() {
        let snap = StatsSnapshot {
            bounce_mappings: 3,
            overflow_events: 1,
            ..StatsSnapshot::default()
        };
        let text = format!("{}", snap);
        assert!(text.contains("3 bounced"));
        assert!(text.contains("1 overflows"));
        assert_eq!(text.lines().count(), 5);
    }
}
