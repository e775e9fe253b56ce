// ============================================================================
// src/io/audio/hda/stats.rs - Controller Statistics
// ============================================================================
//!
//! 割り込み・コマンド関連のカウンタ。`stats` フィーチャー無効時は
//! 記録処理がすべて空になる。

use core::sync::atomic::{AtomicU64, Ordering};

/// Interrupt / command counters for one controller
#[derive(Debug, Default)]
pub struct ControllerStats {
    irqs: AtomicU64,
    commands_sent: AtomicU64,
    commands_deferred: AtomicU64,
    solicited: AtomicU64,
    unsolicited: AtomicU64,
    dropped_responses: AtomicU64,
    rirb_overruns: AtomicU64,
    corb_memory_errors: AtomicU64,
}

/// Point-in-time copy of [`ControllerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub irqs: u64,
    pub commands_sent: u64,
    pub commands_deferred: u64,
    pub solicited: u64,
    pub unsolicited: u64,
    pub dropped_responses: u64,
    pub rirb_overruns: u64,
    pub corb_memory_errors: u64,
}

#[inline(always)]
fn bump(_counter: &AtomicU64) {
    #[cfg(feature = "stats")]
    _counter.fetch_add(1, Ordering::Relaxed);
}

impl ControllerStats {
    pub const fn new() -> Self {
        Self {
            irqs: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            commands_deferred: AtomicU64::new(0),
            solicited: AtomicU64::new(0),
            unsolicited: AtomicU64::new(0),
            dropped_responses: AtomicU64::new(0),
            rirb_overruns: AtomicU64::new(0),
            corb_memory_errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_irq(&self) {
        bump(&self.irqs);
    }

    pub(crate) fn record_sent(&self) {
        bump(&self.commands_sent);
    }

    pub(crate) fn record_deferred(&self) {
        bump(&self.commands_deferred);
    }

    pub(crate) fn record_solicited(&self) {
        bump(&self.solicited);
    }

    pub(crate) fn record_unsolicited(&self) {
        bump(&self.unsolicited);
    }

    pub(crate) fn record_dropped(&self) {
        bump(&self.dropped_responses);
    }

    pub(crate) fn record_overrun(&self) {
        bump(&self.rirb_overruns);
    }

    pub(crate) fn record_memory_error(&self) {
        bump(&self.corb_memory_errors);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            irqs: self.irqs.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_deferred: self.commands_deferred.load(Ordering::Relaxed),
            solicited: self.solicited.load(Ordering::Relaxed),
            unsolicited: self.unsolicited.load(Ordering::Relaxed),
            dropped_responses: self.dropped_responses.load(Ordering::Relaxed),
            rirb_overruns: self.rirb_overruns.load(Ordering::Relaxed),
            corb_memory_errors: self.corb_memory_errors.load(Ordering::Relaxed),
        }
    }
}
