// ============================================================================
// src/config.rs - Runtime / Controller Configuration
// ============================================================================
//!
//! ディスパッチランタイムとコントローラの設定。
//!
//! レジスタレベルの定数は `io::audio::regs` にあり、ここには
//! 実行時に選択できる値だけを置く。

use alloc::string::String;
use core::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Default number of dispatch worker threads
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Upper bound on dispatch worker threads
pub const MAX_WORKER_THREADS: usize = 32;

/// Response slots kept free so the RIRB can never overflow before the CORB does
pub const DEFAULT_RESERVED_RESPONSE_SLOTS: u16 = 4;

/// Period of the interrupt thread when no interrupt arrives
pub const DEFAULT_IRQ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bound on each controller reset phase
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Runtime Configuration
// ============================================================================

/// Dispatch worker pool configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads (clamped to 1..=MAX_WORKER_THREADS)
    pub worker_threads: usize,
    /// Worker thread name prefix
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            thread_name: String::from("hda-dispatch"),
        }
    }
}

impl RuntimeConfig {
    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn with_thread_name(mut self, name: &str) -> Self {
        self.thread_name = String::from(name);
        self
    }

    /// Effective worker count after clamping
    pub fn effective_workers(&self) -> usize {
        self.worker_threads.clamp(1, MAX_WORKER_THREADS)
    }
}

// ============================================================================
// Controller Configuration
// ============================================================================

/// Per-controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Controller name used for logging and the IRQ thread name
    pub name: String,
    /// CORB entries subtracted from the in-flight cap
    pub reserved_response_slots: u16,
    /// Largest CORB size to select (2, 16 or 256)
    pub max_corb_entries: u16,
    /// Largest RIRB size to select (2, 16 or 256)
    pub max_rirb_entries: u16,
    /// Interrupt thread tick period when idle
    pub irq_poll_interval: Duration,
    /// Bound on each controller reset phase
    pub reset_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: String::from("hda0"),
            reserved_response_slots: DEFAULT_RESERVED_RESPONSE_SLOTS,
            max_corb_entries: 256,
            max_rirb_entries: 256,
            irq_poll_interval: DEFAULT_IRQ_POLL_INTERVAL,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

impl ControllerConfig {
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    pub fn with_reserved_response_slots(mut self, slots: u16) -> Self {
        self.reserved_response_slots = slots;
        self
    }

    pub fn with_max_corb_entries(mut self, entries: u16) -> Self {
        self.max_corb_entries = entries;
        self
    }

    pub fn with_max_rirb_entries(mut self, entries: u16) -> Self {
        self.max_rirb_entries = entries;
        self
    }

    pub fn with_irq_poll_interval(mut self, interval: Duration) -> Self {
        self.irq_poll_interval = interval;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}
