// ============================================================================
// src/sync/wait_queue.rs - Wait Queue / Completion
//
// 「任意の完了を待つ」汎用プリミティブ。
// 待機側は条件を登録後に再確認するため、通知の取りこぼしは起きない。
// ============================================================================

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::time::Instant;

use crossbeam_channel::{Sender, bounded};
use spin::Mutex;

/// Condition-based wait queue
///
/// Producers change state first and then call [`WaitQueue::notify_all`].
/// Waiters re-check their condition after registering, so a notification
/// racing with registration is never lost.
pub struct WaitQueue {
    waiters: Mutex<Vec<Sender<()>>>,
    generation: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of notifications issued so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Wake every registered waiter
    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let waiters: Vec<Sender<()>> = core::mem::take(&mut *self.waiters.lock());
        for w in waiters {
            let _ = w.try_send(());
        }
    }

    /// Block until `cond` holds or `timeout` expires
    ///
    /// Returns the final value of `cond`. `None` waits forever.
    pub fn wait_until<F>(&self, mut cond: F, timeout: Option<Duration>) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if cond() {
                return true;
            }

            let (tx, rx) = bounded::<()>(1);
            self.waiters.lock().push(tx.clone());

            let outcome = if cond() {
                Some(true)
            } else {
                match deadline {
                    None => {
                        let _ = rx.recv();
                        None
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            Some(cond())
                        } else {
                            let _ = rx.recv_timeout(deadline - now);
                            None
                        }
                    }
                }
            };

            // A notify already took it unless we left on our own
            self.forget(&tx);
            if let Some(result) = outcome {
                return result;
            }
        }
    }

    fn forget(&self, tx: &Sender<()>) {
        self.waiters.lock().retain(|w| !w.same_channel(tx));
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot completion flag
pub struct Completion {
    done: AtomicBool,
    queue: WaitQueue,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            queue: WaitQueue::new(),
        }
    }

    pub fn signal(&self) {
        self.done.store(true, Ordering::Release);
        self.queue.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.done.store(false, Ordering::Release);
    }

    /// Returns false on timeout
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.queue.wait_until(|| self.is_signaled(), timeout)
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
