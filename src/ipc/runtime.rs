//! ディスパッチランタイム
//!
//! 固定サイズのワーカースレッドプールが、登録された実行ドメインを処理する。
//! ランタイムはプロセス全体で1つを明示的に生成し、ドライバのアンロード時に
//! `shutdown()` で明示的に破棄する（グローバルなシングルトンは持たない）。

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use hashbrown::HashMap;
use log::{debug, info, warn};
use spin::Mutex;

use super::domain::{DomainId, ExecutionDomain};
use crate::config::RuntimeConfig;
use crate::error::{HdaError, HdaResult};

/// Work item on the shared run queue
pub(crate) enum RunItem {
    Domain(Arc<ExecutionDomain>),
    Exit,
}

pub(crate) struct RuntimeInner {
    run_tx: Sender<RunItem>,
    shutting_down: AtomicBool,
}

impl RuntimeInner {
    /// Queue a domain for one processing turn
    pub(crate) fn schedule(&self, domain: Arc<ExecutionDomain>) -> bool {
        if self.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        self.run_tx.send(RunItem::Domain(domain)).is_ok()
    }
}

/// Worker pool shared by every dispatcher channel of a driver instance
pub struct DispatchRuntime {
    inner: Arc<RuntimeInner>,
    domains: Mutex<HashMap<DomainId, Weak<ExecutionDomain>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_domain_id: AtomicU64,
    worker_count: usize,
}

impl DispatchRuntime {
    /// Spawn the worker pool
    pub fn new(config: RuntimeConfig) -> HdaResult<Arc<Self>> {
        let worker_count = config.effective_workers();
        let (run_tx, run_rx) = unbounded::<RunItem>();
        let inner = Arc::new(RuntimeInner {
            run_tx,
            shutting_down: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let rx = run_rx.clone();
            let name = alloc::format!("{}-{}", config.thread_name, i);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(rx))
                .map_err(|e| HdaError::InitFailed(alloc::format!("worker spawn: {}", e)))?;
            workers.push(handle);
        }

        info!("[IPC] Dispatch runtime started with {} workers", worker_count);

        Ok(Arc::new(Self {
            inner,
            domains: Mutex::new(HashMap::new()),
            workers: Mutex::new(workers),
            next_domain_id: AtomicU64::new(1),
            worker_count,
        }))
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Create a new serialization domain
    pub fn create_domain(&self, name: &str) -> HdaResult<Arc<ExecutionDomain>> {
        if self.is_shutting_down() {
            return Err(HdaError::BadState);
        }

        let id = DomainId::new(self.next_domain_id.fetch_add(1, Ordering::Relaxed));
        let domain = ExecutionDomain::new(id, String::from(name), Arc::downgrade(&self.inner));

        let mut domains = self.domains.lock();
        domains.retain(|_, d| d.strong_count() > 0);
        domains.insert(id, Arc::downgrade(&domain));
        debug!("[IPC] Created {} ({})", id, name);
        Ok(domain)
    }

    /// Deactivate every domain, then stop and join the workers
    ///
    /// Must not be called from a worker thread.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let live: Vec<Arc<ExecutionDomain>> = self
            .domains
            .lock()
            .drain()
            .filter_map(|(_, d)| d.upgrade())
            .collect();
        for domain in live {
            domain.deactivate();
        }

        let workers: Vec<JoinHandle<()>> = core::mem::take(&mut *self.workers.lock());
        for _ in 0..workers.len() {
            let _ = self.inner.run_tx.send(RunItem::Exit);
        }
        for handle in workers {
            if handle.join().is_err() {
                warn!("[IPC] Dispatch worker panicked");
            }
        }

        info!("[IPC] Dispatch runtime stopped");
    }
}

impl Drop for DispatchRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<RunItem>) {
    while let Ok(item) = rx.recv() {
        match item {
            RunItem::Domain(domain) => domain.run_turn(),
            RunItem::Exit => break,
        }
    }
}
