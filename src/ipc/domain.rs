//! 実行ドメイン
//!
//! 同一ドメインに属するチャネルのコールバックは決して並行に実行されない。
//! 異なるドメインはワーカープール上で並列に実行される。

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use hashbrown::HashMap;
use log::debug;
use spin::Mutex;

use super::channel::{Channel, ChannelId};
use super::runtime::RuntimeInner;
use crate::error::{HdaError, HdaResult};

/// 実行ドメインID (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(u64);

impl DomainId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for DomainId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ExecutionDomain({})", self.0)
    }
}

struct DomainInner {
    deactivated: bool,
    /// In the run queue or running on a worker
    scheduled: bool,
    ready: VecDeque<Arc<Channel>>,
    /// Active set: the runtime's reference to each bound channel
    channels: HashMap<ChannelId, Arc<Channel>>,
}

/// Serialization boundary for channel callbacks
pub struct ExecutionDomain {
    id: DomainId,
    name: String,
    runtime: Weak<RuntimeInner>,
    inner: Mutex<DomainInner>,
    self_ref: Weak<ExecutionDomain>,
}

impl ExecutionDomain {
    pub(crate) fn new(id: DomainId, name: String, runtime: Weak<RuntimeInner>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            name,
            runtime,
            inner: Mutex::new(DomainInner {
                deactivated: false,
                scheduled: false,
                ready: VecDeque::new(),
                channels: HashMap::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_deactivated(&self) -> bool {
        self.inner.lock().deactivated
    }

    /// Number of channels in the active set
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub(crate) fn add_channel(&self, channel: Arc<Channel>) -> HdaResult<()> {
        let mut inner = self.inner.lock();
        if inner.deactivated {
            return Err(HdaError::BadState);
        }
        inner.channels.insert(channel.id(), channel);
        Ok(())
    }

    pub(crate) fn remove_channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        let mut inner = self.inner.lock();
        inner.ready.retain(|c| c.id() != id);
        inner.channels.remove(&id)
    }

    /// Mark a channel ready and make sure the domain gets a turn
    pub(crate) fn post(&self, channel: Arc<Channel>) {
        let schedule = {
            let mut inner = self.inner.lock();
            if inner.deactivated {
                return;
            }
            inner.ready.push_back(channel);
            if inner.scheduled {
                false
            } else {
                inner.scheduled = true;
                true
            }
        };

        if schedule {
            self.schedule_self();
        }
    }

    fn schedule_self(&self) {
        let scheduled = match (self.runtime.upgrade(), self.self_ref.upgrade()) {
            (Some(rt), Some(me)) => rt.schedule(me),
            _ => false,
        };
        if !scheduled {
            let mut inner = self.inner.lock();
            inner.scheduled = false;
            inner.ready.clear();
        }
    }

    /// Run one ready channel; only ever executed by one worker at a time
    pub(crate) fn run_turn(&self) {
        let next = self.inner.lock().ready.pop_front();
        if let Some(channel) = next {
            channel.dispatch();
        }

        let reschedule = {
            let mut inner = self.inner.lock();
            if !inner.ready.is_empty() && !inner.deactivated {
                true
            } else {
                inner.scheduled = false;
                false
            }
        };

        if reschedule {
            self.schedule_self();
        }
    }

    /// Deactivate the domain and every channel bound to it
    ///
    /// Closed callbacks are not invoked. Blocks until no callback of this
    /// domain is running on another thread.
    pub fn deactivate(&self) {
        let channels: Vec<Arc<Channel>> = {
            let mut inner = self.inner.lock();
            if inner.deactivated && inner.channels.is_empty() {
                return;
            }
            inner.deactivated = true;
            inner.ready.clear();
            inner.channels.values().cloned().collect()
        };

        debug!("[IPC] Deactivating {} ({} channels)", self.id, channels.len());
        for channel in channels {
            channel.deactivate();
        }
    }
}
