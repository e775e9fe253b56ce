//! ディスパッチャチャネル
//!
//! 1つの論理接続を表す。読み書きは任意のスレッドから可能だが、
//! process / closed コールバックは所属する実行ドメイン内でのみ呼ばれる。
//!
//! ## ライフサイクル
//! `Idle` → `Active` → `Deactivated`（再アクティブ化は不可）
//!
//! `deactivate()` から戻った後、コールバックは一切呼ばれない。
//! コールバック内からの自己 `deactivate()` はデッドロックせず、
//! コールバック復帰後にランタイムが後処理を完了する。

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use log::trace;
use spin::Mutex;

use super::domain::ExecutionDomain;
use super::transport::{Endpoint, EndpointSignal, Message, SignalSink};
use crate::error::{HdaError, HdaResult};
use crate::sync::WaitQueue;

/// チャネルID (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Called in-domain whenever the channel has something to process
pub type ProcessHandler = Arc<dyn Fn(&Arc<Channel>) -> HdaResult<()> + Send + Sync>;

/// Called in-domain when the runtime tears the channel down on its own
pub type ClosedHandler = Arc<dyn Fn(&Arc<Channel>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Active,
    Deactivated,
}

struct ChannelState {
    phase: Phase,
    domain: Option<Arc<ExecutionDomain>>,
    process: Option<ProcessHandler>,
    closed: Option<ClosedHandler>,
    /// Already posted to the domain's ready queue
    queued: bool,
    in_callback: Option<ThreadId>,
    /// Deactivation requested from inside our own callback; value = notify closed
    deactivate_after_callback: Option<bool>,
}

/// A dispatcher channel bound to one logical connection
pub struct Channel {
    id: ChannelId,
    owner_ctx: u64,
    /// Handle lock
    endpoint: Mutex<Option<Endpoint>>,
    state: Mutex<ChannelState>,
    drained: WaitQueue,
    self_ref: Weak<Channel>,
}

impl Channel {
    /// Create an unbound channel tagged with an opaque owner context
    pub fn new(owner_ctx: u64) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: ChannelId::new(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
            owner_ctx,
            endpoint: Mutex::new(None),
            state: Mutex::new(ChannelState {
                phase: Phase::Idle,
                domain: None,
                process: None,
                closed: None,
                queued: false,
                in_callback: None,
                deactivate_after_callback: None,
            }),
            drained: WaitQueue::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn owner_ctx(&self) -> u64 {
        self.owner_ctx
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().phase == Phase::Active
    }

    /// Bind to an existing endpoint
    pub fn activate(
        self: &Arc<Self>,
        endpoint: Endpoint,
        domain: &Arc<ExecutionDomain>,
        process: ProcessHandler,
        closed: Option<ClosedHandler>,
    ) -> HdaResult<()> {
        {
            let state = self.state.lock();
            match state.phase {
                Phase::Idle => {}
                Phase::Active => return Err(HdaError::AlreadyBound),
                Phase::Deactivated => return Err(HdaError::BadState),
            }
        }

        domain.add_channel(Arc::clone(self))?;

        {
            let mut state = self.state.lock();
            if state.phase != Phase::Idle {
                drop(state);
                domain.remove_channel(self.id);
                return Err(HdaError::AlreadyBound);
            }
            state.phase = Phase::Active;
            state.domain = Some(Arc::clone(domain));
            state.process = Some(process);
            state.closed = closed;
        }

        let sink: Weak<dyn SignalSink> = self.self_ref.clone() as Weak<dyn SignalSink>;
        {
            let mut slot = self.endpoint.lock();
            *slot = Some(endpoint);
            if let Some(ep) = slot.as_ref() {
                ep.set_sink(Some(sink));
            }
        }

        trace!("[IPC] Channel {} activated in {}", self.id.0, domain.id());
        Ok(())
    }

    /// Allocate a fresh transport pair, bind one end and return the peer
    pub fn activate_new(
        self: &Arc<Self>,
        domain: &Arc<ExecutionDomain>,
        process: ProcessHandler,
        closed: Option<ClosedHandler>,
    ) -> HdaResult<Endpoint> {
        let (local, remote) = Endpoint::pair();
        self.activate(local, domain, process, closed)?;
        Ok(remote)
    }

    /// Request another processing pass even without new messages
    pub fn wake(&self) {
        self.on_signal(EndpointSignal::Readable);
    }

    /// Read one message
    pub fn read(&self) -> HdaResult<Message> {
        let slot = self.endpoint.lock();
        slot.as_ref().ok_or(HdaError::BadState)?.read()
    }

    /// Write one message with an optional side-channel capability
    pub fn write(&self, bytes: &[u8], capability: Option<Endpoint>) -> HdaResult<()> {
        let slot = self.endpoint.lock();
        let ep = slot.as_ref().ok_or(HdaError::BadState)?;
        ep.write(Message {
            bytes: bytes.to_vec(),
            capability,
        })
    }

    /// Deactivate; idempotent and safe from any thread
    ///
    /// The closed callback is not invoked for user-initiated deactivation.
    pub fn deactivate(&self) {
        self.deactivate_internal(false);
    }

    fn deactivate_internal(&self, notify_closed: bool) {
        let me = std::thread::current().id();
        let must_finish = {
            let mut state = self.state.lock();
            if state.in_callback == Some(me) {
                if state.phase == Phase::Active {
                    state.phase = Phase::Deactivated;
                    state.deactivate_after_callback = Some(notify_closed);
                }
                return;
            }
            match state.phase {
                Phase::Idle => {
                    state.phase = Phase::Deactivated;
                    false
                }
                Phase::Active => {
                    state.phase = Phase::Deactivated;
                    true
                }
                Phase::Deactivated => false,
            }
        };

        // Wait for a callback running on another thread to return.
        self.drained
            .wait_until(|| self.state.lock().in_callback.is_none(), None);

        if must_finish {
            self.finish_deactivate(notify_closed);
        }
    }

    /// Drop the transport, leave the active set, optionally report closure
    fn finish_deactivate(&self, notify_closed: bool) {
        let (domain, closed) = {
            let mut state = self.state.lock();
            state.process = None;
            state.queued = false;
            (state.domain.take(), state.closed.take())
        };

        let endpoint = self.endpoint.lock().take();
        if let Some(ep) = endpoint {
            ep.set_sink(None);
            drop(ep);
        }

        if let Some(domain) = domain.as_ref() {
            domain.remove_channel(self.id);
        }

        if notify_closed {
            if let (Some(cb), Some(me)) = (closed, self.self_ref.upgrade()) {
                cb(&me);
            }
        }

        trace!("[IPC] Channel {} deactivated", self.id.0);
    }

    /// Invoked by the owning domain's worker turn
    pub(crate) fn dispatch(&self) {
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };

        let process = {
            let mut state = self.state.lock();
            state.queued = false;
            if state.phase != Phase::Active {
                return;
            }
            state.in_callback = Some(std::thread::current().id());
            state.process.clone()
        };

        let peer_gone = {
            let slot = self.endpoint.lock();
            match slot.as_ref() {
                Some(ep) => ep.pending() == 0 && ep.is_peer_closed(),
                None => true,
            }
        };

        let result = match process {
            Some(_) if peer_gone => Err(HdaError::PeerClosed),
            Some(cb) => cb(&me),
            None => Ok(()),
        };

        let teardown = {
            let mut state = self.state.lock();
            let action = if let Some(notify) = state.deactivate_after_callback.take() {
                Some(notify)
            } else if result.is_err() && state.phase == Phase::Active {
                state.phase = Phase::Deactivated;
                Some(true)
            } else {
                None
            };
            if action.is_none() {
                state.in_callback = None;
            }
            action
        };

        if let Some(notify_closed) = teardown {
            if let Err(e) = &result {
                trace!("[IPC] Channel {} closing: {}", self.id.0, e);
            }
            // in_callback stays set so concurrent deactivators wait for the
            // closed callback as well.
            self.finish_deactivate(notify_closed);
            self.state.lock().in_callback = None;
            self.drained.notify_all();
            return;
        }

        self.drained.notify_all();

        let more = {
            let slot = self.endpoint.lock();
            slot.as_ref()
                .is_some_and(|ep| ep.pending() > 0 || ep.is_peer_closed())
        };
        if more {
            self.on_signal(EndpointSignal::Readable);
        }
    }
}

impl SignalSink for Channel {
    fn on_signal(&self, _signal: EndpointSignal) {
        let domain = {
            let mut state = self.state.lock();
            if state.phase != Phase::Active || state.queued {
                return;
            }
            state.queued = true;
            state.domain.clone()
        };

        match (domain, self.self_ref.upgrade()) {
            (Some(domain), Some(me)) => domain.post(me),
            _ => self.state.lock().queued = false,
        }
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("owner_ctx", &self.owner_ctx)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Collect every message currently readable on a channel
pub fn drain_messages(channel: &Channel) -> HdaResult<Vec<Message>> {
    let mut out = Vec::new();
    loop {
        match channel.read() {
            Ok(msg) => out.push(msg),
            Err(HdaError::ShouldWait) => return Ok(out),
            Err(e) if out.is_empty() => return Err(e),
            Err(_) => return Ok(out),
        }
    }
}
