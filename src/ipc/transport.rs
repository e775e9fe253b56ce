//! 双方向メッセージトランスポート
//!
//! チャネルの下層となるエンドポイント対。どちらの端からも任意のスレッドで
//! 読み書きでき、書き込み・切断はピア側に登録されたシグナル受信者へ通知される。
//! メッセージにはサイドチャネル（別のエンドポイント）を1つ添付できる。

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use spin::Mutex;

use crate::error::{HdaError, HdaResult};

/// エンドポイントID (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// One message: payload bytes plus an optional side-channel capability
pub struct Message {
    pub bytes: Vec<u8>,
    pub capability: Option<Endpoint>,
}

impl Message {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, capability: None }
    }

    pub fn with_capability(bytes: Vec<u8>, capability: Endpoint) -> Self {
        Self {
            bytes,
            capability: Some(capability),
        }
    }
}

/// Signal delivered to whoever watches an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSignal {
    Readable,
    PeerClosed,
}

/// Receiver of endpoint signals (implemented by dispatcher channels)
pub(crate) trait SignalSink: Send + Sync {
    fn on_signal(&self, signal: EndpointSignal);
}

struct PairShared {
    sinks: [Mutex<Option<Weak<dyn SignalSink>>>; 2],
    open: [AtomicBool; 2],
}

impl PairShared {
    fn notify(&self, side: usize, signal: EndpointSignal) {
        let sink = self.sinks[side].lock().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.on_signal(signal);
        }
    }
}

/// One end of a bidirectional transport
pub struct Endpoint {
    id: EndpointId,
    side: usize,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    shared: Arc<PairShared>,
}

impl Endpoint {
    /// Create a connected endpoint pair
    pub fn pair() -> (Endpoint, Endpoint) {
        let (tx_a, rx_b) = unbounded();
        let (tx_b, rx_a) = unbounded();
        let shared = Arc::new(PairShared {
            sinks: [Mutex::new(None), Mutex::new(None)],
            open: [AtomicBool::new(true), AtomicBool::new(true)],
        });

        let a = Endpoint {
            id: EndpointId::new(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)),
            side: 0,
            tx: tx_a,
            rx: rx_a,
            shared: Arc::clone(&shared),
        };
        let b = Endpoint {
            id: EndpointId::new(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)),
            side: 1,
            tx: tx_b,
            rx: rx_b,
            shared,
        };
        (a, b)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    pub fn is_peer_closed(&self) -> bool {
        !self.shared.open[self.peer()].load(Ordering::Acquire)
    }

    /// Messages waiting to be read
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn write(&self, msg: Message) -> HdaResult<()> {
        if self.is_peer_closed() {
            return Err(HdaError::PeerClosed);
        }
        self.tx.send(msg).map_err(|_| HdaError::PeerClosed)?;
        self.shared.notify(self.peer(), EndpointSignal::Readable);
        Ok(())
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> HdaResult<()> {
        self.write(Message::new(bytes.to_vec()))
    }

    /// Non-blocking read
    pub fn read(&self) -> HdaResult<Message> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(msg),
            Err(TryRecvError::Empty) if self.is_peer_closed() => Err(HdaError::PeerClosed),
            Err(TryRecvError::Empty) => Err(HdaError::ShouldWait),
            Err(TryRecvError::Disconnected) => Err(HdaError::PeerClosed),
        }
    }

    /// Blocking read, for client code outside the dispatch runtime
    pub fn read_timeout(&self, timeout: Duration) -> HdaResult<Message> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) if self.is_peer_closed() => Err(HdaError::PeerClosed),
            Err(RecvTimeoutError::Timeout) => Err(HdaError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(HdaError::PeerClosed),
        }
    }

    /// Install (or clear) the signal watcher for this end
    ///
    /// Already-pending state is reported immediately so no edge is missed.
    pub(crate) fn set_sink(&self, sink: Option<Weak<dyn SignalSink>>) {
        let armed = sink.is_some();
        *self.shared.sinks[self.side].lock() = sink;

        if armed {
            if !self.rx.is_empty() {
                self.shared.notify(self.side, EndpointSignal::Readable);
            } else if self.is_peer_closed() {
                self.shared.notify(self.side, EndpointSignal::PeerClosed);
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        *self.shared.sinks[self.side].lock() = None;
        self.shared.open[self.side].store(false, Ordering::Release);
        self.shared.notify(self.peer(), EndpointSignal::PeerClosed);
    }
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("peer_closed", &self.is_peer_closed())
            .finish()
    }
}
