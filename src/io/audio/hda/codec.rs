// ============================================================================
// src/io/audio/hda/codec.rs - Codec Lifecycle
// ============================================================================
//!
//! HDA コーデックのライフサイクル管理（コントローラ側）。
//!
//! ## 状態遷移
//! `Probing` → `FindingDriver` → `Operating` → `ShuttingDown` → `ShutDown`
//! いずれの状態からも `FatalError` に遷移しうる（終端）。
//!
//! ## プローブ
//! 1 ステップに 1 コマンドだけを送信し、ステップごとのパーサで応答を解釈する。
//!
//! ## ロック順序
//! クライアントチャネル → アクティブストリーム集合

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use hashbrown::HashMap;
use log::{debug, error, info, trace, warn};
use spin::Mutex;

use crate::error::{FatalKind, HdaError, HdaResult};
use crate::ipc::{Channel, ClosedHandler, Endpoint, ExecutionDomain, ProcessHandler};
use crate::sync::Completion;

use super::controller::HdaController;
use super::device::{CodecDeviceInfo, DeviceHost, LifecycleEvent};
use super::proto::{CodecReply, CodecRequest, RingBufferReply, RingBufferRequest, status_of};
use super::regs::*;
use super::stream::DmaStream;
use super::types::{CodecCmdJob, CodecCommand, CodecIdentity, CodecResponse};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Probing,
    FindingDriver,
    Operating,
    ShuttingDown,
    ShutDown,
    FatalError,
}

/// One probe verb and the parser for its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeStep {
    VendorId,
    RevisionId,
    SubNodeCount,
    FuncGroupType { nid: u8, last: u8 },
}

impl ProbeStep {
    fn command(&self, addr: u8) -> CodecCommand {
        match *self {
            ProbeStep::VendorId => CodecIdentity::probe_command(addr),
            ProbeStep::RevisionId => CodecCommand::get_param(addr, 0, PARAM_REVISION_ID),
            ProbeStep::SubNodeCount => CodecCommand::get_param(addr, 0, PARAM_SUB_NODE_COUNT),
            ProbeStep::FuncGroupType { nid, .. } => CodecCommand::get_param(addr, nid, PARAM_FUNC_GROUP_TYPE),
        }
    }

    /// Parse this step's response, returning the next step if any
    fn parse(&self, data: u32, id: &mut CodecIdentity) -> HdaResult<Option<ProbeStep>> {
        match *self {
            ProbeStep::VendorId => {
                if data == 0 || data == 0xFFFF_FFFF {
                    return Err(HdaError::Fatal(FatalKind::ProtocolViolation));
                }
                id.vendor_id = (data >> 16) as u16;
                id.device_id = data as u16;
                Ok(Some(ProbeStep::RevisionId))
            }
            ProbeStep::RevisionId => {
                id.major_rev = ((data >> 20) & 0x0F) as u8;
                id.minor_rev = ((data >> 16) & 0x0F) as u8;
                id.revision_id = ((data >> 8) & 0xFF) as u8;
                id.stepping_id = (data & 0xFF) as u8;
                Ok(Some(ProbeStep::SubNodeCount))
            }
            ProbeStep::SubNodeCount => {
                let start = ((data >> 16) & 0xFF) as u8;
                let count = (data & 0xFF) as u8;
                id.fg_start = start;
                id.fg_count = count;
                if count == 0 {
                    return Ok(None);
                }
                let last = start as u16 + count as u16 - 1;
                if start == 0 || last >= 0x7F {
                    return Err(HdaError::Fatal(FatalKind::ProtocolViolation));
                }
                Ok(Some(ProbeStep::FuncGroupType {
                    nid: start,
                    last: last as u8,
                }))
            }
            ProbeStep::FuncGroupType { nid, last } => {
                if (data & 0xFF) as u8 == FUNC_GROUP_AUDIO && id.afg_node.is_none() {
                    id.afg_node = Some(nid);
                }
                if nid == last {
                    Ok(None)
                } else {
                    Ok(Some(ProbeStep::FuncGroupType { nid: nid + 1, last }))
                }
            }
        }
    }
}

struct CodecInner {
    state: CodecState,
    identity: CodecIdentity,
    probe: Option<ProbeStep>,
    device_info: Option<CodecDeviceInfo>,
    shutdown_started: bool,
}

/// A DMA stream granted to this codec's client
struct ActiveDmaStream {
    stream: Arc<DmaStream>,
    ring_buffer: Option<Arc<Channel>>,
}

// ============================================================================
// Codec
// ============================================================================

/// One codec attached to a controller
pub struct Codec {
    addr: u8,
    controller: Weak<HdaController>,
    device_host: Arc<dyn DeviceHost>,
    domain: Arc<ExecutionDomain>,
    inner: Mutex<CodecInner>,
    /// Single client channel; always locked before `active_streams`
    channel: Mutex<Option<Arc<Channel>>>,
    active_streams: Mutex<HashMap<u16, ActiveDmaStream>>,
    shut_down: Completion,
    self_ref: Weak<Codec>,
}

impl Codec {
    /// Construct for a newly present address and issue the first probe verb
    pub(super) fn create(addr: u8, controller: &Arc<HdaController>) -> HdaResult<Arc<Self>> {
        let name = alloc::format!("{}-codec{}", controller.name(), addr);
        let domain = controller.runtime().create_domain(&name)?;

        let codec = Arc::new_cyclic(|self_ref| Self {
            addr,
            controller: Arc::downgrade(controller),
            device_host: controller.device_host().clone(),
            domain,
            inner: Mutex::new(CodecInner {
                state: CodecState::Probing,
                identity: CodecIdentity::default(),
                probe: Some(ProbeStep::VendorId),
                device_info: None,
                shutdown_started: false,
            }),
            channel: Mutex::new(None),
            active_streams: Mutex::new(HashMap::new()),
            shut_down: Completion::new(),
            self_ref: self_ref.clone(),
        });

        debug!("[HDA] Codec {} probing", addr);
        if let Err(e) = controller.queue_command(CodecCmdJob::internal(ProbeStep::VendorId.command(addr))) {
            codec.domain.deactivate();
            return Err(e);
        }
        Ok(codec)
    }

    pub fn addr(&self) -> u8 {
        self.addr
    }

    pub fn state(&self) -> CodecState {
        self.inner.lock().state
    }

    pub fn identity(&self) -> CodecIdentity {
        self.inner.lock().identity
    }

    pub fn active_stream_count(&self) -> usize {
        self.active_streams.lock().len()
    }

    fn fail(&self, err: HdaError) {
        {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                CodecState::ShuttingDown | CodecState::ShutDown | CodecState::FatalError
            ) {
                return;
            }
            inner.state = CodecState::FatalError;
            inner.probe = None;
        }
        error!("[HDA] Codec {}: {}", self.addr, err);
        self.device_host.on_event(LifecycleEvent::CodecFailed { addr: self.addr });
    }

    // ========================================================================
    // Response processing (interrupt thread)
    // ========================================================================

    pub(super) fn process_solicited(&self, resp: CodecResponse, job: CodecCmdJob) {
        if let Some(ch) = job.response_channel {
            let reply = CodecReply::CorbResponse {
                data: resp.data,
                data_ex: resp.data_ex,
            };
            if let Err(e) = ch.write(&reply.encode(job.transaction_id), None) {
                debug!("[HDA] Codec {}: dropping response for txn {}: {}", self.addr, job.transaction_id, e);
            }
            return;
        }

        let step = {
            let inner = self.inner.lock();
            match (inner.state, inner.probe) {
                (CodecState::Probing, Some(step)) => step,
                _ => {
                    trace!("[HDA] Codec {}: response {:#010x} needs no routing", self.addr, resp.data);
                    return;
                }
            }
        };

        let next = {
            let mut inner = self.inner.lock();
            let parsed = step.parse(resp.data, &mut inner.identity);
            if let Ok(next) = parsed {
                inner.probe = next;
            }
            parsed
        };

        match next {
            Ok(Some(next)) => {
                let queued = self
                    .controller
                    .upgrade()
                    .ok_or(HdaError::BadState)
                    .and_then(|c| c.queue_command(CodecCmdJob::internal(next.command(self.addr))));
                if let Err(e) = queued {
                    self.fail(e);
                }
            }
            Ok(None) => self.finish_probe(),
            Err(e) => self.fail(e),
        }
    }

    pub(super) fn process_unsolicited(&self, resp: CodecResponse) {
        match self.state() {
            CodecState::Probing => {
                warn!("[HDA] Codec {}: unsolicited response while probing", self.addr);
                self.fail(HdaError::Fatal(FatalKind::ProtocolViolation));
            }
            CodecState::Operating => {
                let channel = self.channel.lock().clone();
                let Some(ch) = channel else {
                    trace!("[HDA] Codec {}: no client for unsolicited tag {}", self.addr, resp.unsol_tag());
                    return;
                };
                let reply = CodecReply::Unsolicited {
                    data: resp.data,
                    data_ex: resp.data_ex,
                };
                if let Err(e) = ch.write(&reply.encode(0), None) {
                    debug!("[HDA] Codec {}: dropping unsolicited response: {}", self.addr, e);
                }
            }
            _ => {}
        }
    }

    fn finish_probe(&self) {
        let (identity, info) = {
            let mut inner = self.inner.lock();
            inner.state = CodecState::FindingDriver;
            inner.probe = None;
            let Some(controller) = self.controller.upgrade() else {
                return;
            };
            let info = CodecDeviceInfo {
                controller: controller.name().into(),
                address: self.addr,
                identity: inner.identity,
            };
            inner.device_info = Some(info.clone());
            (inner.identity, info)
        };

        info!("[HDA] Codec {}: {}", self.addr, identity);
        if let Some(afg) = identity.afg_node {
            debug!("[HDA] Codec {}: audio function group at node {}", self.addr, afg);
        }

        if let Err(e) = self.device_host.publish_codec(&info) {
            self.inner.lock().device_info = None;
            self.fail(e);
            return;
        }

        {
            let mut inner = self.inner.lock();
            if inner.state != CodecState::FindingDriver {
                return;
            }
            inner.state = CodecState::Operating;
        }
        self.device_host.on_event(LifecycleEvent::CodecProbed { addr: self.addr });
    }

    // ========================================================================
    // Client channel
    // ========================================================================

    /// Create the single client connection
    pub fn get_channel(&self) -> HdaResult<Endpoint> {
        if self.state() != CodecState::Operating {
            return Err(HdaError::BadState);
        }
        let controller = self.controller.upgrade().ok_or(HdaError::BadState)?;
        if !controller.is_accepting() {
            return Err(HdaError::BadState);
        }

        let mut slot = self.channel.lock();
        if slot.as_ref().is_some_and(|ch| ch.is_active()) {
            return Err(HdaError::AlreadyBound);
        }

        let channel = Channel::new(self.addr as u64);
        let weak = self.self_ref.clone();
        let process: ProcessHandler = Arc::new(move |ch: &Arc<Channel>| match weak.upgrade() {
            Some(codec) => codec.process_client_request(ch),
            None => Err(HdaError::BadState),
        });
        let weak = self.self_ref.clone();
        let closed: ClosedHandler = Arc::new(move |ch: &Arc<Channel>| {
            if let Some(codec) = weak.upgrade() {
                codec.on_client_closed(ch);
            }
        });

        let endpoint = channel.activate_new(&self.domain, process, Some(closed))?;
        *slot = Some(channel);
        debug!("[HDA] Codec {}: client connected", self.addr);
        Ok(endpoint)
    }

    fn process_client_request(&self, ch: &Arc<Channel>) -> HdaResult<()> {
        let msg = match ch.read() {
            Ok(msg) => msg,
            Err(HdaError::ShouldWait) => return Ok(()),
            Err(e) => return Err(e),
        };
        let (txn, req) = CodecRequest::decode(&msg.bytes)?;

        let controller = self.controller.upgrade().ok_or(HdaError::BadState)?;
        if !controller.is_accepting() || self.state() != CodecState::Operating {
            return Err(HdaError::BadState);
        }

        trace!("[HDA] Codec {}: request {:?} txn {}", self.addr, req, txn);
        match req {
            CodecRequest::GetIds => {
                let id = self.identity();
                let reply = CodecReply::Ids {
                    vendor_id: id.vendor_id,
                    device_id: id.device_id,
                    major_rev: id.major_rev,
                    minor_rev: id.minor_rev,
                    revision_id: id.revision_id,
                    stepping_id: id.stepping_id,
                };
                ch.write(&reply.encode(txn), None)
            }
            CodecRequest::SendCorbCmd { nid, verb, no_ack } => {
                if nid >= 0x7F || verb > 0xF_FFFF {
                    return Err(HdaError::InvalidArgument);
                }
                let command = CodecCommand::new(self.addr, nid as u8, verb);
                let target = if no_ack { None } else { Some(Arc::clone(ch)) };
                controller.queue_command(CodecCmdJob::new(command, target, txn))
            }
            CodecRequest::RequestStream { input } => match controller.allocate_stream(input) {
                Ok(stream) => {
                    let (stream_id, tag) = (stream.id(), stream.tag());
                    self.active_streams.lock().insert(
                        stream_id,
                        ActiveDmaStream {
                            stream,
                            ring_buffer: None,
                        },
                    );
                    self.device_host.on_event(LifecycleEvent::DmaStreamAssigned {
                        codec: self.addr,
                        stream_id,
                        tag,
                    });
                    ch.write(&CodecReply::Stream { stream_id, tag }.encode(txn), None)
                }
                Err(e) if e.is_exhausted() => ch.write(&CodecReply::error(&e).encode(txn), None),
                Err(e) => Err(e),
            },
            CodecRequest::ReleaseStream { stream_id } => {
                self.release_stream(&controller, stream_id)?;
                ch.write(&CodecReply::StreamReleased.encode(txn), None)
            }
            CodecRequest::SetStreamFormat { stream_id, format } => {
                let endpoint = self.set_stream_format(stream_id, format)?;
                ch.write(&CodecReply::FormatSet.encode(txn), Some(endpoint))
            }
        }
    }

    /// Client went away on its own: give back everything it held
    fn on_client_closed(&self, ch: &Arc<Channel>) {
        {
            let mut slot = self.channel.lock();
            if slot.as_ref().is_some_and(|c| c.id() == ch.id()) {
                *slot = None;
            }
        }
        let released = self.deactivate_streams();
        debug!("[HDA] Codec {}: client closed, released {} streams", self.addr, released);
    }

    // ========================================================================
    // DMA streams
    // ========================================================================

    fn release_stream(&self, controller: &HdaController, stream_id: u16) -> HdaResult<()> {
        let active = self
            .active_streams
            .lock()
            .remove(&stream_id)
            .ok_or(HdaError::NotFound)?;
        self.retire_stream(controller, active);
        Ok(())
    }

    /// Ring buffer closed, stream stopped and back in the pool
    fn retire_stream(&self, controller: &HdaController, active: ActiveDmaStream) {
        if let Some(rb) = active.ring_buffer {
            rb.deactivate();
        }
        let stream_id = active.stream.id();
        active.stream.stop();
        controller.return_stream(active.stream);
        self.device_host.on_event(LifecycleEvent::DmaStreamReleased {
            codec: self.addr,
            stream_id,
        });
    }

    fn set_stream_format(&self, stream_id: u16, format: u16) -> HdaResult<Endpoint> {
        let (stream, old_rb) = {
            let mut active = self.active_streams.lock();
            let entry = active.get_mut(&stream_id).ok_or(HdaError::NotFound)?;
            (Arc::clone(&entry.stream), entry.ring_buffer.take())
        };
        if let Some(rb) = old_rb {
            rb.deactivate();
        }

        stream.reset()?;
        stream.set_format(format)?;

        let rb = Channel::new(stream_id as u64);
        let rb_stream = Arc::clone(&stream);
        let process: ProcessHandler =
            Arc::new(move |ch: &Arc<Channel>| process_ring_buffer_request(ch, &rb_stream));
        let endpoint = rb.activate_new(&self.domain, process, None)?;

        let mut active = self.active_streams.lock();
        match active.get_mut(&stream_id) {
            Some(entry) => {
                entry.ring_buffer = Some(rb);
                debug!("[HDA] Codec {}: stream {} format {:#06x}", self.addr, stream_id, format);
                Ok(endpoint)
            }
            None => {
                drop(active);
                rb.deactivate();
                Err(HdaError::BadState)
            }
        }
    }

    /// Close ring buffers and return every granted DMA stream
    pub(super) fn deactivate_streams(&self) -> usize {
        let drained: Vec<ActiveDmaStream> = {
            let _channel = self.channel.lock();
            self.active_streams.lock().drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        match self.controller.upgrade() {
            Some(controller) => {
                for active in drained {
                    self.retire_stream(&controller, active);
                }
            }
            None => {
                for active in drained {
                    if let Some(rb) = active.ring_buffer {
                        rb.deactivate();
                    }
                    active.stream.stop();
                }
            }
        }
        count
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close the client channel, return streams and unpublish
    pub(super) fn begin_shutdown(&self) {
        let info = {
            let mut inner = self.inner.lock();
            if inner.shutdown_started {
                return;
            }
            inner.shutdown_started = true;
            if inner.state != CodecState::FatalError {
                inner.state = CodecState::ShuttingDown;
            }
            inner.probe = None;
            inner.device_info.take()
        };

        let channel = self.channel.lock().take();
        if let Some(ch) = channel {
            ch.deactivate();
        }
        self.domain.deactivate();
        self.deactivate_streams();

        if let Some(info) = info {
            self.device_host.unpublish_codec(&info);
        }

        {
            let mut inner = self.inner.lock();
            if inner.state == CodecState::ShuttingDown {
                inner.state = CodecState::ShutDown;
            }
        }
        self.device_host.on_event(LifecycleEvent::CodecShutDown { addr: self.addr });
        debug!("[HDA] Codec {} shut down", self.addr);
        self.shut_down.signal();
    }

    /// Block until [`Codec::begin_shutdown`] has finished
    pub(super) fn wait_shut_down(&self, timeout: Option<Duration>) -> bool {
        self.shut_down.wait(timeout)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Ring-buffer side channel: one request per callback
fn process_ring_buffer_request(ch: &Arc<Channel>, stream: &DmaStream) -> HdaResult<()> {
    let msg = match ch.read() {
        Ok(msg) => msg,
        Err(HdaError::ShouldWait) => return Ok(()),
        Err(e) => return Err(e),
    };
    let (txn, req) = RingBufferRequest::decode(&msg.bytes)?;

    let reply = match req {
        RingBufferRequest::GetFifoDepth => RingBufferReply::FifoDepth {
            bytes: stream.fifo_depth() as u32,
        },
        RingBufferRequest::Start => match stream.start() {
            Ok(()) => RingBufferReply::Started,
            Err(e) => RingBufferReply::Error { status: status_of(&e) },
        },
        RingBufferRequest::Stop => {
            stream.stop();
            RingBufferReply::Stopped
        }
        RingBufferRequest::GetPosition => RingBufferReply::Position {
            position: stream.position(),
        },
    };
    ch.write(&reply.encode(txn), None)
}
