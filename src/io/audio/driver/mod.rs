// ============================================================================
// src/io/audio/driver/mod.rs - Client Codec Driver Framework
// ============================================================================
//!
//! # コーデックドライバフレームワーク
//!
//! コントローラが公開するコーデックチャネルに接続し、クライアント側から
//! コーデックとストリームを操作する。
//!
//! ## トランザクションID
//! - `0` : 非要求応答の通知
//! - `1..DRIVER_TXN_BASE` : ストリームID（ストリーム宛ての応答）
//! - `DRIVER_TXN_BASE..` : ドライバ自身の同期要求
//!
//! ## ロック順序
//! コマンドチャネル → ストリーム → 非要求タグ
//!
//! アクティブストリーム集合のロックは最後に取り、保持したまま他のロックを取らない。

pub mod stream;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::time::Duration;

use hashbrown::HashMap;
use log::{debug, info, trace, warn};
use spin::Mutex;

use crate::error::{FatalKind, HdaError, HdaResult};
use crate::ipc::{Channel, ClosedHandler, DispatchRuntime, Endpoint, ExecutionDomain, ProcessHandler};
use crate::sync::WaitQueue;

use super::hda::device::{DeviceHost, LifecycleEvent};
use super::hda::proto::{CodecReply, CodecRequest, error_from_status};
use super::hda::types::{CodecIdentity, CodecResponse};

pub use stream::{ConverterHooks, DriverStream, StreamContext, StreamHooks};

/// First transaction id used for driver-level requests
pub const DRIVER_TXN_BASE: u32 = 0x8000_0000;

/// Highest unsolicited response tag (6-bit field)
pub const MAX_UNSOL_TAG: u8 = 63;

// ============================================================================
// Unsolicited tag allocator
// ============================================================================

/// Tags 1..=63, lowest free first, each owned by one stream
#[derive(Debug)]
pub struct UnsolTagAllocator {
    owners: [Option<u32>; MAX_UNSOL_TAG as usize + 1],
}

impl UnsolTagAllocator {
    pub const fn new() -> Self {
        Self {
            owners: [None; MAX_UNSOL_TAG as usize + 1],
        }
    }

    pub fn allocate(&mut self, owner: u32) -> HdaResult<u8> {
        let tag = (1..=MAX_UNSOL_TAG)
            .find(|&t| self.owners[t as usize].is_none())
            .ok_or(HdaError::ResourceExhausted)?;
        self.owners[tag as usize] = Some(owner);
        Ok(tag)
    }

    pub fn release(&mut self, tag: u8) {
        debug_assert!(tag != 0 && tag <= MAX_UNSOL_TAG, "bad unsolicited tag {}", tag);
        if let Some(slot) = self.owners.get_mut(tag as usize) {
            *slot = None;
        }
    }

    pub fn owner(&self, tag: u8) -> Option<u32> {
        self.owners.get(tag as usize).copied().flatten()
    }

    pub fn free_count(&self) -> usize {
        self.owners[1..].iter().filter(|o| o.is_none()).count()
    }
}

impl Default for UnsolTagAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Codec Driver
// ============================================================================

/// Client side of one codec channel
pub struct CodecDriver {
    name: String,
    device_host: Arc<dyn DeviceHost>,
    domain: Arc<ExecutionDomain>,
    /// Shared command channel; always locked before `active_streams`
    channel: Mutex<Option<Arc<Channel>>>,
    active_streams: Mutex<HashMap<u32, Arc<DriverStream>>>,
    unsol_tags: Mutex<UnsolTagAllocator>,
    /// Replies to driver-level requests, keyed by transaction id
    replies: Mutex<HashMap<u32, CodecReply>>,
    next_txn: AtomicU32,
    shutting_down: AtomicBool,
    progress: WaitQueue,
    self_ref: Weak<CodecDriver>,
}

impl CodecDriver {
    /// Bind to a codec channel obtained from the controller
    pub fn bind(
        runtime: &Arc<DispatchRuntime>,
        endpoint: Endpoint,
        device_host: Arc<dyn DeviceHost>,
        name: &str,
    ) -> HdaResult<Arc<Self>> {
        let domain = runtime.create_domain(&alloc::format!("{}-driver", name))?;
        let driver = Arc::new_cyclic(|self_ref| Self {
            name: String::from(name),
            device_host,
            domain,
            channel: Mutex::new(None),
            active_streams: Mutex::new(HashMap::new()),
            unsol_tags: Mutex::new(UnsolTagAllocator::new()),
            replies: Mutex::new(HashMap::new()),
            next_txn: AtomicU32::new(DRIVER_TXN_BASE),
            shutting_down: AtomicBool::new(false),
            progress: WaitQueue::new(),
            self_ref: self_ref.clone(),
        });

        let channel = Channel::new(0);
        let weak = driver.self_ref.clone();
        let process: ProcessHandler = Arc::new(move |ch: &Arc<Channel>| match weak.upgrade() {
            Some(driver) => driver.process_codec_reply(ch),
            None => Err(HdaError::BadState),
        });
        let weak = driver.self_ref.clone();
        let closed: ClosedHandler = Arc::new(move |ch: &Arc<Channel>| {
            if let Some(driver) = weak.upgrade() {
                driver.on_channel_closed(ch);
            }
        });

        {
            let mut slot = driver.channel.lock();
            channel.activate(endpoint, &driver.domain, process, Some(closed))?;
            *slot = Some(channel);
        }
        info!("[HDA] Driver {} bound", name);
        Ok(driver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_host(&self) -> &Arc<dyn DeviceHost> {
        &self.device_host
    }

    pub(crate) fn domain(&self) -> &Arc<ExecutionDomain> {
        &self.domain
    }

    pub fn is_bound(&self) -> bool {
        self.channel.lock().as_ref().is_some_and(|ch| ch.is_active())
    }

    pub fn active_stream_count(&self) -> usize {
        self.active_streams.lock().len()
    }

    pub fn stream(&self, id: u32) -> Option<Arc<DriverStream>> {
        self.active_streams.lock().get(&id).cloned()
    }

    pub(crate) fn is_stream_active(&self, id: u32) -> bool {
        self.active_streams.lock().contains_key(&id)
    }

    /// Wait until `cond` holds, re-checked after each processed reply
    pub fn wait_until<F>(&self, cond: F, timeout: Option<Duration>) -> bool
    where
        F: FnMut() -> bool,
    {
        self.progress.wait_until(cond, timeout)
    }

    // ========================================================================
    // Unsolicited tags
    // ========================================================================

    pub(crate) fn alloc_unsol_tag(&self, stream_id: u32) -> HdaResult<u8> {
        self.unsol_tags.lock().allocate(stream_id)
    }

    pub(crate) fn release_unsol_tag(&self, tag: u8) {
        self.unsol_tags.lock().release(tag);
    }

    pub fn free_unsol_tags(&self) -> usize {
        self.unsol_tags.lock().free_count()
    }

    // ========================================================================
    // Driver-level requests
    // ========================================================================

    fn next_txn(&self) -> u32 {
        let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);
        if txn < DRIVER_TXN_BASE {
            self.next_txn.store(DRIVER_TXN_BASE + 1, Ordering::Relaxed);
            return DRIVER_TXN_BASE;
        }
        txn
    }

    fn request(&self, req: CodecRequest, timeout: Duration) -> HdaResult<CodecReply> {
        let channel = self.channel.lock().clone().ok_or(HdaError::BadState)?;
        let txn = self.next_txn();
        channel.write(&req.encode(txn), None)?;

        self.progress.wait_until(
            || self.replies.lock().contains_key(&txn) || !self.is_bound(),
            Some(timeout),
        );
        let reply = self.replies.lock().remove(&txn);
        match reply {
            Some(CodecReply::Error { status }) => Err(error_from_status(status)),
            Some(reply) => Ok(reply),
            None if !self.is_bound() => Err(HdaError::PeerClosed),
            None => Err(HdaError::Timeout),
        }
    }

    /// Vendor / device id and revision of the bound codec
    pub fn get_ids(&self, timeout: Duration) -> HdaResult<CodecIdentity> {
        match self.request(CodecRequest::GetIds, timeout)? {
            CodecReply::Ids {
                vendor_id,
                device_id,
                major_rev,
                minor_rev,
                revision_id,
                stepping_id,
            } => Ok(CodecIdentity {
                vendor_id,
                device_id,
                major_rev,
                minor_rev,
                revision_id,
                stepping_id,
                ..CodecIdentity::default()
            }),
            other => {
                warn!("[HDA] Driver {}: unexpected reply {:?} to GetIds", self.name, other);
                Err(HdaError::Fatal(FatalKind::ProtocolViolation))
            }
        }
    }

    /// Send one verb and wait for its response
    pub fn send_command(&self, nid: u16, verb: u32, timeout: Duration) -> HdaResult<CodecResponse> {
        let req = CodecRequest::SendCorbCmd {
            nid,
            verb,
            no_ack: false,
        };
        match self.request(req, timeout)? {
            CodecReply::CorbResponse { data, data_ex } => Ok(CodecResponse { data, data_ex }),
            other => {
                warn!("[HDA] Driver {}: unexpected reply {:?} to command", self.name, other);
                Err(HdaError::Fatal(FatalKind::ProtocolViolation))
            }
        }
    }

    /// Send one verb without asking for its response
    pub fn send_command_no_ack(&self, nid: u16, verb: u32) -> HdaResult<()> {
        let channel = self.channel.lock().clone().ok_or(HdaError::BadState)?;
        let req = CodecRequest::SendCorbCmd {
            nid,
            verb,
            no_ack: true,
        };
        channel.write(&req.encode(self.next_txn()), None)
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Add a stream to the active set and start its activation sequence
    pub fn activate_stream(&self, stream: &Arc<DriverStream>) -> HdaResult<()> {
        let id = stream.id();
        if id == 0 || id >= DRIVER_TXN_BASE {
            return Err(HdaError::InvalidArgument);
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(HdaError::BadState);
        }
        let parent = self.self_ref.upgrade().ok_or(HdaError::BadState)?;

        let channel_slot = self.channel.lock();
        let channel = channel_slot.as_ref().cloned().ok_or(HdaError::BadState)?;
        {
            let mut active = self.active_streams.lock();
            if active.contains_key(&id) {
                return Err(HdaError::BadState);
            }
            active.insert(id, Arc::clone(stream));
        }

        if let Err(e) = stream.activate(&parent, channel) {
            self.active_streams.lock().remove(&id);
            return Err(e);
        }
        drop(channel_slot);

        self.device_host.on_event(LifecycleEvent::DriverStreamActivated { stream_id: id });
        debug!("[HDA] Driver {}: stream {} activated", self.name, id);
        Ok(())
    }

    /// Remove a stream from the active set and tear it down
    pub fn deactivate_stream(&self, id: u32) -> HdaResult<()> {
        let stream = {
            let _channel = self.channel.lock();
            self.active_streams.lock().remove(&id)
        }
        .ok_or(HdaError::NotFound)?;

        stream.deactivate();
        self.device_host.on_event(LifecycleEvent::DriverStreamDeactivated { stream_id: id });
        debug!("[HDA] Driver {}: stream {} deactivated", self.name, id);
        Ok(())
    }

    fn deactivate_all_streams(&self) -> usize {
        let streams: Vec<Arc<DriverStream>> = {
            let _channel = self.channel.lock();
            self.active_streams.lock().drain().map(|(_, s)| s).collect()
        };
        let count = streams.len();
        for stream in streams {
            let id = stream.id();
            stream.deactivate();
            self.device_host.on_event(LifecycleEvent::DriverStreamDeactivated { stream_id: id });
        }
        count
    }

    /// Deactivate every stream, then drop the codec channel
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let streams = self.deactivate_all_streams();

        let channel = self.channel.lock().take();
        if let Some(ch) = channel {
            ch.deactivate();
        }
        self.domain.deactivate();
        self.progress.notify_all();
        info!("[HDA] Driver {} shut down ({} streams)", self.name, streams);
    }

    // ========================================================================
    // Reply routing (driver domain)
    // ========================================================================

    fn process_codec_reply(&self, ch: &Arc<Channel>) -> HdaResult<()> {
        let msg = match ch.read() {
            Ok(msg) => msg,
            Err(HdaError::ShouldWait) => return Ok(()),
            Err(e) => return Err(e),
        };
        let (txn, reply) = CodecReply::decode(&msg.bytes)?;
        trace!("[HDA] Driver {}: reply {:?} txn {}", self.name, reply, txn);

        match (txn, reply) {
            (0, CodecReply::Unsolicited { data, data_ex }) => {
                self.route_unsolicited(CodecResponse { data, data_ex });
            }
            (txn, reply) if txn >= DRIVER_TXN_BASE => {
                self.replies.lock().insert(txn, reply);
            }
            (txn, reply) => {
                let unclaimed = match self.stream(txn) {
                    Some(stream) => stream.process_codec_reply(reply, msg.capability),
                    None => Some(reply),
                };
                match unclaimed {
                    Some(CodecReply::Stream { stream_id, .. }) => {
                        self.return_unclaimed_grant(ch, txn, stream_id);
                    }
                    Some(reply) => {
                        debug!("[HDA] Driver {}: {:?} for inactive stream {}", self.name, reply, txn);
                    }
                    None => {}
                }
            }
        }

        self.progress.notify_all();
        Ok(())
    }

    /// A DMA stream was granted after its requester went away
    fn return_unclaimed_grant(&self, ch: &Arc<Channel>, txn: u32, stream_id: u16) {
        debug!(
            "[HDA] Driver {}: returning DMA stream {} granted to inactive stream {}",
            self.name, stream_id, txn
        );
        let req = CodecRequest::ReleaseStream { stream_id };
        if let Err(e) = ch.write(&req.encode(txn), None) {
            debug!("[HDA] Driver {}: DMA stream {} not returned: {}", self.name, stream_id, e);
        }
    }

    fn route_unsolicited(&self, resp: CodecResponse) {
        let tag = resp.unsol_tag();
        let owner = self.unsol_tags.lock().owner(tag);
        match owner.and_then(|id| self.stream(id)) {
            Some(stream) => stream.process_unsolicited(resp),
            None => trace!("[HDA] Driver {}: unsolicited tag {} has no owner", self.name, tag),
        }
    }

    /// The controller closed the codec channel
    fn on_channel_closed(&self, ch: &Arc<Channel>) {
        {
            let mut slot = self.channel.lock();
            if slot.as_ref().is_some_and(|c| c.id() == ch.id()) {
                *slot = None;
            }
        }
        let streams = self.deactivate_all_streams();
        warn!("[HDA] Driver {}: codec channel closed, {} streams dropped", self.name, streams);
        self.progress.notify_all();
    }
}

impl Drop for CodecDriver {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::Acquire) {
            let channel = self.channel.get_mut().take();
            if let Some(ch) = channel {
                ch.deactivate();
            }
            self.domain.deactivate();
        }
    }
}

impl core::fmt::Debug for CodecDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodecDriver")
            .field("name", &self.name)
            .field("streams", &self.active_stream_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsol_tags_lowest_first() {
        let mut tags = UnsolTagAllocator::new();
        assert_eq!(tags.allocate(7), Ok(1));
        assert_eq!(tags.allocate(7), Ok(2));
        assert_eq!(tags.allocate(8), Ok(3));
        assert_eq!(tags.owner(2), Some(7));
        tags.release(2);
        assert_eq!(tags.owner(2), None);
        assert_eq!(tags.allocate(9), Ok(2));
    }

    #[test]
    fn test_unsol_tags_exhausted() {
        let mut tags = UnsolTagAllocator::new();
        for _ in 0..MAX_UNSOL_TAG {
            tags.allocate(1).unwrap();
        }
        assert_eq!(tags.free_count(), 0);
        assert_eq!(tags.allocate(1), Err(HdaError::ResourceExhausted));
        tags.release(MAX_UNSOL_TAG);
        assert_eq!(tags.allocate(1), Ok(MAX_UNSOL_TAG));
    }
}
