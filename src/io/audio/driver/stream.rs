// ============================================================================
// src/io/audio/driver/stream.rs - Driver Stream Lifecycle
// ============================================================================
//!
//! クライアント側ストリーム。
//!
//! ## アクティブ化
//! 親ドライバとコマンドチャネルを記録し、`StreamHooks::on_activate` で
//! セットアップコマンドを発行したのち、ストリームIDをトランザクションIDとして
//! DMA ストリームを要求する。途中で失敗した場合は記録した参照を破棄して戻る。
//!
//! ## 非アクティブ化
//! 1. ロック内: 非要求応答タグを解放し、親参照をクリア（以後の接続を拒否）
//! 2. ロック外: クライアントチャネルを閉じる
//! 3. ロック内: `on_deactivate`、DMA ストリームの返却、デバイスノードの非公開化

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use log::{debug, info, trace, warn};
use spin::Mutex;

use crate::error::{HdaError, HdaResult};
use crate::ipc::{Channel, ClosedHandler, Endpoint, ProcessHandler};

use super::super::hda::device::StreamDeviceInfo;
use super::super::hda::proto::{
    CodecReply, CodecRequest, StreamClientReply, StreamClientRequest, error_from_status, status_of,
};
use super::super::hda::stream::StreamFormat;
use super::super::hda::types::CodecResponse;
use super::super::regs::*;
use super::CodecDriver;

// ============================================================================
// Customization interface
// ============================================================================

/// ストリーム種別ごとのカスタマイズフック
///
/// すべてストリームのロックを保持した状態で呼ばれる。
pub trait StreamHooks: Send {
    /// アクティブ化時のセットアップコマンド発行
    fn on_activate(&mut self, _ctx: &mut StreamContext<'_>) -> HdaResult<()> {
        Ok(())
    }

    /// 非アクティブ化時の後始末
    fn on_deactivate(&mut self) {}

    /// DMA ストリームが割り当てられた
    fn on_dma_assigned(&mut self, _ctx: &mut StreamContext<'_>, _dma_stream_id: u16, _tag: u8) -> HdaResult<()> {
        Ok(())
    }

    /// コントローラ側でフォーマットが設定された（コンバータの設定はここで行う）
    fn on_format_set(&mut self, _ctx: &mut StreamContext<'_>, _format: &StreamFormat, _tag: u8) -> HdaResult<()> {
        Ok(())
    }

    /// 所有タグ宛ての非要求応答
    fn on_unsolicited(&mut self, _ctx: &mut StreamContext<'_>, _resp: CodecResponse) {}

    /// ストリームが送ったコマンドへの応答
    fn on_codec_response(&mut self, _ctx: &mut StreamContext<'_>, _resp: CodecResponse) {}
}

/// What a hook may do while the stream lock is held
pub struct StreamContext<'a> {
    stream_id: u32,
    channel: &'a Arc<Channel>,
    driver: &'a CodecDriver,
    unsol_tags: &'a mut Vec<u8>,
}

impl StreamContext<'_> {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Queue a verb; the response comes back through `on_codec_response`
    pub fn send_command(&mut self, nid: u16, verb: u32) -> HdaResult<()> {
        let req = CodecRequest::SendCorbCmd {
            nid,
            verb,
            no_ack: false,
        };
        self.channel.write(&req.encode(self.stream_id), None)
    }

    pub fn send_command_no_ack(&mut self, nid: u16, verb: u32) -> HdaResult<()> {
        let req = CodecRequest::SendCorbCmd {
            nid,
            verb,
            no_ack: true,
        };
        self.channel.write(&req.encode(self.stream_id), None)
    }

    /// Allocate an unsolicited tag owned by this stream until deactivation
    pub fn alloc_unsol_tag(&mut self) -> HdaResult<u8> {
        let tag = self.driver.alloc_unsol_tag(self.stream_id)?;
        self.unsol_tags.push(tag);
        Ok(tag)
    }
}

// ============================================================================
// Driver Stream
// ============================================================================

/// DMA stream granted by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaAssignment {
    pub stream_id: u16,
    pub tag: u8,
}

#[derive(Debug, Clone, Copy)]
struct PendingFormat {
    client_txn: u32,
    format: StreamFormat,
}

struct StreamInner {
    hooks: Box<dyn StreamHooks>,
    /// Lookup-only; cleared first on deactivation
    parent: Option<Weak<CodecDriver>>,
    channel: Option<Arc<Channel>>,
    dma: Option<DmaAssignment>,
    unsol_tags: Vec<u8>,
    client: Option<Arc<Channel>>,
    pending_format: Option<PendingFormat>,
    format: Option<StreamFormat>,
    device_info: Option<StreamDeviceInfo>,
}

/// One client-facing stream of a codec driver
pub struct DriverStream {
    id: u32,
    input: bool,
    inner: Mutex<StreamInner>,
    self_ref: Weak<DriverStream>,
}

impl DriverStream {
    pub fn new(id: u32, input: bool, hooks: Box<dyn StreamHooks>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            input,
            inner: Mutex::new(StreamInner {
                hooks,
                parent: None,
                channel: None,
                dma: None,
                unsol_tags: Vec::new(),
                client: None,
                pending_format: None,
                format: None,
                device_info: None,
            }),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_input(&self) -> bool {
        self.input
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().parent.is_some()
    }

    pub fn dma_assignment(&self) -> Option<DmaAssignment> {
        self.inner.lock().dma
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.inner.lock().format
    }

    pub fn unsol_tags(&self) -> Vec<u8> {
        self.inner.lock().unsol_tags.clone()
    }

    pub fn has_client(&self) -> bool {
        self.inner.lock().client.as_ref().is_some_and(|c| c.is_active())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub(super) fn activate(&self, parent: &Arc<CodecDriver>, channel: Arc<Channel>) -> HdaResult<()> {
        let mut guard = self.inner.lock();
        if guard.parent.is_some() || !channel.is_active() {
            return Err(HdaError::BadState);
        }
        guard.parent = Some(Arc::downgrade(parent));
        guard.channel = Some(Arc::clone(&channel));

        let inner = &mut *guard;
        let mut ctx = StreamContext {
            stream_id: self.id,
            channel: &channel,
            driver: parent,
            unsol_tags: &mut inner.unsol_tags,
        };
        let result = inner.hooks.on_activate(&mut ctx).and_then(|()| {
            let req = CodecRequest::RequestStream { input: self.input };
            channel.write(&req.encode(self.id), None)
        });

        if let Err(e) = result {
            for tag in inner.unsol_tags.drain(..) {
                parent.release_unsol_tag(tag);
            }
            inner.parent = None;
            inner.channel = None;
            debug!("[HDA] Stream {}: activation failed: {}", self.id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Tear the stream down; a no-op when already inactive
    pub(super) fn deactivate(&self) {
        let parent = self.inner.lock().parent.as_ref().and_then(Weak::upgrade);
        if let Some(p) = parent.as_ref() {
            debug_assert!(!p.is_stream_active(self.id), "stream {} still in the active set", self.id);
        }

        let client = {
            let mut inner = self.inner.lock();
            if inner.parent.take().is_none() {
                return;
            }
            match parent.as_ref() {
                Some(p) => {
                    for tag in inner.unsol_tags.drain(..) {
                        p.release_unsol_tag(tag);
                    }
                }
                None => inner.unsol_tags.clear(),
            }
            inner.pending_format = None;
            inner.client.take()
        };

        if let Some(client) = client {
            client.deactivate();
        }

        let mut inner = self.inner.lock();
        inner.hooks.on_deactivate();
        let channel = inner.channel.take();
        if let (Some(dma), Some(ch)) = (inner.dma.take(), channel) {
            let req = CodecRequest::ReleaseStream {
                stream_id: dma.stream_id,
            };
            if let Err(e) = ch.write(&req.encode(self.id), None) {
                debug!("[HDA] Stream {}: DMA stream {} not returned: {}", self.id, dma.stream_id, e);
            }
        }
        inner.format = None;
        if let (Some(info), Some(p)) = (inner.device_info.take(), parent.as_ref()) {
            p.device_host().unpublish_stream(&info);
        }
    }

    // ========================================================================
    // Client channel
    // ========================================================================

    /// Open the single client connection
    pub fn get_channel(&self) -> HdaResult<Endpoint> {
        let mut inner = self.inner.lock();
        let parent = inner.parent.as_ref().and_then(Weak::upgrade).ok_or(HdaError::BadState)?;
        if inner.client.as_ref().is_some_and(|c| c.is_active()) {
            return Err(HdaError::AlreadyBound);
        }

        let channel = Channel::new(self.id as u64);
        let weak = self.self_ref.clone();
        let process: ProcessHandler = Arc::new(move |ch: &Arc<Channel>| match weak.upgrade() {
            Some(stream) => stream.process_client_request(ch),
            None => Err(HdaError::BadState),
        });
        let weak = self.self_ref.clone();
        let closed: ClosedHandler = Arc::new(move |ch: &Arc<Channel>| {
            if let Some(stream) = weak.upgrade() {
                stream.on_client_closed(ch);
            }
        });

        let endpoint = channel.activate_new(parent.domain(), process, Some(closed))?;
        inner.client = Some(channel);
        Ok(endpoint)
    }

    fn process_client_request(&self, ch: &Arc<Channel>) -> HdaResult<()> {
        let msg = match ch.read() {
            Ok(msg) => msg,
            Err(HdaError::ShouldWait) => return Ok(()),
            Err(e) => return Err(e),
        };
        let (txn, req) = StreamClientRequest::decode(&msg.bytes)?;
        let reply_error = |e: HdaError| {
            ch.write(&StreamClientReply::Error { status: status_of(&e) }.encode(txn), None)
        };

        match req {
            StreamClientRequest::SetFormat {
                sample_rate,
                bits,
                channels,
            } => {
                let format = StreamFormat::new(sample_rate, bits, channels);
                let word = match format.encode() {
                    Ok(word) => word,
                    Err(e) => return reply_error(e),
                };

                let mut inner = self.inner.lock();
                let (Some(channel), Some(dma)) = (inner.channel.clone(), inner.dma) else {
                    drop(inner);
                    return reply_error(HdaError::BadState);
                };
                if inner.pending_format.is_some() {
                    drop(inner);
                    return reply_error(HdaError::BadState);
                }

                let req = CodecRequest::SetStreamFormat {
                    stream_id: dma.stream_id,
                    format: word,
                };
                channel.write(&req.encode(self.id), None)?;
                inner.pending_format = Some(PendingFormat {
                    client_txn: txn,
                    format,
                });
                debug!("[HDA] Stream {}: requesting format {}", self.id, format);
                Ok(())
            }
        }
    }

    fn on_client_closed(&self, ch: &Arc<Channel>) {
        let mut inner = self.inner.lock();
        if inner.client.as_ref().is_some_and(|c| c.id() == ch.id()) {
            inner.client = None;
            inner.pending_format = None;
        }
    }

    // ========================================================================
    // Replies from the codec (driver domain)
    // ========================================================================

    /// Handle one reply addressed to this stream
    ///
    /// Returns the reply when the stream could not take it, so the driver can
    /// give back a DMA grant nobody owns.
    pub(super) fn process_codec_reply(
        &self,
        reply: CodecReply,
        capability: Option<Endpoint>,
    ) -> Option<CodecReply> {
        let mut guard = self.inner.lock();
        let Some(parent) = guard.parent.as_ref().and_then(Weak::upgrade) else {
            trace!("[HDA] Stream {}: reply {:?} after deactivation", self.id, reply);
            return Some(reply);
        };
        let Some(channel) = guard.channel.clone() else {
            return Some(reply);
        };

        let inner = &mut *guard;
        let mut ctx = StreamContext {
            stream_id: self.id,
            channel: &channel,
            driver: &parent,
            unsol_tags: &mut inner.unsol_tags,
        };

        match reply {
            CodecReply::Stream { stream_id, tag } => {
                // Grant answering an earlier activation of the same id
                if inner.dma.is_some() {
                    return Some(CodecReply::Stream { stream_id, tag });
                }
                inner.dma = Some(DmaAssignment { stream_id, tag });
                if let Err(e) = inner.hooks.on_dma_assigned(&mut ctx, stream_id, tag) {
                    warn!("[HDA] Stream {}: DMA setup hook failed: {}", self.id, e);
                }
                let info = StreamDeviceInfo {
                    driver: parent.name().into(),
                    stream_id: self.id,
                    input: self.input,
                };
                match parent.device_host().publish_stream(&info) {
                    Ok(()) => inner.device_info = Some(info),
                    Err(e) => warn!("[HDA] Stream {}: publish failed: {}", self.id, e),
                }
                debug!("[HDA] Stream {}: DMA stream {} tag {}", self.id, stream_id, tag);
            }
            CodecReply::FormatSet => {
                let Some(pending) = inner.pending_format.take() else {
                    warn!("[HDA] Stream {}: unexpected format confirmation", self.id);
                    return None;
                };
                let tag = inner.dma.map_or(0, |d| d.tag);
                let reply = match inner.hooks.on_format_set(&mut ctx, &pending.format, tag) {
                    Ok(()) => {
                        inner.format = Some(pending.format);
                        StreamClientReply::FormatSet
                    }
                    Err(e) => StreamClientReply::Error { status: status_of(&e) },
                };
                let capability = match reply {
                    StreamClientReply::FormatSet => capability,
                    _ => None,
                };
                if let Some(client) = inner.client.as_ref() {
                    if let Err(e) = client.write(&reply.encode(pending.client_txn), capability) {
                        debug!("[HDA] Stream {}: client gone: {}", self.id, e);
                    }
                }
            }
            CodecReply::Error { status } => {
                let err = error_from_status(status);
                if let Some(pending) = inner.pending_format.take() {
                    if let Some(client) = inner.client.as_ref() {
                        let reply = StreamClientReply::Error { status };
                        if let Err(e) = client.write(&reply.encode(pending.client_txn), None) {
                            debug!("[HDA] Stream {}: client gone: {}", self.id, e);
                        }
                    }
                } else if inner.dma.is_none() {
                    warn!("[HDA] Stream {}: no DMA stream granted: {}", self.id, err);
                } else {
                    debug!("[HDA] Stream {}: request failed: {}", self.id, err);
                }
            }
            CodecReply::CorbResponse { data, data_ex } => {
                inner.hooks.on_codec_response(&mut ctx, CodecResponse { data, data_ex });
            }
            CodecReply::StreamReleased => {
                trace!("[HDA] Stream {}: DMA stream released", self.id);
            }
            other => {
                debug!("[HDA] Stream {}: ignoring {:?}", self.id, other);
            }
        }
        None
    }

    pub(super) fn process_unsolicited(&self, resp: CodecResponse) {
        let mut guard = self.inner.lock();
        let (Some(parent), Some(channel)) = (
            guard.parent.as_ref().and_then(Weak::upgrade),
            guard.channel.clone(),
        ) else {
            return;
        };
        let inner = &mut *guard;
        let mut ctx = StreamContext {
            stream_id: self.id,
            channel: &channel,
            driver: &parent,
            unsol_tags: &mut inner.unsol_tags,
        };
        inner.hooks.on_unsolicited(&mut ctx, resp);
    }
}

impl core::fmt::Debug for DriverStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DriverStream")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// Converter hooks
// ============================================================================

/// Hooks for a stream feeding a single converter widget
///
/// Powers the converter up on activation, optionally enables unsolicited
/// responses, and programs the converter format and stream tag once the
/// controller has accepted a format.
#[derive(Debug)]
pub struct ConverterHooks {
    nid: u16,
    unsolicited: bool,
    unsol_tag: Option<u8>,
}

impl ConverterHooks {
    pub fn new(nid: u16) -> Self {
        Self {
            nid,
            unsolicited: false,
            unsol_tag: None,
        }
    }

    pub fn with_unsolicited(mut self) -> Self {
        self.unsolicited = true;
        self
    }

    pub fn unsol_tag(&self) -> Option<u8> {
        self.unsol_tag
    }
}

impl StreamHooks for ConverterHooks {
    fn on_activate(&mut self, ctx: &mut StreamContext<'_>) -> HdaResult<()> {
        ctx.send_command(self.nid, VERB_SET_POWER | POWER_D0 as u32)?;
        if self.unsolicited {
            let tag = ctx.alloc_unsol_tag()?;
            ctx.send_command(self.nid, VERB_SET_UNSOL | UNSOL_ENABLE | tag as u32)?;
            self.unsol_tag = Some(tag);
        }
        Ok(())
    }

    fn on_deactivate(&mut self) {
        self.unsol_tag = None;
    }

    fn on_format_set(&mut self, ctx: &mut StreamContext<'_>, format: &StreamFormat, tag: u8) -> HdaResult<()> {
        ctx.send_command(self.nid, VERB_SET_CONV_FMT | format.encode()? as u32)?;
        ctx.send_command(self.nid, VERB_SET_CONV_STREAM | ((tag as u32) << 4))
    }

    fn on_unsolicited(&mut self, ctx: &mut StreamContext<'_>, resp: CodecResponse) {
        info!(
            "[HDA] Stream {}: unsolicited tag {} data {:#x}",
            ctx.stream_id(),
            resp.unsol_tag(),
            resp.unsol_data()
        );
    }

    fn on_codec_response(&mut self, ctx: &mut StreamContext<'_>, resp: CodecResponse) {
        trace!("[HDA] Stream {}: converter response {:#010x}", ctx.stream_id(), resp.data);
    }
}
