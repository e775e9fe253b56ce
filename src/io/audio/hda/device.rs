// ============================================================================
// src/io/audio/hda/device.rs - Device Host Interface
// ============================================================================
//!
//! デバイスノードの公開 / 取り下げを担う外部コラボレータ。
//!
//! コアはコーデックとストリームのノードを `DeviceHost` 経由で公開し、
//! ライフサイクル上の出来事を `LifecycleEvent` として通知する。

use alloc::string::String;

use log::info;

use crate::error::HdaResult;

use super::types::CodecIdentity;

/// What gets published for a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDeviceInfo {
    pub controller: String,
    pub address: u8,
    pub identity: CodecIdentity,
}

impl CodecDeviceInfo {
    pub fn node_name(&self) -> String {
        alloc::format!("{}-codec{:03}", self.controller, self.address)
    }
}

/// What gets published for a client-facing stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDeviceInfo {
    pub driver: String,
    pub stream_id: u32,
    pub input: bool,
}

impl StreamDeviceInfo {
    pub fn node_name(&self) -> String {
        let dir = if self.input { "input" } else { "output" };
        alloc::format!("{}-{}-stream{:03}", self.driver, dir, self.stream_id)
    }
}

/// Lifecycle milestones reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    CodecProbed { addr: u8 },
    CodecFailed { addr: u8 },
    DmaStreamAssigned { codec: u8, stream_id: u16, tag: u8 },
    DmaStreamReleased { codec: u8, stream_id: u16 },
    CodecShutDown { addr: u8 },
    CodecReleased { addr: u8 },
    IrqThreadJoined,
    RingBuffersReleased,
    DriverStreamActivated { stream_id: u32 },
    DriverStreamDeactivated { stream_id: u32 },
}

/// Device model collaborator
pub trait DeviceHost: Send + Sync {
    fn publish_codec(&self, info: &CodecDeviceInfo) -> HdaResult<()>;
    fn unpublish_codec(&self, info: &CodecDeviceInfo);
    fn publish_stream(&self, info: &StreamDeviceInfo) -> HdaResult<()>;
    fn unpublish_stream(&self, info: &StreamDeviceInfo);

    fn on_event(&self, _event: LifecycleEvent) {}
}

/// Host that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDeviceHost;

impl DeviceHost for NullDeviceHost {
    fn publish_codec(&self, info: &CodecDeviceInfo) -> HdaResult<()> {
        info!("[HDA] Publishing {} ({})", info.node_name(), info.identity);
        Ok(())
    }

    fn unpublish_codec(&self, info: &CodecDeviceInfo) {
        info!("[HDA] Unpublishing {}", info.node_name());
    }

    fn publish_stream(&self, info: &StreamDeviceInfo) -> HdaResult<()> {
        info!("[HDA] Publishing {}", info.node_name());
        Ok(())
    }

    fn unpublish_stream(&self, info: &StreamDeviceInfo) {
        info!("[HDA] Unpublishing {}", info.node_name());
    }
}
