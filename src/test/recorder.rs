// ============================================================================
// src/test/recorder.rs - Recording Device Host
// ============================================================================
//!
//! 公開 / 非公開とライフサイクルイベントを順序付きで記録する `DeviceHost`。
//! シャットダウン順序の検証に使う。

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use spin::Mutex;

use crate::error::{HdaError, HdaResult};
use crate::io::audio::hda::device::{CodecDeviceInfo, DeviceHost, LifecycleEvent, StreamDeviceInfo};
use crate::sync::WaitQueue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Published(String),
    Unpublished(String),
    Event(LifecycleEvent),
}

/// Ordered log of everything the core reported
#[derive(Default)]
pub struct EventRecorder {
    log: Mutex<Vec<Recorded>>,
    reject_publish: AtomicBool,
    changed: WaitQueue,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later publish call fail
    pub fn reject_publish(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::Release);
    }

    fn push(&self, entry: Recorded) {
        self.log.lock().push(entry);
        self.changed.notify_all();
    }

    pub fn entries(&self) -> Vec<Recorded> {
        self.log.lock().clone()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Event(e) => Some(*e),
                _ => None,
            })
            .collect()
    }

    /// Index of the first event matching `pred`
    pub fn position<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&LifecycleEvent) -> bool,
    {
        self.events().iter().position(pred)
    }

    pub fn contains(&self, event: LifecycleEvent) -> bool {
        self.events().contains(&event)
    }

    /// Node names currently published
    pub fn published(&self) -> Vec<String> {
        let mut nodes: Vec<String> = Vec::new();
        for entry in self.log.lock().iter() {
            match entry {
                Recorded::Published(n) => nodes.push(n.clone()),
                Recorded::Unpublished(n) => nodes.retain(|p| p != n),
                Recorded::Event(_) => {}
            }
        }
        nodes
    }

    /// Wait until `event` has been recorded
    pub fn wait_for(&self, event: LifecycleEvent, timeout: Duration) -> bool {
        self.changed.wait_until(|| self.contains(event), Some(timeout))
    }
}

impl DeviceHost for EventRecorder {
    fn publish_codec(&self, info: &CodecDeviceInfo) -> HdaResult<()> {
        if self.reject_publish.load(Ordering::Acquire) {
            return Err(HdaError::NotSupported);
        }
        self.push(Recorded::Published(info.node_name()));
        Ok(())
    }

    fn unpublish_codec(&self, info: &CodecDeviceInfo) {
        self.push(Recorded::Unpublished(info.node_name()));
    }

    fn publish_stream(&self, info: &StreamDeviceInfo) -> HdaResult<()> {
        if self.reject_publish.load(Ordering::Acquire) {
            return Err(HdaError::NotSupported);
        }
        self.push(Recorded::Published(info.node_name()));
        Ok(())
    }

    fn unpublish_stream(&self, info: &StreamDeviceInfo) {
        self.push(Recorded::Unpublished(info.node_name()));
    }

    fn on_event(&self, event: LifecycleEvent) {
        self.push(Recorded::Event(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::audio::hda::types::CodecIdentity;

    #[test]
    fn test_published_tracks_unpublish() {
        let rec = EventRecorder::new();
        let info = CodecDeviceInfo {
            controller: "hda0".into(),
            address: 1,
            identity: CodecIdentity::default(),
        };
        rec.publish_codec(&info).unwrap();
        assert_eq!(rec.published(), vec![String::from("hda0-codec001")]);
        rec.unpublish_codec(&info);
        assert!(rec.published().is_empty());

        rec.reject_publish(true);
        assert_eq!(rec.publish_codec(&info), Err(HdaError::NotSupported));
    }
}
