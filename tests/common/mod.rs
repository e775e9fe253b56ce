// ============================================================================
// tests/common/mod.rs - 統合テスト共通ヘルパー
// ============================================================================
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rany_hda::io::audio::hda::device::DeviceHost;
use rany_hda::io::audio::hda::{HdaBus, HdaController};
use rany_hda::ipc::DispatchRuntime;
use rany_hda::sync::WaitQueue;
use rany_hda::test::{EventRecorder, SimCodec, SimHda, SimHdaBuilder};
use rany_hda::{ControllerConfig, HdaResult, RuntimeConfig};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Realtek ALC269 VENDOR_ID parameter
pub const ALC269: u32 = 0x10EC_0269;

/// Simulated controller plus everything the core needs around it
pub struct Rig {
    pub sim: Arc<SimHda>,
    pub runtime: Arc<DispatchRuntime>,
    pub recorder: Arc<EventRecorder>,
    pub controller: Arc<HdaController>,
}

impl Rig {
    /// Bring up a controller over `builder` and wait for every codec in `codecs`
    pub fn start(builder: SimHdaBuilder, codecs: &[u8]) -> Self {
        let sim = builder.build();
        let runtime = runtime();
        let recorder = Arc::new(EventRecorder::new());
        let controller = bring_up(&sim, &runtime, &recorder, ControllerConfig::default()).unwrap();
        for &addr in codecs {
            controller.wait_for_codec(addr, TIMEOUT).unwrap();
        }
        Self {
            sim,
            runtime,
            recorder,
            controller,
        }
    }

    /// One ALC269 at address 0 on a 4-in / 4-out controller
    pub fn with_codec() -> Self {
        Self::start(SimHda::builder().codec(0, SimCodec::new(ALC269)), &[0])
    }

    pub fn host(&self) -> Arc<dyn DeviceHost> {
        self.recorder.clone()
    }

    pub fn teardown(self) {
        self.controller.shutdown();
        self.runtime.shutdown();
    }
}

pub fn runtime() -> Arc<DispatchRuntime> {
    DispatchRuntime::new(RuntimeConfig::default().with_worker_threads(2)).unwrap()
}

pub fn bring_up(
    sim: &Arc<SimHda>,
    runtime: &Arc<DispatchRuntime>,
    recorder: &Arc<EventRecorder>,
    config: ControllerConfig,
) -> HdaResult<Arc<HdaController>> {
    let bus: Arc<dyn HdaBus> = sim.clone();
    let host: Arc<dyn DeviceHost> = recorder.clone();
    HdaController::new(bus, runtime.clone(), host, config)
}

/// Poll `cond` until it holds or about five seconds pass
pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let q = WaitQueue::new();
    for _ in 0..2500 {
        if cond() {
            return true;
        }
        q.wait_until(|| false, Some(Duration::from_millis(2)));
    }
    cond()
}
