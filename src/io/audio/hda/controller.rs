// ============================================================================
// src/io/audio/hda/controller.rs - HDA Controller Implementation
// ============================================================================
//!
//! Intel HD Audio コントローラの実装。
//!
//! - コントローラ初期化（リセット / CORB・RIRB / ストリームプール）
//! - コーデックテーブル
//! - 割り込みスレッドの起動と停止
//! - 依存順序に従ったシャットダウン
//!
//! ## シャットダウン順序
//! 1. 新規クライアント要求の受付停止
//! 2. すべてのアクティブストリームを停止してプールへ返却
//! 3. 各コーデックにシャットダウンを指示し、完了を待って解放
//! 4. 割り込みスレッドを停止（コーデックの後始末は CORB/RIRB の進行に依存）
//! 5. リングバッファとストリームの DMA を停止

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, error, info, warn};
use spin::Mutex;

use crate::config::ControllerConfig;
use crate::error::{HdaError, HdaResult};
use crate::ipc::{DispatchRuntime, Endpoint};
use crate::sync::WaitQueue;

use super::bus::{HdaBus, InterruptLine};
use super::codec::{Codec, CodecState};
use super::corb_rirb::RingEngine;
use super::device::{DeviceHost, LifecycleEvent};
use super::regs::*;
use super::stats::{ControllerStats, StatsSnapshot};
use super::stream::{DmaStream, StreamType};
use super::stream_pool::StreamPool;
use super::types::CodecCmdJob;

/// Delay after leaving reset before codecs report presence (521us minimum)
const CODEC_WAKE_DELAY_US: u64 = 1000;

// ============================================================================
// Capabilities
// ============================================================================

/// Values read from GCAP / VMAJ / VMIN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerCaps {
    pub gcap: u16,
    pub version_major: u8,
    pub version_minor: u8,
    pub input_streams: u32,
    pub output_streams: u32,
    pub bidir_streams: u32,
    pub addr_64bit: bool,
}

impl ControllerCaps {
    pub fn from_gcap(gcap: u16, version_major: u8, version_minor: u8) -> Self {
        Self {
            gcap,
            version_major,
            version_minor,
            input_streams: ((gcap >> GCAP_ISS_SHIFT) & GCAP_ISS_MASK) as u32,
            output_streams: ((gcap >> GCAP_OSS_SHIFT) & GCAP_OSS_MASK) as u32,
            bidir_streams: ((gcap >> GCAP_BSS_SHIFT) & GCAP_BSS_MASK) as u32,
            addr_64bit: gcap & GCAP_64OK != 0,
        }
    }

    pub fn total_streams(&self) -> u32 {
        self.input_streams + self.output_streams + self.bidir_streams
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Operating,
    ShuttingDown,
    ShutDown,
}

// ============================================================================
// HDA Controller
// ============================================================================

/// Intel HD Audio Controller
pub struct HdaController {
    config: ControllerConfig,
    bus: Arc<dyn HdaBus>,
    runtime: Arc<DispatchRuntime>,
    device_host: Arc<dyn DeviceHost>,
    caps: ControllerCaps,
    engine: RingEngine,
    pool: StreamPool,
    codecs: Mutex<[Option<Arc<Codec>>; MAX_CODECS]>,
    state: Mutex<ControllerState>,
    irq_line: InterruptLine,
    irq_thread: Mutex<Option<JoinHandle<()>>>,
    /// Notified at the end of every interrupt pass
    progress: WaitQueue,
    stats: Arc<ControllerStats>,
}

impl HdaController {
    /// Bring the controller up and start its interrupt thread
    ///
    /// Codecs already reporting presence are picked up by the first
    /// interrupt pass, exactly like a later change-status interrupt.
    pub fn new(
        bus: Arc<dyn HdaBus>,
        runtime: Arc<DispatchRuntime>,
        device_host: Arc<dyn DeviceHost>,
        config: ControllerConfig,
    ) -> HdaResult<Arc<Self>> {
        info!("[HDA] {}: initializing Intel HD Audio controller", config.name);

        let caps = read_capabilities(&*bus);
        reset_controller(&*bus, config.reset_timeout)?;

        let stats = Arc::new(ControllerStats::new());
        let engine = RingEngine::new(
            bus.clone(),
            config.max_corb_entries,
            config.max_rirb_entries,
            config.reserved_response_slots,
            stats.clone(),
        )?;
        engine.setup().map_err(|e| match e {
            HdaError::InitFailed(_) => e,
            other => HdaError::InitFailed(alloc::format!("CORB/RIRB setup: {}", other)),
        })?;

        let pool = build_stream_pool(&bus, &caps);

        let (irq_line, irq_rx) = InterruptLine::new();
        bus.attach_interrupt(irq_line.clone());

        bus.write16(REG_WAKEEN, STATESTS_MASK);
        let gctl = Gctl::from_bits_retain(bus.read32(REG_GCTL));
        bus.write32(REG_GCTL, (gctl | Gctl::UNSOL).bits());
        bus.write32(REG_INTCTL, (IntCtl::GIE | IntCtl::CIE).bits());

        let controller = Arc::new(Self {
            config,
            bus,
            runtime,
            device_host,
            caps,
            engine,
            pool,
            codecs: Mutex::new(Default::default()),
            state: Mutex::new(ControllerState::Operating),
            irq_line,
            irq_thread: Mutex::new(None),
            progress: WaitQueue::new(),
            stats,
        });

        let thread_ctrl = Arc::clone(&controller);
        let handle = std::thread::Builder::new()
            .name(alloc::format!("{}-irq", controller.config.name))
            .spawn(move || super::irq::run(thread_ctrl, irq_rx))
            .map_err(|e| {
                controller.engine.shutdown();
                HdaError::InitFailed(alloc::format!("IRQ thread: {}", e))
            })?;
        *controller.irq_thread.lock() = Some(handle);

        controller.irq_line.wake();
        info!("[HDA] {}: controller initialized", controller.config.name);
        Ok(controller)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn caps(&self) -> ControllerCaps {
        self.caps
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    /// New client requests are only accepted while operating
    pub fn is_accepting(&self) -> bool {
        self.state() == ControllerState::Operating
    }

    pub fn runtime(&self) -> &Arc<DispatchRuntime> {
        &self.runtime
    }

    pub fn device_host(&self) -> &Arc<dyn DeviceHost> {
        &self.device_host
    }

    pub(super) fn bus(&self) -> &dyn HdaBus {
        &*self.bus
    }

    pub fn ring_engine(&self) -> &RingEngine {
        &self.engine
    }

    pub fn stream_pool(&self) -> &StreamPool {
        &self.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(super) fn stats_ref(&self) -> &ControllerStats {
        &self.stats
    }

    // ========================================================================
    // Codec table
    // ========================================================================

    pub fn codec(&self, addr: u8) -> Option<Arc<Codec>> {
        self.codecs.lock().get(addr as usize).cloned().flatten()
    }

    /// Addresses with a live codec object
    pub fn codec_addresses(&self) -> Vec<u8> {
        self.codecs
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(addr, _)| addr as u8)
            .collect()
    }

    /// Open the single client connection of a codec
    pub fn codec_channel(&self, addr: u8) -> HdaResult<Endpoint> {
        if !self.is_accepting() {
            return Err(HdaError::BadState);
        }
        self.codec(addr).ok_or(HdaError::NotFound)?.get_channel()
    }

    /// Block until a codec at `addr` reaches `Operating`
    pub fn wait_for_codec(&self, addr: u8, timeout: Duration) -> HdaResult<Arc<Codec>> {
        let ready = self.wait_for_progress(
            || self.codec(addr).is_some_and(|c| c.state() == CodecState::Operating),
            Some(timeout),
        );
        if !ready {
            return Err(HdaError::Timeout);
        }
        self.codec(addr).ok_or(HdaError::NotFound)
    }

    /// Wait until `cond` holds, re-checked after each interrupt pass
    pub fn wait_for_progress<F>(&self, cond: F, timeout: Option<Duration>) -> bool
    where
        F: FnMut() -> bool,
    {
        self.progress.wait_until(cond, timeout)
    }

    pub(super) fn notify_progress(&self) {
        self.progress.notify_all();
    }

    /// Construct codecs for newly present addresses
    pub(super) fn handle_codec_presence(self: &Arc<Self>, statests: u16) {
        if !self.is_accepting() {
            return;
        }
        for addr in 0..MAX_CODECS {
            if statests & (1 << addr) == 0 {
                continue;
            }
            if self.codecs.lock()[addr].is_some() {
                debug!("[HDA] Codec {} already present", addr);
                continue;
            }
            info!("[HDA] Codec found at address {}", addr);
            match Codec::create(addr as u8, self) {
                Ok(codec) => self.codecs.lock()[addr] = Some(codec),
                Err(e) => warn!("[HDA] Codec {}: failed to start probing: {}", addr, e),
            }
        }
    }

    /// Drop a codec that failed; its slot stays empty until the next
    /// change-status event
    pub(super) fn discard_codec(&self, addr: u8) {
        let codec = self.codecs.lock().get_mut(addr as usize).and_then(Option::take);
        if let Some(codec) = codec {
            warn!("[HDA] Codec {}: discarded", addr);
            codec.begin_shutdown();
            self.device_host.on_event(LifecycleEvent::CodecReleased { addr });
        }
    }

    // ========================================================================
    // Services used by codecs
    // ========================================================================

    pub fn queue_command(&self, job: CodecCmdJob) -> HdaResult<()> {
        self.engine.queue_command(job)
    }

    pub fn allocate_stream(&self, input: bool) -> HdaResult<Arc<DmaStream>> {
        if !self.is_accepting() {
            return Err(HdaError::BadState);
        }
        self.pool.allocate_stream(input)
    }

    pub fn return_stream(&self, stream: Arc<DmaStream>) {
        self.pool.return_stream(stream);
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Tear everything down in dependency order; idempotent
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state != ControllerState::Operating {
                return;
            }
            *state = ControllerState::ShuttingDown;
        }
        info!("[HDA] {}: shutting down", self.config.name);

        let codecs: Vec<Arc<Codec>> = self.codecs.lock().iter().flatten().cloned().collect();

        let mut streams = 0;
        for codec in &codecs {
            streams += codec.deactivate_streams();
        }
        debug!("[HDA] {}: deactivated {} streams", self.config.name, streams);

        for codec in &codecs {
            codec.begin_shutdown();
        }
        for codec in &codecs {
            codec.wait_shut_down(None);
            let addr = codec.addr();
            let released = {
                let mut table = self.codecs.lock();
                let slot = &mut table[addr as usize];
                let owned = slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, codec));
                if owned {
                    *slot = None;
                }
                owned
            };
            // A codec discarded by the IRQ thread was already reported
            if released {
                self.device_host.on_event(LifecycleEvent::CodecReleased { addr });
            }
        }

        self.irq_line.exit();
        let handle = self.irq_thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[HDA] {}: IRQ thread panicked", self.config.name);
            }
        }
        self.device_host.on_event(LifecycleEvent::IrqThreadJoined);

        self.bus.write32(REG_INTCTL, 0);
        self.pool.stop_all();
        self.engine.shutdown();
        let gctl = Gctl::from_bits_retain(self.bus.read32(REG_GCTL));
        self.bus.write32(REG_GCTL, (gctl - Gctl::UNSOL).bits());
        self.device_host.on_event(LifecycleEvent::RingBuffersReleased);

        *self.state.lock() = ControllerState::ShutDown;
        info!("[HDA] {}: shut down", self.config.name);
    }
}

impl Drop for HdaController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for HdaController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HdaController")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("caps", &self.caps)
            .finish()
    }
}

// ============================================================================
// Bring-up helpers
// ============================================================================

/// Read controller capabilities from GCAP register
fn read_capabilities(bus: &dyn HdaBus) -> ControllerCaps {
    let caps = ControllerCaps::from_gcap(bus.read16(REG_GCAP), bus.read8(REG_VMAJ), bus.read8(REG_VMIN));
    info!(
        "[HDA] Version: {}.{}, Streams: {} in, {} out, {} bidir{}",
        caps.version_major,
        caps.version_minor,
        caps.input_streams,
        caps.output_streams,
        caps.bidir_streams,
        if caps.addr_64bit { ", 64-bit" } else { "" }
    );
    caps
}

/// Clear then set GCTL.CRST, each phase bounded by `timeout`
fn reset_controller(bus: &dyn HdaBus, timeout: Duration) -> HdaResult<()> {
    debug!("[HDA] Resetting controller...");

    // Enter reset
    let gctl = Gctl::from_bits_retain(bus.read32(REG_GCTL));
    bus.write32(REG_GCTL, (gctl - Gctl::CRST).bits());
    wait_crst(bus, false, timeout)
        .map_err(|_| HdaError::InitFailed(String::from("controller did not enter reset")))?;

    bus.delay_us(100);

    // Leave reset
    let gctl = Gctl::from_bits_retain(bus.read32(REG_GCTL));
    bus.write32(REG_GCTL, (gctl | Gctl::CRST).bits());
    wait_crst(bus, true, timeout)
        .map_err(|_| HdaError::InitFailed(String::from("controller did not leave reset")))?;

    bus.delay_us(CODEC_WAKE_DELAY_US);
    debug!("[HDA] Controller reset complete");
    Ok(())
}

fn wait_crst(bus: &dyn HdaBus, set: bool, timeout: Duration) -> HdaResult<()> {
    let start = Instant::now();
    loop {
        if (bus.read32(REG_GCTL) & Gctl::CRST.bits() != 0) == set {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(HdaError::Timeout);
        }
        bus.delay_us(10);
    }
}

/// Inputs first, then outputs, then bidirectional; ids are 1-based
fn build_stream_pool(bus: &Arc<dyn HdaBus>, caps: &ControllerCaps) -> StreamPool {
    let intctl_lock = Arc::new(Mutex::new(()));
    let mut streams = Vec::new();
    let mut index = 0u32;

    for (count, ty) in [
        (caps.input_streams, StreamType::Input),
        (caps.output_streams, StreamType::Output),
        (caps.bidir_streams, StreamType::Bidir),
    ] {
        for _ in 0..count {
            if index as usize >= MAX_STREAM_DESCRIPTORS {
                warn!("[HDA] Ignoring stream descriptors beyond {}", MAX_STREAM_DESCRIPTORS);
                break;
            }
            streams.push(Arc::new(DmaStream::new(bus.clone(), index, ty, intctl_lock.clone())));
            index += 1;
        }
    }

    debug!("[HDA] Stream pool: {} descriptors", streams.len());
    StreamPool::new(streams)
}
