// ============================================================================
// src/io/audio/hda/corb_rirb.rs - Codec Command Ring-Buffer Engine
// ============================================================================
//!
//! # CORB/RIRB エンジン
//!
//! コマンド送信リング (CORB) とレスポンス受信リング (RIRB) の管理。
//!
//! ## ポインタ規約
//! 書き込みポインタ / 読み込みポインタは常に「最後に処理したスロット」を指す。
//! 次に使うスロットは `(ptr + 1) & mask`。
//!
//! ## ジョブキュー
//! - `pending` - リングに空きがなく未送信のジョブ
//! - `in_flight` - ハードウェアへ送信済みでレスポンス待ちのジョブ
//!
//! 応答はリング順に返るため、要求応答は `in_flight` の先頭と対応する。
//!
//! ## ロック順序
//! RIRB ロック → CORB ロック（スナップショットが補充より先）

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{Ordering, fence};

use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::error::{FatalKind, HdaError, HdaResult};

use super::bus::{DmaBuffer, HdaBus};
use super::regs::*;
use super::stats::ControllerStats;
use super::types::{CodecCmdJob, CodecResponse};

// ============================================================================
// Ring sizing
// ============================================================================

/// Pick the largest size advertised in a CORBSIZE/RIRBSIZE register that
/// does not exceed `max_entries`
///
/// Returns `(entry_count, size_select)`. Falls back to the smallest advertised
/// size when every advertised size is larger than the cap.
pub fn select_ring_size(size_reg: u8, max_entries: u16) -> (u16, u8) {
    let caps = (size_reg >> RINGSIZE_SZCAP_SHIFT) & 0x0F;
    let options = [
        (RINGSIZE_SZCAP_256, 256u16, RINGSIZE_256),
        (RINGSIZE_SZCAP_16, 16, RINGSIZE_16),
        (RINGSIZE_SZCAP_2, 2, RINGSIZE_2),
    ];

    let advertised = || options.iter().filter(|(bit, _, _)| caps & bit != 0);
    if let Some(&(_, entries, sel)) = advertised().find(|(_, entries, _)| *entries <= max_entries) {
        return (entries, sel);
    }
    match advertised().last() {
        Some(&(_, entries, sel)) => (entries, sel),
        None => (2, RINGSIZE_2),
    }
}

// ============================================================================
// Ring state
// ============================================================================

/// Host-side state of the outbound ring
struct CommandRing {
    buffer: DmaBuffer,
    entry_count: u16,
    mask: u16,
    /// Last written slot
    wr_ptr: u16,
    /// Slots that may be filled before the next refill
    space: u16,
    max_in_flight: u16,
    pending: VecDeque<CodecCmdJob>,
    in_flight: VecDeque<CodecCmdJob>,
    running: bool,
}

impl CommandRing {
    /// Write one job at the next slot and move it to `in_flight`
    fn send(&mut self, job: CodecCmdJob) {
        debug_assert!(self.space > 0);
        let next = (self.wr_ptr + 1) & self.mask;
        self.buffer.write_u32(next as usize, job.command.raw());
        self.wr_ptr = next;
        self.space -= 1;
        trace!("[HDA] CORB[{}] <- {}", next, job.command);
        self.in_flight.push_back(job);
    }

    /// Move pending jobs into the ring while there is space
    fn fill_from_pending(&mut self) -> usize {
        let mut moved = 0;
        while self.space > 0 {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            self.send(job);
            moved += 1;
        }
        moved
    }

    /// Recompute space from the hardware read pointer and the in-flight cap
    fn update_space(&mut self, hw_rd_ptr: u16) {
        let hw_used = self.wr_ptr.wrapping_sub(hw_rd_ptr) & self.mask;
        let hw_free = (self.entry_count - 1) - hw_used;
        let flight_free = (self.max_in_flight as usize).saturating_sub(self.in_flight.len()) as u16;
        self.space = hw_free.min(flight_free);
    }
}

/// Host-side state of the inbound ring
struct ResponseRing {
    buffer: DmaBuffer,
    mask: u16,
    /// Last consumed slot
    rd_ptr: u16,
    snapshot: Vec<CodecResponse>,
}

/// One response paired with its job, as produced by [`RingEngine::drain_responses`]
#[derive(Debug)]
pub enum RingResponse {
    Solicited(CodecResponse, CodecCmdJob),
    Unsolicited(CodecResponse),
}

impl RingResponse {
    pub fn response(&self) -> &CodecResponse {
        match self {
            RingResponse::Solicited(resp, _) | RingResponse::Unsolicited(resp) => resp,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// CORB/RIRB engine shared by every codec on one controller
pub struct RingEngine {
    bus: Arc<dyn HdaBus>,
    rirb: Mutex<ResponseRing>,
    corb: Mutex<CommandRing>,
    stats: Arc<ControllerStats>,
}

impl RingEngine {
    /// Size and allocate both rings from the controller's capability bits
    ///
    /// Hardware is not touched beyond reading the size registers; call
    /// [`RingEngine::setup`] to program and start it.
    pub fn new(
        bus: Arc<dyn HdaBus>,
        max_corb_entries: u16,
        max_rirb_entries: u16,
        reserved_response_slots: u16,
        stats: Arc<ControllerStats>,
    ) -> HdaResult<Self> {
        let (corb_entries, _) = select_ring_size(bus.read8(REG_CORBSIZE), max_corb_entries);
        let (rirb_entries, _) = select_ring_size(bus.read8(REG_RIRBSIZE), max_rirb_entries);

        let corb_buf = bus.alloc_dma(corb_entries as usize * CORB_ENTRY_SIZE)?;
        let rirb_buf = bus.alloc_dma(rirb_entries as usize * RIRB_ENTRY_SIZE)?;

        let max_in_flight = corb_entries
            .saturating_sub(reserved_response_slots)
            .min(corb_entries - 1)
            .max(1);

        debug!(
            "[HDA] CORB: {} entries ({} in flight max), RIRB: {} entries",
            corb_entries, max_in_flight, rirb_entries
        );

        Ok(Self {
            bus,
            rirb: Mutex::new(ResponseRing {
                buffer: rirb_buf,
                mask: rirb_entries - 1,
                rd_ptr: 0,
                snapshot: Vec::with_capacity(rirb_entries as usize),
            }),
            corb: Mutex::new(CommandRing {
                buffer: corb_buf,
                entry_count: corb_entries,
                mask: corb_entries - 1,
                wr_ptr: 0,
                space: 0,
                max_in_flight,
                pending: VecDeque::new(),
                in_flight: VecDeque::new(),
                running: false,
            }),
            stats,
        })
    }

    /// Program base addresses and sizes, reset pointers and start both DMA engines
    pub fn setup(&self) -> HdaResult<()> {
        let bus = &*self.bus;
        let mut rirb = self.rirb.lock();
        let mut corb = self.corb.lock();

        // Stop both engines before touching their registers
        bus.write8(REG_CORBCTL, 0);
        bus.write8(REG_RIRBCTL, 0);
        self.wait_reg8(REG_CORBCTL, CorbCtl::CORBRUN.bits(), 0)?;
        self.wait_reg8(REG_RIRBCTL, RirbCtl::DMAEN.bits(), 0)?;

        // CORB
        let corb_addr = corb.buffer.phys_addr();
        bus.write32(REG_CORBLBASE, corb_addr as u32);
        bus.write32(REG_CORBUBASE, (corb_addr >> 32) as u32);
        let (_, corb_sel) = select_ring_size(bus.read8(REG_CORBSIZE), corb.entry_count);
        bus.write8(REG_CORBSIZE, (bus.read8(REG_CORBSIZE) & !RINGSIZE_SIZE_MASK) | corb_sel);

        bus.write16(REG_CORBRP, CORBRP_RST);
        self.wait_reg16(REG_CORBRP, CORBRP_RST, CORBRP_RST)?;
        bus.write16(REG_CORBRP, 0);
        self.wait_reg16(REG_CORBRP, CORBRP_RST, 0)?;
        bus.write16(REG_CORBWP, 0);

        corb.wr_ptr = 0;
        corb.pending.clear();
        corb.in_flight.clear();
        corb.update_space(0);

        // RIRB
        let rirb_addr = rirb.buffer.phys_addr();
        bus.write32(REG_RIRBLBASE, rirb_addr as u32);
        bus.write32(REG_RIRBUBASE, (rirb_addr >> 32) as u32);
        let (_, rirb_sel) = select_ring_size(bus.read8(REG_RIRBSIZE), rirb.mask + 1);
        bus.write8(REG_RIRBSIZE, (bus.read8(REG_RIRBSIZE) & !RINGSIZE_SIZE_MASK) | rirb_sel);
        bus.write16(REG_RIRBWP, RIRBWP_RST);
        bus.write16(REG_RINTCNT, 1);
        rirb.rd_ptr = 0;
        rirb.snapshot.clear();

        // Clear stale status and start
        bus.write8(REG_CORBSTS, CorbSts::CMEI.bits());
        bus.write8(REG_RIRBSTS, (RirbSts::RINTFL | RirbSts::OIS).bits());
        bus.write8(REG_RIRBCTL, (RirbCtl::DMAEN | RirbCtl::RINTCTL | RirbCtl::OIC).bits());
        bus.write8(REG_CORBCTL, (CorbCtl::CORBRUN | CorbCtl::CMEIE).bits());

        if bus.read8(REG_CORBCTL) & CorbCtl::CORBRUN.bits() == 0 {
            return Err(HdaError::InitFailed("CORB DMA failed to start".into()));
        }
        if bus.read8(REG_RIRBCTL) & RirbCtl::DMAEN.bits() == 0 {
            return Err(HdaError::InitFailed("RIRB DMA failed to start".into()));
        }

        corb.running = true;
        debug!("[HDA] CORB/RIRB DMA started");
        Ok(())
    }

    fn wait_reg8(&self, reg: u32, mask: u8, want: u8) -> HdaResult<()> {
        for _ in 0..1000 {
            if self.bus.read8(reg) & mask == want {
                return Ok(());
            }
            self.bus.delay_us(10);
        }
        Err(HdaError::Timeout)
    }

    fn wait_reg16(&self, reg: u32, mask: u16, want: u16) -> HdaResult<()> {
        for _ in 0..1000 {
            if self.bus.read16(reg) & mask == want {
                return Ok(());
            }
            self.bus.delay_us(10);
        }
        Err(HdaError::Timeout)
    }

    // ========================================================================
    // Command side
    // ========================================================================

    /// Queue a command job
    ///
    /// Written straight into the ring when there is space, otherwise kept in
    /// `pending` until a refill makes room.
    ///
    /// Space is recomputed first: completion handlers resubmit between
    /// `drain_responses` and `refill`, after their slot was already freed.
    pub fn queue_command(&self, job: CodecCmdJob) -> HdaResult<()> {
        if !job.command.is_valid() {
            return Err(HdaError::InvalidArgument);
        }

        let mut corb = self.corb.lock();
        if !corb.running {
            return Err(HdaError::BadState);
        }

        let rp = self.bus.read16(REG_CORBRP) & corb.mask;
        corb.update_space(rp);
        let mut moved = corb.fill_from_pending();

        if corb.space == 0 {
            debug_assert!(!corb.in_flight.is_empty());
            trace!("[HDA] CORB full, deferring {}", job.command);
            corb.pending.push_back(job);
            self.stats.record_deferred();
        } else {
            corb.send(job);
            moved += 1;
        }

        for _ in 0..moved {
            self.stats.record_sent();
        }
        if moved > 0 {
            self.commit(&corb);
        }
        Ok(())
    }

    /// Make ring writes visible before publishing the write pointer
    fn commit(&self, corb: &CommandRing) {
        fence(Ordering::Release);
        self.bus.write16(REG_CORBWP, corb.wr_ptr);
    }

    /// Interrupt-tick refill: check the memory error bit, recompute space and
    /// move pending jobs into the ring
    pub fn refill(&self) {
        let mut corb = self.corb.lock();

        let sts = CorbSts::from_bits_truncate(self.bus.read8(REG_CORBSTS));
        if sts.contains(CorbSts::CMEI) {
            self.bus.write8(REG_CORBSTS, CorbSts::CMEI.bits());
            self.stats.record_memory_error();
            error!("[HDA] {}", HdaError::Fatal(FatalKind::CorbMemoryError));
            debug_assert!(false, "CORB memory error");
        }

        if !corb.running {
            return;
        }

        let rp = self.bus.read16(REG_CORBRP) & corb.mask;
        corb.update_space(rp);

        let moved = corb.fill_from_pending();
        for _ in 0..moved {
            self.stats.record_sent();
        }

        if moved > 0 {
            trace!("[HDA] CORB refill moved {} pending jobs", moved);
            self.commit(&corb);
        }
    }

    // ========================================================================
    // Response side
    // ========================================================================

    /// Copy every newly written response into the host snapshot
    ///
    /// Runs first on every interrupt tick. Returns the number copied.
    pub fn snapshot_responses(&self) -> usize {
        let mut rirb = self.rirb.lock();
        let wp = self.bus.read16(REG_RIRBWP) & rirb.mask;

        // Snapshot before looking at the status bits
        fence(Ordering::Acquire);
        let mut count = 0;
        while rirb.rd_ptr != wp {
            let next = (rirb.rd_ptr + 1) & rirb.mask;
            let resp = CodecResponse::from_raw(rirb.buffer.read_u64(next as usize));
            rirb.snapshot.push(resp);
            rirb.rd_ptr = next;
            count += 1;
        }

        let sts = RirbSts::from_bits_truncate(self.bus.read8(REG_RIRBSTS));
        if !sts.is_empty() {
            self.bus.write8(REG_RIRBSTS, sts.bits());
        }
        if sts.contains(RirbSts::OIS) {
            // Dropped responses cannot be recovered; the matching in-flight
            // jobs stay queued and the FIFO pairing is lost from here on.
            self.stats.record_overrun();
            error!("[HDA] {}", HdaError::Fatal(FatalKind::RirbOverrun));
            debug_assert!(false, "RIRB overrun");
        }

        count
    }

    /// Take the snapshot and pair each solicited response with the front of
    /// `in_flight`
    ///
    /// A solicited response with nothing in flight is a protocol violation:
    /// it is logged and dropped.
    pub fn drain_responses(&self) -> Vec<RingResponse> {
        let mut rirb = self.rirb.lock();
        let snapshot = core::mem::take(&mut rirb.snapshot);
        let mut out = Vec::with_capacity(snapshot.len());

        for resp in snapshot {
            if resp.is_unsolicited() {
                self.stats.record_unsolicited();
                out.push(RingResponse::Unsolicited(resp));
                continue;
            }

            let job = self.corb.lock().in_flight.pop_front();
            match job {
                Some(job) => {
                    self.stats.record_solicited();
                    out.push(RingResponse::Solicited(resp, job));
                }
                None => {
                    self.stats.record_dropped();
                    warn!(
                        "[HDA] Solicited response {:#010x} from codec {} with no command in flight, dropping",
                        resp.data,
                        resp.codec_addr()
                    );
                }
            }
        }

        out
    }

    // ========================================================================
    // Teardown / introspection
    // ========================================================================

    /// Stop both DMA engines and discard every queued job
    ///
    /// Returns how many jobs were discarded.
    pub fn shutdown(&self) -> usize {
        let mut rirb = self.rirb.lock();
        let mut corb = self.corb.lock();

        self.bus.write8(REG_CORBCTL, 0);
        self.bus.write8(REG_RIRBCTL, 0);
        corb.running = false;
        corb.space = 0;

        let discarded = corb.pending.len() + corb.in_flight.len();
        corb.pending.clear();
        corb.in_flight.clear();
        rirb.snapshot.clear();

        if discarded > 0 {
            debug!("[HDA] Discarded {} queued codec commands", discarded);
        }
        discarded
    }

    pub fn is_running(&self) -> bool {
        self.corb.lock().running
    }

    pub fn corb_entries(&self) -> u16 {
        self.corb.lock().entry_count
    }

    pub fn rirb_entries(&self) -> u16 {
        self.rirb.lock().mask + 1
    }

    pub fn max_in_flight(&self) -> u16 {
        self.corb.lock().max_in_flight
    }

    pub fn pending_len(&self) -> usize {
        self.corb.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.corb.lock().in_flight.len()
    }

    /// Jobs submitted and not yet completed
    pub fn outstanding(&self) -> usize {
        let corb = self.corb.lock();
        corb.pending.len() + corb.in_flight.len()
    }
}
