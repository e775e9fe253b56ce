// ============================================================================
// src/test/sim_hda.rs - Software HDA Controller Model
// ============================================================================
//!
//! テストとデモ用のソフトウェア HDA コントローラ。
//!
//! `HdaBus` を実装し、次の動作を模倣する:
//! - GCTL.CRST によるリセットと STATESTS によるコーデック検出
//! - CORB の消費と RIRB への応答書き込み（CORBWP 書き込み時に同期実行）
//! - RW1C ステータスレジスタ、SRST / CORBRP リセットのハンドシェイク
//! - 非要求応答、ストリームのバッファ完了、オーバーラン等の注入
//!
//! DMA バッファは `alloc_dma` で確保したものを保持し、
//! プログラムされたベースアドレスで照合する。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;
use log::trace;
use spin::Mutex;

use crate::error::HdaResult;
use crate::io::audio::hda::bus::{DmaBuffer, HdaBus, InterruptLine};
use crate::io::audio::hda::types::{CodecCommand, CodecResponse};
use crate::io::audio::regs::*;

/// Size of the modelled register file
const REG_FILE_SIZE: usize = 0x1000;

/// Default FIFO size reported in SDnFIFOS
const DEFAULT_FIFO_SIZE: u16 = 0x100;

// ============================================================================
// Codec model
// ============================================================================

/// One simulated codec answering GET_PARAM verbs
#[derive(Debug, Clone)]
pub struct SimCodec {
    vendor_id: u32,
    revision_id: u32,
    fg_start: u8,
    function_groups: Vec<u32>,
    overrides: HashMap<(u8, u32), u32>,
    /// Reply to every verb with an unsolicited response instead
    unsolicited_replies: bool,
}

impl SimCodec {
    /// `vendor_id` is the raw VENDOR_ID parameter (vendor << 16 | device)
    pub fn new(vendor_id: u32) -> Self {
        Self {
            vendor_id,
            revision_id: 0x0010_0101,
            fg_start: 1,
            function_groups: vec![FUNC_GROUP_AUDIO as u32],
            overrides: HashMap::new(),
            unsolicited_replies: false,
        }
    }

    pub fn revision(mut self, revision_id: u32) -> Self {
        self.revision_id = revision_id;
        self
    }

    /// Replace the function groups (starting at node 1)
    pub fn function_groups(mut self, types: &[u32]) -> Self {
        self.function_groups = types.to_vec();
        self
    }

    /// Fixed response for an exact (node, verb) pair
    pub fn respond(mut self, nid: u8, verb: u32, data: u32) -> Self {
        self.overrides.insert((nid, verb), data);
        self
    }

    /// Misbehave: answer with unsolicited responses only
    pub fn unsolicited_replies(mut self) -> Self {
        self.unsolicited_replies = true;
        self
    }

    fn execute(&self, addr: u8, cmd: CodecCommand) -> CodecResponse {
        if self.unsolicited_replies {
            return CodecResponse::unsolicited(addr, 1, 0, 0);
        }
        let (nid, verb) = (cmd.node_id(), cmd.verb());
        if let Some(&data) = self.overrides.get(&(nid, verb)) {
            return CodecResponse::solicited(addr, data);
        }

        let data = if verb & 0xF_FF00 == VERB_GET_PARAM {
            let param = (verb & 0xFF) as u8;
            let fg_end = self.fg_start as usize + self.function_groups.len();
            match (nid, param) {
                (0, PARAM_VENDOR_ID) => self.vendor_id,
                (0, PARAM_REVISION_ID) => self.revision_id,
                (0, PARAM_SUB_NODE_COUNT) => ((self.fg_start as u32) << 16) | self.function_groups.len() as u32,
                (n, PARAM_FUNC_GROUP_TYPE) if (self.fg_start as usize..fg_end).contains(&(n as usize)) => {
                    self.function_groups[(n - self.fg_start) as usize]
                }
                _ => 0,
            }
        } else {
            0
        };
        CodecResponse::solicited(addr, data)
    }
}

// ============================================================================
// Controller model
// ============================================================================

/// Injected hardware misbehaviour
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    stuck_in_reset: bool,
    corb_dma_broken: bool,
}

struct SimState {
    regs: Vec<u8>,
    codecs: [Option<SimCodec>; MAX_CODECS],
    buffers: Vec<DmaBuffer>,
    corb_rp: u16,
    rirb_wp: u16,
    hold_commands: bool,
    commands: Vec<CodecCommand>,
    faults: Faults,
    irq: Option<InterruptLine>,
}

impl SimState {
    fn rd8(&self, off: u32) -> u8 {
        self.regs[off as usize]
    }

    fn rd16(&self, off: u32) -> u16 {
        let o = off as usize;
        u16::from_le_bytes([self.regs[o], self.regs[o + 1]])
    }

    fn rd32(&self, off: u32) -> u32 {
        let o = off as usize;
        u32::from_le_bytes([self.regs[o], self.regs[o + 1], self.regs[o + 2], self.regs[o + 3]])
    }

    fn wr8(&mut self, off: u32, v: u8) {
        self.regs[off as usize] = v;
    }

    fn wr16(&mut self, off: u32, v: u16) {
        let o = off as usize;
        self.regs[o..o + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn wr32(&mut self, off: u32, v: u32) {
        let o = off as usize;
        self.regs[o..o + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn present_mask(&self) -> u16 {
        self.codecs
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .fold(0, |m, (i, _)| m | (1 << i))
    }

    fn buffer_at(&self, lbase: u32) -> Option<DmaBuffer> {
        let addr = ((self.rd32(lbase + 4) as u64) << 32) | self.rd32(lbase) as u64;
        self.buffers.iter().find(|b| b.phys_addr() == addr).cloned()
    }

    fn intsts(&self) -> u32 {
        let mut v = 0u32;
        for i in 0..MAX_STREAM_DESCRIPTORS {
            let sts = SdSts::from_bits_truncate(self.rd8(stream_desc_offset(i as u32) + REG_SD_STS));
            if sts.intersects(SdSts::BCIS | SdSts::FIFOE | SdSts::DESE) {
                v |= 1 << i;
            }
        }
        let rirbsts = RirbSts::from_bits_truncate(self.rd8(REG_RIRBSTS));
        let corbsts = CorbSts::from_bits_truncate(self.rd8(REG_CORBSTS));
        if !rirbsts.is_empty() || !corbsts.is_empty() || self.rd16(REG_STATESTS) != 0 {
            v |= IntSts::CIS.bits();
        }
        if v != 0 {
            v |= IntSts::GIS.bits();
        }
        v
    }

    fn interrupts_enabled(&self) -> bool {
        self.rd32(REG_INTCTL) & IntCtl::GIE.bits() != 0
    }

    /// Write one entry into the RIRB; false when the RIRB is not running
    fn push_response(&mut self, resp: CodecResponse) -> bool {
        if self.rd8(REG_RIRBCTL) & RirbCtl::DMAEN.bits() == 0 {
            return false;
        }
        let Some(rirb) = self.buffer_at(REG_RIRBLBASE) else {
            return false;
        };
        let mask = ring_entries(self.rd8(REG_RIRBSIZE)) - 1;
        self.rirb_wp = (self.rirb_wp + 1) & mask;
        rirb.write_u64(self.rirb_wp as usize, resp.raw());
        self.wr16(REG_RIRBWP, self.rirb_wp);
        if self.rd8(REG_RIRBCTL) & RirbCtl::RINTCTL.bits() != 0 {
            let sts = self.rd8(REG_RIRBSTS) | RirbSts::RINTFL.bits();
            self.wr8(REG_RIRBSTS, sts);
        }
        true
    }

    /// Consume every CORB entry up to CORBWP; true when an interrupt is due
    fn consume_commands(&mut self) -> bool {
        if self.rd8(REG_CORBCTL) & CorbCtl::CORBRUN.bits() == 0 {
            return false;
        }
        let Some(corb) = self.buffer_at(REG_CORBLBASE) else {
            return false;
        };
        let mask = ring_entries(self.rd8(REG_CORBSIZE)) - 1;
        let wp = self.rd16(REG_CORBWP) & mask;

        let mut produced = false;
        while self.corb_rp != wp {
            self.corb_rp = (self.corb_rp + 1) & mask;
            let cmd = CodecCommand::from_raw(corb.read_u32(self.corb_rp as usize));
            self.commands.push(cmd);

            let addr = cmd.codec_addr();
            let resp = self.codecs.get(addr as usize).and_then(|c| c.as_ref()).map(|c| c.execute(addr, cmd));
            match resp {
                Some(resp) => produced |= self.push_response(resp),
                None => trace!("[SIM] Command {} to absent codec", cmd),
            }
        }
        self.wr16(REG_CORBRP, self.corb_rp);
        produced && self.interrupts_enabled()
    }

    fn write(&mut self, off: u32, bytes: &[u8]) -> bool {
        let width = bytes.len();
        let value = match width {
            1 => bytes[0] as u32,
            2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
            _ => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        };

        let sd_end = STREAM_DESC_BASE + STREAM_DESC_SIZE * MAX_STREAM_DESCRIPTORS as u32;
        if (STREAM_DESC_BASE..sd_end).contains(&off) {
            self.write_stream_desc(off, value, bytes);
            return false;
        }

        match off {
            REG_GCTL => {
                let old = self.rd32(REG_GCTL);
                let mut new = value;
                if self.faults.stuck_in_reset {
                    new = (new & !Gctl::CRST.bits()) | (old & Gctl::CRST.bits());
                }
                self.wr32(REG_GCTL, new);
                let was_running = old & Gctl::CRST.bits() != 0;
                let running = new & Gctl::CRST.bits() != 0;
                if was_running && !running {
                    self.wr8(REG_CORBCTL, 0);
                    self.wr8(REG_RIRBCTL, 0);
                    self.wr32(REG_INTCTL, 0);
                    self.wr16(REG_STATESTS, 0);
                }
                if !was_running && running {
                    let present = self.present_mask();
                    self.wr16(REG_STATESTS, present);
                }
                false
            }
            REG_STATESTS | REG_CORBSTS | REG_RIRBSTS => {
                // RW1C
                for (i, b) in bytes.iter().enumerate() {
                    let cur = self.rd8(off + i as u32);
                    self.wr8(off + i as u32, cur & !b);
                }
                false
            }
            REG_INTSTS => false,
            REG_CORBSIZE | REG_RIRBSIZE => {
                let caps = self.rd8(off) & !RINGSIZE_SIZE_MASK;
                self.wr8(off, caps | (value as u8 & RINGSIZE_SIZE_MASK));
                false
            }
            REG_CORBCTL => {
                let mut v = value as u8;
                if self.faults.corb_dma_broken {
                    v &= !CorbCtl::CORBRUN.bits();
                }
                self.wr8(REG_CORBCTL, v);
                false
            }
            REG_CORBRP => {
                self.wr16(REG_CORBRP, value as u16);
                if value as u16 & CORBRP_RST != 0 {
                    self.corb_rp = 0;
                }
                false
            }
            REG_RIRBWP => {
                if value as u16 & RIRBWP_RST != 0 {
                    self.rirb_wp = 0;
                    self.wr16(REG_RIRBWP, 0);
                }
                false
            }
            REG_CORBWP => {
                self.wr16(REG_CORBWP, value as u16);
                !self.hold_commands && self.consume_commands()
            }
            _ => {
                let o = off as usize;
                self.regs[o..o + width].copy_from_slice(bytes);
                false
            }
        }
    }

    fn write_stream_desc(&mut self, off: u32, value: u32, bytes: &[u8]) {
        let rel = (off - STREAM_DESC_BASE) % STREAM_DESC_SIZE;
        let base = off - rel;
        match rel {
            REG_SD_STS => {
                let cur = self.rd8(off);
                self.wr8(off, cur & !(value as u8));
            }
            REG_SD_LPIB | REG_SD_FIFOS => {}
            REG_SD_CTL0 => {
                self.wr8(off, value as u8);
                if value as u8 & SdCtl0::SRST.bits() != 0 {
                    self.wr8(base + REG_SD_CTL2, 0);
                    self.wr8(base + REG_SD_STS, 0);
                    self.wr32(base + REG_SD_LPIB, 0);
                }
            }
            _ => {
                let o = off as usize;
                self.regs[o..o + bytes.len()].copy_from_slice(bytes);
            }
        }
    }
}

/// Entry count selected by a CORBSIZE/RIRBSIZE value
fn ring_entries(size_reg: u8) -> u16 {
    match size_reg & RINGSIZE_SIZE_MASK {
        RINGSIZE_2 => 2,
        RINGSIZE_16 => 16,
        _ => 256,
    }
}

/// Simulated controller
pub struct SimHda {
    state: Mutex<SimState>,
}

/// Builder for [`SimHda`]
#[derive(Debug, Clone)]
pub struct SimHdaBuilder {
    inputs: u16,
    outputs: u16,
    bidir: u16,
    addr_64bit: bool,
    corb_caps: u8,
    rirb_caps: u8,
    codecs: Vec<(u8, SimCodec)>,
    faults: Faults,
}

impl SimHdaBuilder {
    pub fn streams(mut self, inputs: u16, outputs: u16, bidir: u16) -> Self {
        self.inputs = inputs;
        self.outputs = outputs;
        self.bidir = bidir;
        self
    }

    /// Advertised ring sizes as SZCAP bit sets
    pub fn ring_caps(mut self, corb_caps: u8, rirb_caps: u8) -> Self {
        self.corb_caps = corb_caps;
        self.rirb_caps = rirb_caps;
        self
    }

    pub fn codec(mut self, addr: u8, codec: SimCodec) -> Self {
        self.codecs.push((addr, codec));
        self
    }

    /// GCTL.CRST never changes
    pub fn stuck_in_reset(mut self) -> Self {
        self.faults.stuck_in_reset = true;
        self
    }

    /// CORBCTL.CORBRUN never sets
    pub fn corb_dma_broken(mut self) -> Self {
        self.faults.corb_dma_broken = true;
        self
    }

    pub fn build(self) -> Arc<SimHda> {
        let mut st = SimState {
            regs: vec![0; REG_FILE_SIZE],
            codecs: Default::default(),
            buffers: Vec::new(),
            corb_rp: 0,
            rirb_wp: 0,
            hold_commands: false,
            commands: Vec::new(),
            faults: self.faults,
            irq: None,
        };

        let gcap = ((self.outputs & GCAP_OSS_MASK) << GCAP_OSS_SHIFT)
            | ((self.inputs & GCAP_ISS_MASK) << GCAP_ISS_SHIFT)
            | ((self.bidir & GCAP_BSS_MASK) << GCAP_BSS_SHIFT)
            | if self.addr_64bit { GCAP_64OK } else { 0 };
        st.wr16(REG_GCAP, gcap);
        st.wr8(REG_VMIN, 0);
        st.wr8(REG_VMAJ, 1);
        st.wr8(REG_CORBSIZE, self.corb_caps << RINGSIZE_SZCAP_SHIFT);
        st.wr8(REG_RIRBSIZE, self.rirb_caps << RINGSIZE_SZCAP_SHIFT);
        for i in 0..MAX_STREAM_DESCRIPTORS as u32 {
            st.wr16(stream_desc_offset(i) + REG_SD_FIFOS, DEFAULT_FIFO_SIZE);
        }
        for (addr, codec) in self.codecs {
            if let Some(slot) = st.codecs.get_mut(addr as usize) {
                *slot = Some(codec);
            }
        }

        Arc::new(SimHda {
            state: Mutex::new(st),
        })
    }
}

impl SimHda {
    /// 4 input, 4 output streams, every ring size, no codecs
    pub fn builder() -> SimHdaBuilder {
        SimHdaBuilder {
            inputs: 4,
            outputs: 4,
            bidir: 0,
            addr_64bit: true,
            corb_caps: RINGSIZE_SZCAP_2 | RINGSIZE_SZCAP_16 | RINGSIZE_SZCAP_256,
            rirb_caps: RINGSIZE_SZCAP_2 | RINGSIZE_SZCAP_16 | RINGSIZE_SZCAP_256,
            codecs: Vec::new(),
            faults: Faults::default(),
        }
    }

    fn raise(&self, due: bool) {
        if !due {
            return;
        }
        let line = self.state.lock().irq.clone();
        if let Some(line) = line {
            line.raise();
        }
    }

    /// Every command consumed from the CORB so far
    pub fn commands(&self) -> Vec<CodecCommand> {
        self.state.lock().commands.clone()
    }

    pub fn commands_for(&self, addr: u8) -> Vec<CodecCommand> {
        self.commands().into_iter().filter(|c| c.codec_addr() == addr).collect()
    }

    /// Stop consuming the CORB (commands pile up in hardware)
    pub fn hold_commands(&self) {
        self.state.lock().hold_commands = true;
    }

    /// Resume consuming and process everything written meanwhile
    pub fn release_commands(&self) {
        let due = {
            let mut st = self.state.lock();
            st.hold_commands = false;
            st.consume_commands()
        };
        self.raise(due);
    }

    /// Hot-plug a codec and signal a state change
    pub fn plug_codec(&self, addr: u8, codec: SimCodec) {
        let due = {
            let mut st = self.state.lock();
            let Some(slot) = st.codecs.get_mut(addr as usize) else {
                return;
            };
            *slot = Some(codec);
            if st.rd16(REG_WAKEEN) & (1 << addr) != 0 {
                let statests = st.rd16(REG_STATESTS) | (1 << addr);
                st.wr16(REG_STATESTS, statests);
            }
            st.interrupts_enabled()
        };
        self.raise(due);
    }

    /// Codec-initiated event
    pub fn send_unsolicited(&self, addr: u8, tag: u8, subtag: u8, payload: u32) {
        let due = {
            let mut st = self.state.lock();
            st.push_response(CodecResponse::unsolicited(addr, tag, subtag, payload)) && st.interrupts_enabled()
        };
        self.raise(due);
    }

    /// Advance a running stream's link position and flag buffer completion
    pub fn complete_buffer(&self, index: u32, position: u32) {
        let due = {
            let mut st = self.state.lock();
            let base = stream_desc_offset(index);
            st.wr32(base + REG_SD_LPIB, position);
            let ctl = SdCtl0::from_bits_truncate(st.rd8(base + REG_SD_CTL0));
            if !ctl.contains(SdCtl0::RUN | SdCtl0::IOCE) {
                return;
            }
            let sts = st.rd8(base + REG_SD_STS) | SdSts::BCIS.bits();
            st.wr8(base + REG_SD_STS, sts);
            st.interrupts_enabled() && st.rd32(REG_INTCTL) & (1 << index) != 0
        };
        self.raise(due);
    }

    /// Flag a RIRB overrun
    pub fn inject_overrun(&self) {
        let due = {
            let mut st = self.state.lock();
            let sts = st.rd8(REG_RIRBSTS) | RirbSts::OIS.bits();
            st.wr8(REG_RIRBSTS, sts);
            st.interrupts_enabled()
        };
        self.raise(due);
    }

    /// Flag a CORB memory error
    pub fn inject_memory_error(&self) {
        let due = {
            let mut st = self.state.lock();
            let sts = st.rd8(REG_CORBSTS) | CorbSts::CMEI.bits();
            st.wr8(REG_CORBSTS, sts);
            st.interrupts_enabled()
        };
        self.raise(due);
    }

    /// Number of DMA buffers handed out through `alloc_dma`
    pub fn dma_allocations(&self) -> usize {
        self.state.lock().buffers.len()
    }
}

impl HdaBus for SimHda {
    fn read8(&self, offset: u32) -> u8 {
        self.state.lock().rd8(offset)
    }

    fn read16(&self, offset: u32) -> u16 {
        self.state.lock().rd16(offset)
    }

    fn read32(&self, offset: u32) -> u32 {
        let st = self.state.lock();
        if offset == REG_INTSTS { st.intsts() } else { st.rd32(offset) }
    }

    fn write8(&self, offset: u32, value: u8) {
        let due = self.state.lock().write(offset, &[value]);
        self.raise(due);
    }

    fn write16(&self, offset: u32, value: u16) {
        let due = self.state.lock().write(offset, &value.to_le_bytes());
        self.raise(due);
    }

    fn write32(&self, offset: u32, value: u32) {
        let due = self.state.lock().write(offset, &value.to_le_bytes());
        self.raise(due);
    }

    fn alloc_dma(&self, len: usize) -> HdaResult<DmaBuffer> {
        let buf = DmaBuffer::alloc(len)?;
        self.state.lock().buffers.push(buf.clone());
        Ok(buf)
    }

    fn attach_interrupt(&self, line: InterruptLine) {
        self.state.lock().irq = Some(line);
    }

    fn delay_us(&self, _us: u64) {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_reports_present_codecs() {
        let sim = SimHda::builder()
            .codec(0, SimCodec::new(0x10EC_0269))
            .codec(2, SimCodec::new(0x8086_2805))
            .build();
        sim.write32(REG_GCTL, Gctl::CRST.bits());
        assert_eq!(sim.read16(REG_STATESTS), 0b101);
        sim.write16(REG_STATESTS, 0b001);
        assert_eq!(sim.read16(REG_STATESTS), 0b100);
    }

    #[test]
    fn test_stuck_reset() {
        let sim = SimHda::builder().stuck_in_reset().build();
        sim.write32(REG_GCTL, Gctl::CRST.bits());
        assert_eq!(sim.read32(REG_GCTL) & Gctl::CRST.bits(), 0);
    }

    #[test]
    fn test_codec_param_answers() {
        let codec = SimCodec::new(0x1AF4_0022).function_groups(&[FUNC_GROUP_MODEM as u32, FUNC_GROUP_AUDIO as u32]);
        let get = |nid, param| codec.execute(0, CodecCommand::get_param(0, nid, param)).data;
        assert_eq!(get(0, PARAM_VENDOR_ID), 0x1AF4_0022);
        assert_eq!(get(0, PARAM_SUB_NODE_COUNT), 0x0001_0002);
        assert_eq!(get(2, PARAM_FUNC_GROUP_TYPE), FUNC_GROUP_AUDIO as u32);
        assert_eq!(get(3, PARAM_FUNC_GROUP_TYPE), 0);
    }

    #[test]
    fn test_intsts_reflects_status() {
        let sim = SimHda::builder().build();
        assert_eq!(sim.read32(REG_INTSTS), 0);
        sim.inject_overrun();
        let intsts = IntSts::from_bits_retain(sim.read32(REG_INTSTS));
        assert!(intsts.contains(IntSts::CIS | IntSts::GIS));
    }
}
