// ============================================================================
// src/io/audio/hda/stream.rs - DMA Stream Descriptor
// ============================================================================
//!
//! HDA ストリーム記述子の管理。
//!
//! - ストリーム種別とタグの設定 (SDnCTL2)
//! - リセットハンドシェイク (SRST)
//! - フォーマット設定 / 開始 / 停止
//! - ストリームフォーマットの計算

use alloc::sync::Arc;
use core::fmt;

use log::{debug, trace};
use spin::Mutex;

use crate::error::{HdaError, HdaResult};

use super::bus::HdaBus;
use super::regs::*;

// ============================================================================
// Stream Type
// ============================================================================

/// Descriptor type, or `Invalid` while sitting in the free pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Invalid,
    Input,
    Output,
    Bidir,
}

impl StreamType {
    pub fn from_input(input: bool) -> Self {
        if input { StreamType::Input } else { StreamType::Output }
    }
}

// ============================================================================
// Stream Format
// ============================================================================

/// PCM stream format, encodable to the 16-bit SDnFMT / converter format word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub bits: u8,
    pub channels: u8,
}

/// (rate, 44.1k base, multiplier, divisor)
const RATE_TABLE: [(u32, bool, u16, u16); 11] = [
    (8000, false, 1, 6),
    (11025, true, 1, 4),
    (16000, false, 1, 3),
    (22050, true, 1, 2),
    (32000, false, 2, 3),
    (44100, true, 1, 1),
    (48000, false, 1, 1),
    (88200, true, 2, 1),
    (96000, false, 2, 1),
    (176400, true, 4, 1),
    (192000, false, 4, 1),
];

impl StreamFormat {
    pub const fn new(sample_rate: u32, bits: u8, channels: u8) -> Self {
        Self {
            sample_rate,
            bits,
            channels,
        }
    }

    /// Encode to the format word
    pub fn encode(&self) -> HdaResult<u16> {
        if self.channels == 0 || self.channels > 16 {
            return Err(HdaError::InvalidArgument);
        }

        let bits = match self.bits {
            8 => FMT_BITS_8,
            16 => FMT_BITS_16,
            20 => FMT_BITS_20,
            24 => FMT_BITS_24,
            32 => FMT_BITS_32,
            _ => return Err(HdaError::InvalidArgument),
        };

        let &(_, base_44k1, mult, div) = RATE_TABLE
            .iter()
            .find(|(rate, _, _, _)| *rate == self.sample_rate)
            .ok_or(HdaError::InvalidArgument)?;

        let mut format = (self.channels as u16 - 1) & FMT_CHAN_MASK;
        format |= bits;
        format |= ((div - 1) << FMT_DIV_SHIFT) & FMT_DIV_MASK;
        format |= ((mult - 1) << FMT_MULT_SHIFT) & FMT_MULT_MASK;
        if base_44k1 {
            format |= FMT_BASE;
        }
        Ok(format)
    }

    /// Decode a format word
    pub fn decode(format: u16) -> HdaResult<Self> {
        let base_44k1 = format & FMT_BASE != 0;
        let mult = ((format & FMT_MULT_MASK) >> FMT_MULT_SHIFT) + 1;
        let div = ((format & FMT_DIV_MASK) >> FMT_DIV_SHIFT) + 1;

        let &(sample_rate, _, _, _) = RATE_TABLE
            .iter()
            .find(|(_, b, m, d)| *b == base_44k1 && *m == mult && *d == div)
            .ok_or(HdaError::InvalidArgument)?;

        let bits = match format & FMT_BITS_MASK {
            FMT_BITS_8 => 8,
            FMT_BITS_16 => 16,
            FMT_BITS_20 => 20,
            FMT_BITS_24 => 24,
            FMT_BITS_32 => 32,
            _ => return Err(HdaError::InvalidArgument),
        };

        Ok(Self {
            sample_rate,
            bits,
            channels: (format & FMT_CHAN_MASK) as u8 + 1,
        })
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz {}-bit x{}", self.sample_rate, self.bits, self.channels)
    }
}

// ============================================================================
// DMA Stream
// ============================================================================

struct DmaStreamState {
    configured: StreamType,
    tag: u8,
    running: bool,
    format: u16,
}

/// One stream descriptor register block
pub struct DmaStream {
    /// 1-based stream id
    id: u16,
    /// 0-based descriptor index (also its INTCTL/INTSTS bit)
    index: u32,
    hw_type: StreamType,
    base: u32,
    bus: Arc<dyn HdaBus>,
    /// Shared by every stream of one controller for INTCTL read-modify-write
    intctl_lock: Arc<Mutex<()>>,
    state: Mutex<DmaStreamState>,
}

impl DmaStream {
    pub fn new(
        bus: Arc<dyn HdaBus>,
        index: u32,
        hw_type: StreamType,
        intctl_lock: Arc<Mutex<()>>,
    ) -> Self {
        debug_assert!(hw_type != StreamType::Invalid);
        Self {
            id: index as u16 + 1,
            index,
            hw_type,
            base: stream_desc_offset(index),
            bus,
            intctl_lock,
            state: Mutex::new(DmaStreamState {
                configured: StreamType::Invalid,
                tag: 0,
                running: false,
                format: 0,
            }),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Hardware capability of the descriptor
    pub fn hw_type(&self) -> StreamType {
        self.hw_type
    }

    /// Direction it is currently configured for
    pub fn configured_type(&self) -> StreamType {
        self.state.lock().configured
    }

    pub fn tag(&self) -> u8 {
        self.state.lock().tag
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn format(&self) -> u16 {
        self.state.lock().format
    }

    /// Set the direction and tag (0 with `Invalid` returns it to the idle state)
    pub fn configure(&self, stream_type: StreamType, tag: u8) -> HdaResult<()> {
        let mut state = self.state.lock();

        let ctl2 = match stream_type {
            StreamType::Invalid => {
                if state.running {
                    self.stop_locked(&mut state);
                }
                0
            }
            StreamType::Bidir => return Err(HdaError::InvalidArgument),
            StreamType::Input | StreamType::Output => {
                if tag == 0 || tag > MAX_STREAM_TAG {
                    return Err(HdaError::InvalidArgument);
                }
                if self.hw_type != StreamType::Bidir && self.hw_type != stream_type {
                    return Err(HdaError::InvalidArgument);
                }
                let mut v = (tag << SD_CTL2_STRM_SHIFT) & SD_CTL2_STRM_MASK;
                if self.hw_type == StreamType::Bidir && stream_type == StreamType::Output {
                    v |= SD_CTL2_DIR;
                }
                v
            }
        };

        self.bus.write8(self.base + REG_SD_CTL2, ctl2);
        state.configured = stream_type;
        state.tag = if stream_type == StreamType::Invalid { 0 } else { tag };
        trace!("[HDA] Stream {} configured {:?} tag {}", self.id, state.configured, state.tag);
        Ok(())
    }

    /// SRST set/clear handshake
    pub fn reset(&self) -> HdaResult<()> {
        let mut state = self.state.lock();
        if state.running {
            self.stop_locked(&mut state);
        }

        let ctl0 = self.base + REG_SD_CTL0;
        self.bus.write8(ctl0, SdCtl0::SRST.bits());
        self.wait_srst(true)?;
        self.bus.write8(ctl0, 0);
        self.wait_srst(false)?;

        // SRST clears CTL2 as well; restore the tag
        let tag = state.tag;
        let mut ctl2 = (tag << SD_CTL2_STRM_SHIFT) & SD_CTL2_STRM_MASK;
        if self.hw_type == StreamType::Bidir && state.configured == StreamType::Output {
            ctl2 |= SD_CTL2_DIR;
        }
        self.bus.write8(self.base + REG_SD_CTL2, ctl2);
        self.bus.write8(self.base + REG_SD_STS, (SdSts::BCIS | SdSts::FIFOE | SdSts::DESE).bits());
        state.format = 0;
        Ok(())
    }

    fn wait_srst(&self, set: bool) -> HdaResult<()> {
        for _ in 0..1000 {
            let srst = self.bus.read8(self.base + REG_SD_CTL0) & SdCtl0::SRST.bits() != 0;
            if srst == set {
                return Ok(());
            }
            self.bus.delay_us(10);
        }
        Err(HdaError::Timeout)
    }

    pub fn set_format(&self, format: u16) -> HdaResult<()> {
        let mut state = self.state.lock();
        if state.configured == StreamType::Invalid {
            return Err(HdaError::BadState);
        }
        if state.running {
            return Err(HdaError::BadState);
        }
        self.bus.write16(self.base + REG_SD_FMT, format);
        state.format = format;
        Ok(())
    }

    pub fn start(&self) -> HdaResult<()> {
        let mut state = self.state.lock();
        if state.configured == StreamType::Invalid {
            return Err(HdaError::BadState);
        }
        if state.running {
            return Ok(());
        }

        {
            let _guard = self.intctl_lock.lock();
            let intctl = self.bus.read32(REG_INTCTL);
            self.bus.write32(REG_INTCTL, intctl | (1 << self.index));
        }
        self.bus.write8(
            self.base + REG_SD_CTL0,
            (SdCtl0::RUN | SdCtl0::IOCE | SdCtl0::FEIE | SdCtl0::DEIE).bits(),
        );
        state.running = true;
        debug!("[HDA] Stream {} started", self.id);
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.running {
            self.stop_locked(&mut state);
        }
    }

    fn stop_locked(&self, state: &mut DmaStreamState) {
        self.bus.write8(self.base + REG_SD_CTL0, 0);
        {
            let _guard = self.intctl_lock.lock();
            let intctl = self.bus.read32(REG_INTCTL);
            self.bus.write32(REG_INTCTL, intctl & !(1 << self.index));
        }
        state.running = false;
        debug!("[HDA] Stream {} stopped", self.id);
    }

    /// Link position in the cyclic buffer (SDnLPIB)
    pub fn position(&self) -> u32 {
        self.bus.read32(self.base + REG_SD_LPIB)
    }

    /// FIFO depth in bytes (SDnFIFOS)
    pub fn fifo_depth(&self) -> u16 {
        self.bus.read16(self.base + REG_SD_FIFOS)
    }

    /// Read and acknowledge the stream status bits
    pub fn ack_status(&self) -> SdSts {
        let sts = SdSts::from_bits_truncate(self.bus.read8(self.base + REG_SD_STS));
        let ack = sts & (SdSts::BCIS | SdSts::FIFOE | SdSts::DESE);
        if !ack.is_empty() {
            self.bus.write8(self.base + REG_SD_STS, ack.bits());
        }
        sts
    }
}

impl fmt::Debug for DmaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DmaStream")
            .field("id", &self.id)
            .field("hw_type", &self.hw_type)
            .field("configured", &state.configured)
            .field("tag", &state.tag)
            .field("running", &state.running)
            .finish()
    }
}
