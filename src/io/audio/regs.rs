// ============================================================================
// src/io/audio/regs.rs - Intel High Definition Audio Register Definitions
// ============================================================================
//!
//! # Intel HD Audio レジスタ定義
//!
//! Intel High Definition Audio Specification Rev 1.0a に基づくレジスタ定義。
//! リングバッファプロトコルとストリーム記述子の制御に必要な範囲のみ。

#![allow(dead_code)]

use bitflags::bitflags;

// ============================================================================
// Global Registers (Offset 0x00 - 0x2F)
// ============================================================================

/// Global Capabilities (GCAP) - 16-bit, RO
pub const REG_GCAP: u32 = 0x00;

/// Minor Version (VMIN) - 8-bit, RO
pub const REG_VMIN: u32 = 0x02;

/// Major Version (VMAJ) - 8-bit, RO
pub const REG_VMAJ: u32 = 0x03;

/// Global Control (GCTL) - 32-bit, RW
pub const REG_GCTL: u32 = 0x08;

/// Wake Enable (WAKEEN) - 16-bit, RW
pub const REG_WAKEEN: u32 = 0x0C;

/// State Change Status (STATESTS) - 16-bit, RW1C
pub const REG_STATESTS: u32 = 0x0E;

/// Interrupt Control (INTCTL) - 32-bit, RW
pub const REG_INTCTL: u32 = 0x20;

/// Interrupt Status (INTSTS) - 32-bit, RO
pub const REG_INTSTS: u32 = 0x24;

// ============================================================================
// GCAP (Global Capabilities) Fields
// ============================================================================

/// 64-bit Address Supported - Bit 0
pub const GCAP_64OK: u16 = 1 << 0;
/// Number of Bidirectional Streams - Bits 3-7
pub const GCAP_BSS_SHIFT: u16 = 3;
pub const GCAP_BSS_MASK: u16 = 0x1F;
/// Number of Input Streams - Bits 8-11
pub const GCAP_ISS_SHIFT: u16 = 8;
pub const GCAP_ISS_MASK: u16 = 0x0F;
/// Number of Output Streams - Bits 12-15
pub const GCAP_OSS_SHIFT: u16 = 12;
pub const GCAP_OSS_MASK: u16 = 0x0F;

bitflags! {
    /// GCTL (Global Control)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gctl: u32 {
        /// Controller Reset (CRST): 0 = in reset, 1 = running
        const CRST = 1 << 0;
        /// Flush Control (FCNTRL)
        const FCNTRL = 1 << 1;
        /// Accept Unsolicited Response Enable (UNSOL)
        const UNSOL = 1 << 8;
    }
}

bitflags! {
    /// INTCTL (Interrupt Control)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntCtl: u32 {
        /// Stream Interrupt Enable bits (bit 0-29)
        const SIE_MASK = 0x3FFF_FFFF;
        /// Controller Interrupt Enable (CIE)
        const CIE = 1 << 30;
        /// Global Interrupt Enable (GIE)
        const GIE = 1 << 31;
    }
}

bitflags! {
    /// INTSTS (Interrupt Status)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntSts: u32 {
        /// Stream Interrupt Status bits (bit 0-29)
        const SIS_MASK = 0x3FFF_FFFF;
        /// Controller Interrupt Status (CIS)
        const CIS = 1 << 30;
        /// Global Interrupt Status (GIS)
        const GIS = 1 << 31;
    }
}

/// STATESTS: one bit per codec SDIN line (0-14)
pub const STATESTS_MASK: u16 = 0x7FFF;

// ============================================================================
// CORB Registers (Offset 0x40 - 0x4F)
// ============================================================================

/// CORB Lower Base Address (CORBLBASE) - 32-bit, RW
pub const REG_CORBLBASE: u32 = 0x40;

/// CORB Upper Base Address (CORBUBASE) - 32-bit, RW
pub const REG_CORBUBASE: u32 = 0x44;

/// CORB Write Pointer (CORBWP) - 16-bit, RW
pub const REG_CORBWP: u32 = 0x48;

/// CORB Read Pointer (CORBRP) - 16-bit, RW/RO
pub const REG_CORBRP: u32 = 0x4A;

/// CORB Control (CORBCTL) - 8-bit, RW
pub const REG_CORBCTL: u32 = 0x4C;

/// CORB Status (CORBSTS) - 8-bit, RW1C
pub const REG_CORBSTS: u32 = 0x4D;

/// CORB Size (CORBSIZE) - 8-bit, RW
pub const REG_CORBSIZE: u32 = 0x4E;

bitflags! {
    /// CORBCTL (CORB Control)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CorbCtl: u8 {
        /// CORB Memory Error Interrupt Enable (CMEIE)
        const CMEIE = 1 << 0;
        /// CORB DMA Enable (CORBRUN)
        const CORBRUN = 1 << 1;
    }
}

bitflags! {
    /// CORBSTS (CORB Status)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CorbSts: u8 {
        /// CORB Memory Error Indication (CMEI)
        const CMEI = 1 << 0;
    }
}

/// CORB Read Pointer Reset (CORBRPRST) - Bit 15
pub const CORBRP_RST: u16 = 1 << 15;

// ============================================================================
// RIRB Registers (Offset 0x50 - 0x5F)
// ============================================================================

/// RIRB Lower Base Address (RIRBLBASE) - 32-bit, RW
pub const REG_RIRBLBASE: u32 = 0x50;

/// RIRB Upper Base Address (RIRBUBASE) - 32-bit, RW
pub const REG_RIRBUBASE: u32 = 0x54;

/// RIRB Write Pointer (RIRBWP) - 16-bit, RW
pub const REG_RIRBWP: u32 = 0x58;

/// Response Interrupt Count (RINTCNT) - 16-bit, RW
pub const REG_RINTCNT: u32 = 0x5A;

/// RIRB Control (RIRBCTL) - 8-bit, RW
pub const REG_RIRBCTL: u32 = 0x5C;

/// RIRB Status (RIRBSTS) - 8-bit, RW1C
pub const REG_RIRBSTS: u32 = 0x5D;

/// RIRB Size (RIRBSIZE) - 8-bit, RW
pub const REG_RIRBSIZE: u32 = 0x5E;

/// RIRB Write Pointer Reset (RIRBWPRST) - Bit 15
pub const RIRBWP_RST: u16 = 1 << 15;

bitflags! {
    /// RIRBCTL (RIRB Control)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RirbCtl: u8 {
        /// Response Interrupt Control (RINTCTL)
        const RINTCTL = 1 << 0;
        /// RIRB DMA Enable (RIRBDMAEN)
        const DMAEN = 1 << 1;
        /// Response Overrun Interrupt Control (RIRBOIC)
        const OIC = 1 << 2;
    }
}

bitflags! {
    /// RIRBSTS (RIRB Status)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RirbSts: u8 {
        /// Response Interrupt (RINTFL)
        const RINTFL = 1 << 0;
        /// Response Overrun Interrupt Status (RIRBOIS)
        const OIS = 1 << 2;
    }
}

// ============================================================================
// CORBSIZE / RIRBSIZE (same layout)
// ============================================================================

/// Size Capability - Bits 4-7 (bit 4: 2 entries, bit 5: 16, bit 6: 256)
pub const RINGSIZE_SZCAP_SHIFT: u8 = 4;
pub const RINGSIZE_SZCAP_2: u8 = 1 << 0;
pub const RINGSIZE_SZCAP_16: u8 = 1 << 1;
pub const RINGSIZE_SZCAP_256: u8 = 1 << 2;

/// Size select - Bits 0-1
pub const RINGSIZE_SIZE_MASK: u8 = 0x03;
pub const RINGSIZE_2: u8 = 0x00;
pub const RINGSIZE_16: u8 = 0x01;
pub const RINGSIZE_256: u8 = 0x02;

/// CORB entry size in bytes
pub const CORB_ENTRY_SIZE: usize = 4;

/// RIRB entry size in bytes
pub const RIRB_ENTRY_SIZE: usize = 8;

/// Ring buffers must be 128-byte aligned
pub const DMA_ALIGN: usize = 128;

// ============================================================================
// Stream Descriptor Registers (Relative to stream base)
// ============================================================================

/// First stream descriptor
pub const STREAM_DESC_BASE: u32 = 0x80;

/// Stream Descriptor Size
pub const STREAM_DESC_SIZE: u32 = 0x20;

/// Stream Descriptor Control 0 (SDnCTL0) - 8-bit
pub const REG_SD_CTL0: u32 = 0x00;
/// Stream Descriptor Control 2 (SDnCTL2) - 8-bit
pub const REG_SD_CTL2: u32 = 0x02;
/// Stream Descriptor Status (SDnSTS) - 8-bit
pub const REG_SD_STS: u32 = 0x03;
/// Stream Descriptor Link Position in Buffer (SDnLPIB) - 32-bit
pub const REG_SD_LPIB: u32 = 0x04;
/// Stream Descriptor Cyclic Buffer Length (SDnCBL) - 32-bit
pub const REG_SD_CBL: u32 = 0x08;
/// Stream Descriptor Last Valid Index (SDnLVI) - 16-bit
pub const REG_SD_LVI: u32 = 0x0C;
/// Stream Descriptor FIFO Size (SDnFIFOS) - 16-bit
pub const REG_SD_FIFOS: u32 = 0x10;
/// Stream Descriptor Format (SDnFMT) - 16-bit
pub const REG_SD_FMT: u32 = 0x12;
/// Stream Descriptor BDL Lower Base Address (SDnBDPL) - 32-bit
pub const REG_SD_BDPL: u32 = 0x18;
/// Stream Descriptor BDL Upper Base Address (SDnBDPU) - 32-bit
pub const REG_SD_BDPU: u32 = 0x1C;

bitflags! {
    /// SDnCTL0
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdCtl0: u8 {
        /// Stream Reset (SRST)
        const SRST = 1 << 0;
        /// Stream Run (RUN)
        const RUN = 1 << 1;
        /// Interrupt On Completion Enable (IOCE)
        const IOCE = 1 << 2;
        /// FIFO Error Interrupt Enable (FEIE)
        const FEIE = 1 << 3;
        /// Descriptor Error Interrupt Enable (DEIE)
        const DEIE = 1 << 4;
    }
}

bitflags! {
    /// SDnSTS (RW1C)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdSts: u8 {
        /// Buffer Completion Interrupt Status (BCIS)
        const BCIS = 1 << 2;
        /// FIFO Error (FIFOE)
        const FIFOE = 1 << 3;
        /// Descriptor Error (DESE)
        const DESE = 1 << 4;
        /// FIFO Ready (FIFORDY)
        const FIFORDY = 1 << 5;
    }
}

/// SDnCTL2: Bidirectional Direction Control (DIR), 1 = output
pub const SD_CTL2_DIR: u8 = 1 << 3;
/// SDnCTL2: Stream Number (tag) - Bits 4-7
pub const SD_CTL2_STRM_SHIFT: u8 = 4;
pub const SD_CTL2_STRM_MASK: u8 = 0xF0;

/// Stream descriptor register block offset for a 0-based descriptor index
#[inline]
pub const fn stream_desc_offset(index: u32) -> u32 {
    STREAM_DESC_BASE + index * STREAM_DESC_SIZE
}

// ============================================================================
// Stream Format (SDnFMT) Bit Definitions
// ============================================================================

pub const FMT_CHAN_MASK: u16 = 0x000F;
pub const FMT_BITS_SHIFT: u16 = 4;
pub const FMT_BITS_MASK: u16 = 0x0070;
pub const FMT_DIV_SHIFT: u16 = 8;
pub const FMT_DIV_MASK: u16 = 0x0700;
pub const FMT_MULT_SHIFT: u16 = 11;
pub const FMT_MULT_MASK: u16 = 0x3800;
/// Sample Base Rate: 0 = 48kHz, 1 = 44.1kHz
pub const FMT_BASE: u16 = 1 << 14;

pub const FMT_BITS_8: u16 = 0x00 << 4;
pub const FMT_BITS_16: u16 = 0x01 << 4;
pub const FMT_BITS_20: u16 = 0x02 << 4;
pub const FMT_BITS_24: u16 = 0x03 << 4;
pub const FMT_BITS_32: u16 = 0x04 << 4;

// ============================================================================
// Codec Command/Response Verbs
// ============================================================================

/// Get Parameter (12-bit verb id + 8-bit parameter id)
pub const VERB_GET_PARAM: u32 = 0xF0000;
pub const VERB_SET_CONV_FMT: u32 = 0x20000;
pub const VERB_SET_POWER: u32 = 0x70500;
pub const VERB_SET_CONV_STREAM: u32 = 0x70600;
pub const VERB_SET_UNSOL: u32 = 0x70800;

/// Unsolicited response enable bit in SET_UNSOL payload
pub const UNSOL_ENABLE: u32 = 1 << 7;

// ============================================================================
// Codec Parameters (for GET_PARAM verb)
// ============================================================================

pub const PARAM_VENDOR_ID: u8 = 0x00;
pub const PARAM_REVISION_ID: u8 = 0x02;
pub const PARAM_SUB_NODE_COUNT: u8 = 0x04;
pub const PARAM_FUNC_GROUP_TYPE: u8 = 0x05;

/// Function group types (FUNC_GROUP_TYPE bits 0-7)
pub const FUNC_GROUP_AUDIO: u8 = 0x01;
pub const FUNC_GROUP_MODEM: u8 = 0x02;

/// Power State Values
pub const POWER_D0: u8 = 0x00;
pub const POWER_D3: u8 = 0x03;

// ============================================================================
// Limits
// ============================================================================

/// Codec addresses are 0-14
pub const MAX_CODECS: usize = 15;

/// Stream tags are 1-15; 0 means unassigned
pub const MAX_STREAM_TAG: u8 = 15;

/// Maximum descriptors of any kind (GCAP fields allow up to 30 total)
pub const MAX_STREAM_DESCRIPTORS: usize = 30;
