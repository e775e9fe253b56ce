// ============================================================================
// src/io/audio/hda/types.rs - HDA Types and Data Structures
// ============================================================================
//!
//! HDA コアで使用される型定義。
//!
//! - CORBコマンド / RIRBレスポンス
//! - コマンドジョブ
//! - コーデック識別情報

use alloc::sync::Arc;
use core::fmt;

use crate::ipc::Channel;

use super::regs::{MAX_CODECS, PARAM_VENDOR_ID, VERB_GET_PARAM};

// ============================================================================
// CORB Entry
// ============================================================================

/// Codec command (one CORB entry)
/// Format: [Codec Address (4)] [Node ID (8)] [Verb (20)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct CodecCommand(u32);

impl CodecCommand {
    pub const fn new(codec_addr: u8, node_id: u8, verb: u32) -> Self {
        Self(((codec_addr as u32 & 0x0F) << 28) | ((node_id as u32) << 20) | (verb & 0xFFFFF))
    }

    /// `GET_PARAM` verb for a node
    pub const fn get_param(codec_addr: u8, node_id: u8, param: u8) -> Self {
        Self::new(codec_addr, node_id, VERB_GET_PARAM | param as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn codec_addr(&self) -> u8 {
        (self.0 >> 28) as u8
    }

    pub const fn node_id(&self) -> u8 {
        ((self.0 >> 20) & 0xFF) as u8
    }

    pub const fn verb(&self) -> u32 {
        self.0 & 0xFFFFF
    }

    /// Sanity check applied before a command may be queued
    pub fn is_valid(&self) -> bool {
        (self.codec_addr() as usize) < MAX_CODECS
            && self.node_id() < 0x7F
            && (self.node_id() != 0 || self.verb() != 0)
    }
}

impl fmt::Display for CodecCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[cad {} nid {} verb {:05x}]",
            self.codec_addr(),
            self.node_id(),
            self.verb()
        )
    }
}

// ============================================================================
// RIRB Entry
// ============================================================================

/// RIRB response entry (two 32-bit words, little endian in memory)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CodecResponse {
    /// Response data
    pub data: u32,
    /// Response extended (codec address, unsolicited flag)
    pub data_ex: u32,
}

impl CodecResponse {
    pub const fn new(data: u32, data_ex: u32) -> Self {
        Self { data, data_ex }
    }

    /// Decode a raw 64-bit ring entry as read from DMA memory
    pub fn from_raw(raw: u64) -> Self {
        let raw = u64::from_le(raw);
        Self {
            data: raw as u32,
            data_ex: (raw >> 32) as u32,
        }
    }

    /// Build a solicited response (mostly for the simulator)
    pub const fn solicited(codec_addr: u8, data: u32) -> Self {
        Self::new(data, codec_addr as u32 & 0x0F)
    }

    /// Build an unsolicited response with its tag and sub-tag
    pub const fn unsolicited(codec_addr: u8, tag: u8, subtag: u8, payload: u32) -> Self {
        let data = ((tag as u32 & 0x3F) << 26) | ((subtag as u32 & 0x1F) << 21) | (payload & 0x1F_FFFF);
        Self::new(data, (codec_addr as u32 & 0x0F) | 0x10)
    }

    pub const fn raw(&self) -> u64 {
        ((self.data_ex as u64) << 32) | self.data as u64
    }

    pub const fn codec_addr(&self) -> u8 {
        (self.data_ex & 0x0F) as u8
    }

    pub const fn is_unsolicited(&self) -> bool {
        (self.data_ex & 0x10) != 0
    }

    /// Unsolicited tag (bits 26-31)
    pub const fn unsol_tag(&self) -> u8 {
        (self.data >> 26) as u8
    }

    /// Unsolicited sub-tag (bits 21-25)
    pub const fn unsol_subtag(&self) -> u8 {
        ((self.data >> 21) & 0x1F) as u8
    }

    /// Unsolicited payload (bits 0-20)
    pub const fn unsol_data(&self) -> u32 {
        self.data & 0x1F_FFFF
    }
}

// ============================================================================
// Command Job
// ============================================================================

/// A queued outbound command
///
/// Lives in exactly one of the engine's `pending` / `in_flight` queues.
pub struct CodecCmdJob {
    pub command: CodecCommand,
    /// Where the response goes; `None` for probe and other internal commands
    pub response_channel: Option<Arc<Channel>>,
    pub transaction_id: u32,
}

impl CodecCmdJob {
    pub fn new(command: CodecCommand, response_channel: Option<Arc<Channel>>, transaction_id: u32) -> Self {
        Self {
            command,
            response_channel,
            transaction_id,
        }
    }

    pub fn internal(command: CodecCommand) -> Self {
        Self::new(command, None, 0)
    }
}

impl fmt::Debug for CodecCmdJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecCmdJob")
            .field("command", &format_args!("{}", self.command))
            .field("channel", &self.response_channel.as_ref().map(|c| c.id()))
            .field("txn", &self.transaction_id)
            .finish()
    }
}

// ============================================================================
// Codec Identity
// ============================================================================

/// Identity record collected while probing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub major_rev: u8,
    pub minor_rev: u8,
    pub revision_id: u8,
    pub stepping_id: u8,
    /// First function group node and group count
    pub fg_start: u8,
    pub fg_count: u8,
    /// Audio function group node, if present
    pub afg_node: Option<u8>,
}

impl CodecIdentity {
    /// `GET_PARAM(VENDOR_ID)` of the root node
    pub const fn probe_command(codec_addr: u8) -> CodecCommand {
        CodecCommand::get_param(codec_addr, 0, PARAM_VENDOR_ID)
    }
}

impl fmt::Display for CodecIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} rev {}.{}.{}.{}",
            self.vendor_id,
            self.device_id,
            self.major_rev,
            self.minor_rev,
            self.revision_id,
            self.stepping_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_packing() {
        let cmd = CodecCommand::new(2, 0x14, 0x70640);
        assert_eq!(cmd.codec_addr(), 2);
        assert_eq!(cmd.node_id(), 0x14);
        assert_eq!(cmd.verb(), 0x70640);
        assert_eq!(cmd.raw(), 0x2147_0640);
    }

    #[test]
    fn test_command_sanity() {
        assert!(CodecCommand::get_param(0, 0, 0).is_valid());
        assert!(!CodecCommand::new(0, 0, 0).is_valid());
        assert!(!CodecCommand::new(15, 1, 0xF0000).is_valid());
        assert!(!CodecCommand::new(0, 0x7F, 0xF0000).is_valid());
    }

    #[test]
    fn test_response_decode() {
        let resp = CodecResponse::from_raw(0x0000_0013_1234_5678u64.to_le());
        assert_eq!(resp.data, 0x1234_5678);
        assert_eq!(resp.codec_addr(), 3);
        assert!(resp.is_unsolicited());

        let unsol = CodecResponse::unsolicited(1, 5, 2, 0x42);
        assert_eq!(unsol.unsol_tag(), 5);
        assert_eq!(unsol.unsol_subtag(), 2);
        assert_eq!(unsol.unsol_data(), 0x42);
        assert_eq!(unsol.codec_addr(), 1);

        let sol = CodecResponse::solicited(4, 0xdead);
        assert!(!sol.is_unsolicited());
        assert_eq!(CodecResponse::from_raw(sol.raw().to_le()), sol);
    }
}
