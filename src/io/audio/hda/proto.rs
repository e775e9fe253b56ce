// ============================================================================
// src/io/audio/hda/proto.rs - Channel Wire Protocol
// ============================================================================
//!
//! # チャネル上のメッセージ形式
//!
//! すべてのメッセージはリトルエンディアンのヘッダ `{ cmd: u32, transaction_id: u32 }`
//! で始まり、コマンドごとに固定長のペイロードが続く。
//!
//! - `CodecRequest` / `CodecReply` - コーデックチャネル
//! - `RingBufferRequest` / `RingBufferReply` - フォーマット設定で渡されるサイドチャネル
//! - `StreamClientRequest` / `StreamClientReply` - ストリームのクライアントチャネル
//!
//! 受信側は長さを厳密に検証し、未知のコマンドは `NotSupported` とする。

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{FatalKind, HdaError, HdaResult};

// ============================================================================
// Command codes
// ============================================================================

/// Set on `cmd` when the sender does not want a reply
pub const CMD_FLAG_NO_ACK: u32 = 1 << 31;

pub const HEADER_LEN: usize = 8;

pub const CODEC_GET_IDS: u32 = 0x1000;
pub const CODEC_SEND_CORB_CMD: u32 = 0x1001;
pub const CODEC_REQUEST_STREAM: u32 = 0x1002;
pub const CODEC_RELEASE_STREAM: u32 = 0x1003;
pub const CODEC_SET_STREAM_FMT: u32 = 0x1004;
pub const CODEC_UNSOLICITED: u32 = 0x1005;

pub const STREAM_SET_FORMAT: u32 = 0x2001;

pub const RB_GET_FIFO_DEPTH: u32 = 0x3001;
pub const RB_START: u32 = 0x3002;
pub const RB_STOP: u32 = 0x3003;
pub const RB_GET_POSITION: u32 = 0x3004;

/// Reply code carrying an error status
pub const REPLY_ERROR: u32 = 0x7FFF_FFFF;

// ============================================================================
// Header / byte helpers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub cmd: u32,
    pub transaction_id: u32,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> HdaResult<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            cmd: r.u32()?,
            transaction_id: r.u32()?,
        })
    }

    /// Command code without flag bits
    pub fn code(&self) -> u32 {
        self.cmd & !CMD_FLAG_NO_ACK
    }

    pub fn no_ack(&self) -> bool {
        self.cmd & CMD_FLAG_NO_ACK != 0
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(cmd: u32, transaction_id: u32) -> Self {
        let mut w = Self {
            buf: Vec::with_capacity(16),
        };
        w.u32(cmd).u32(transaction_id);
        w
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn pad(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }

    fn finish(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buf)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> HdaResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(HdaError::InvalidArgument)?;
        let slice = self.bytes.get(self.pos..end).ok_or(HdaError::InvalidArgument)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> HdaResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> HdaResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> HdaResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn skip(&mut self, n: usize) -> HdaResult<()> {
        self.take(n).map(|_| ())
    }
}

/// Exact-length check for a message of `payload` bytes after the header
fn expect_len(bytes: &[u8], payload: usize) -> HdaResult<Reader<'_>> {
    if bytes.len() != HEADER_LEN + payload {
        return Err(HdaError::InvalidArgument);
    }
    let mut r = Reader::new(bytes);
    r.skip(HEADER_LEN)?;
    Ok(r)
}

// ============================================================================
// Status codes
// ============================================================================

/// Wire status for an error reply
pub fn status_of(err: &HdaError) -> u32 {
    match err {
        HdaError::InvalidArgument => 1,
        HdaError::BadState => 2,
        HdaError::NotFound => 3,
        HdaError::ResourceExhausted => 4,
        HdaError::NotSupported => 5,
        HdaError::AlreadyBound => 6,
        HdaError::PeerClosed => 7,
        HdaError::ShouldWait => 8,
        HdaError::Timeout => 9,
        HdaError::InitFailed(_) => 10,
        HdaError::AllocFailed => 11,
        HdaError::Fatal(_) => 12,
    }
}

pub fn error_from_status(status: u32) -> HdaError {
    match status {
        1 => HdaError::InvalidArgument,
        2 => HdaError::BadState,
        3 => HdaError::NotFound,
        4 => HdaError::ResourceExhausted,
        5 => HdaError::NotSupported,
        6 => HdaError::AlreadyBound,
        7 => HdaError::PeerClosed,
        8 => HdaError::ShouldWait,
        9 => HdaError::Timeout,
        10 => HdaError::InitFailed(String::new()),
        11 => HdaError::AllocFailed,
        _ => HdaError::Fatal(FatalKind::ProtocolViolation),
    }
}

// ============================================================================
// Codec channel
// ============================================================================

/// Requests a codec driver sends on its codec channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecRequest {
    GetIds,
    SendCorbCmd { nid: u16, verb: u32, no_ack: bool },
    RequestStream { input: bool },
    ReleaseStream { stream_id: u16 },
    SetStreamFormat { stream_id: u16, format: u16 },
}

impl CodecRequest {
    pub fn decode(bytes: &[u8]) -> HdaResult<(u32, Self)> {
        let hdr = Header::parse(bytes)?;
        let req = match hdr.code() {
            CODEC_GET_IDS => {
                expect_len(bytes, 0)?;
                CodecRequest::GetIds
            }
            CODEC_SEND_CORB_CMD => {
                let mut r = expect_len(bytes, 8)?;
                let nid = r.u16()?;
                r.skip(2)?;
                let verb = r.u32()?;
                CodecRequest::SendCorbCmd {
                    nid,
                    verb,
                    no_ack: hdr.no_ack(),
                }
            }
            CODEC_REQUEST_STREAM => {
                let mut r = expect_len(bytes, 4)?;
                CodecRequest::RequestStream { input: r.u8()? != 0 }
            }
            CODEC_RELEASE_STREAM => {
                let mut r = expect_len(bytes, 4)?;
                CodecRequest::ReleaseStream { stream_id: r.u16()? }
            }
            CODEC_SET_STREAM_FMT => {
                let mut r = expect_len(bytes, 4)?;
                CodecRequest::SetStreamFormat {
                    stream_id: r.u16()?,
                    format: r.u16()?,
                }
            }
            _ => return Err(HdaError::NotSupported),
        };
        Ok((hdr.transaction_id, req))
    }

    pub fn encode(&self, transaction_id: u32) -> Vec<u8> {
        match *self {
            CodecRequest::GetIds => Writer::new(CODEC_GET_IDS, transaction_id).finish(),
            CodecRequest::SendCorbCmd { nid, verb, no_ack } => {
                let cmd = CODEC_SEND_CORB_CMD | if no_ack { CMD_FLAG_NO_ACK } else { 0 };
                Writer::new(cmd, transaction_id).u16(nid).pad(2).u32(verb).finish()
            }
            CodecRequest::RequestStream { input } => Writer::new(CODEC_REQUEST_STREAM, transaction_id)
                .u8(input as u8)
                .pad(3)
                .finish(),
            CodecRequest::ReleaseStream { stream_id } => Writer::new(CODEC_RELEASE_STREAM, transaction_id)
                .u16(stream_id)
                .pad(2)
                .finish(),
            CodecRequest::SetStreamFormat { stream_id, format } => {
                Writer::new(CODEC_SET_STREAM_FMT, transaction_id)
                    .u16(stream_id)
                    .u16(format)
                    .finish()
            }
        }
    }
}

/// Replies and notifications on the codec channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecReply {
    Ids {
        vendor_id: u16,
        device_id: u16,
        major_rev: u8,
        minor_rev: u8,
        revision_id: u8,
        stepping_id: u8,
    },
    CorbResponse { data: u32, data_ex: u32 },
    Stream { stream_id: u16, tag: u8 },
    StreamReleased,
    /// Carries a ring-buffer side channel as the message capability
    FormatSet,
    Unsolicited { data: u32, data_ex: u32 },
    Error { status: u32 },
}

impl CodecReply {
    pub fn encode(&self, transaction_id: u32) -> Vec<u8> {
        match *self {
            CodecReply::Ids {
                vendor_id,
                device_id,
                major_rev,
                minor_rev,
                revision_id,
                stepping_id,
            } => Writer::new(CODEC_GET_IDS, transaction_id)
                .u16(vendor_id)
                .u16(device_id)
                .u8(major_rev)
                .u8(minor_rev)
                .u8(revision_id)
                .u8(stepping_id)
                .finish(),
            CodecReply::CorbResponse { data, data_ex } => Writer::new(CODEC_SEND_CORB_CMD, transaction_id)
                .u32(data)
                .u32(data_ex)
                .finish(),
            CodecReply::Stream { stream_id, tag } => Writer::new(CODEC_REQUEST_STREAM, transaction_id)
                .u16(stream_id)
                .u8(tag)
                .pad(1)
                .finish(),
            CodecReply::StreamReleased => Writer::new(CODEC_RELEASE_STREAM, transaction_id).finish(),
            CodecReply::FormatSet => Writer::new(CODEC_SET_STREAM_FMT, transaction_id).finish(),
            CodecReply::Unsolicited { data, data_ex } => Writer::new(CODEC_UNSOLICITED, transaction_id)
                .u32(data)
                .u32(data_ex)
                .finish(),
            CodecReply::Error { status } => Writer::new(REPLY_ERROR, transaction_id).u32(status).finish(),
        }
    }

    pub fn decode(bytes: &[u8]) -> HdaResult<(u32, Self)> {
        let hdr = Header::parse(bytes)?;
        let reply = match hdr.code() {
            CODEC_GET_IDS => {
                let mut r = expect_len(bytes, 8)?;
                CodecReply::Ids {
                    vendor_id: r.u16()?,
                    device_id: r.u16()?,
                    major_rev: r.u8()?,
                    minor_rev: r.u8()?,
                    revision_id: r.u8()?,
                    stepping_id: r.u8()?,
                }
            }
            CODEC_SEND_CORB_CMD => {
                let mut r = expect_len(bytes, 8)?;
                CodecReply::CorbResponse {
                    data: r.u32()?,
                    data_ex: r.u32()?,
                }
            }
            CODEC_REQUEST_STREAM => {
                let mut r = expect_len(bytes, 4)?;
                CodecReply::Stream {
                    stream_id: r.u16()?,
                    tag: r.u8()?,
                }
            }
            CODEC_RELEASE_STREAM => {
                expect_len(bytes, 0)?;
                CodecReply::StreamReleased
            }
            CODEC_SET_STREAM_FMT => {
                expect_len(bytes, 0)?;
                CodecReply::FormatSet
            }
            CODEC_UNSOLICITED => {
                let mut r = expect_len(bytes, 8)?;
                CodecReply::Unsolicited {
                    data: r.u32()?,
                    data_ex: r.u32()?,
                }
            }
            REPLY_ERROR => {
                let mut r = expect_len(bytes, 4)?;
                CodecReply::Error { status: r.u32()? }
            }
            _ => return Err(HdaError::NotSupported),
        };
        Ok((hdr.transaction_id, reply))
    }

    pub fn error(err: &HdaError) -> Self {
        CodecReply::Error {
            status: status_of(err),
        }
    }
}

// ============================================================================
// Ring-buffer side channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferRequest {
    GetFifoDepth,
    Start,
    Stop,
    GetPosition,
}

impl RingBufferRequest {
    pub fn decode(bytes: &[u8]) -> HdaResult<(u32, Self)> {
        let hdr = Header::parse(bytes)?;
        let req = match hdr.code() {
            RB_GET_FIFO_DEPTH => RingBufferRequest::GetFifoDepth,
            RB_START => RingBufferRequest::Start,
            RB_STOP => RingBufferRequest::Stop,
            RB_GET_POSITION => RingBufferRequest::GetPosition,
            _ => return Err(HdaError::NotSupported),
        };
        expect_len(bytes, 0)?;
        Ok((hdr.transaction_id, req))
    }

    pub fn encode(&self, transaction_id: u32) -> Vec<u8> {
        let cmd = match self {
            RingBufferRequest::GetFifoDepth => RB_GET_FIFO_DEPTH,
            RingBufferRequest::Start => RB_START,
            RingBufferRequest::Stop => RB_STOP,
            RingBufferRequest::GetPosition => RB_GET_POSITION,
        };
        Writer::new(cmd, transaction_id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferReply {
    FifoDepth { bytes: u32 },
    Started,
    Stopped,
    Position { position: u32 },
    Error { status: u32 },
}

impl RingBufferReply {
    pub fn encode(&self, transaction_id: u32) -> Vec<u8> {
        match *self {
            RingBufferReply::FifoDepth { bytes } => {
                Writer::new(RB_GET_FIFO_DEPTH, transaction_id).u32(bytes).finish()
            }
            RingBufferReply::Started => Writer::new(RB_START, transaction_id).finish(),
            RingBufferReply::Stopped => Writer::new(RB_STOP, transaction_id).finish(),
            RingBufferReply::Position { position } => {
                Writer::new(RB_GET_POSITION, transaction_id).u32(position).finish()
            }
            RingBufferReply::Error { status } => Writer::new(REPLY_ERROR, transaction_id).u32(status).finish(),
        }
    }

    pub fn decode(bytes: &[u8]) -> HdaResult<(u32, Self)> {
        let hdr = Header::parse(bytes)?;
        let reply = match hdr.code() {
            RB_GET_FIFO_DEPTH => RingBufferReply::FifoDepth {
                bytes: expect_len(bytes, 4)?.u32()?,
            },
            RB_START => {
                expect_len(bytes, 0)?;
                RingBufferReply::Started
            }
            RB_STOP => {
                expect_len(bytes, 0)?;
                RingBufferReply::Stopped
            }
            RB_GET_POSITION => RingBufferReply::Position {
                position: expect_len(bytes, 4)?.u32()?,
            },
            REPLY_ERROR => RingBufferReply::Error {
                status: expect_len(bytes, 4)?.u32()?,
            },
            _ => return Err(HdaError::NotSupported),
        };
        Ok((hdr.transaction_id, reply))
    }
}

// ============================================================================
// Stream client channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClientRequest {
    SetFormat { sample_rate: u32, bits: u8, channels: u8 },
}

impl StreamClientRequest {
    pub fn decode(bytes: &[u8]) -> HdaResult<(u32, Self)> {
        let hdr = Header::parse(bytes)?;
        match hdr.code() {
            STREAM_SET_FORMAT => {
                let mut r = expect_len(bytes, 8)?;
                let sample_rate = r.u32()?;
                let bits = r.u8()?;
                let channels = r.u8()?;
                Ok((
                    hdr.transaction_id,
                    StreamClientRequest::SetFormat {
                        sample_rate,
                        bits,
                        channels,
                    },
                ))
            }
            _ => Err(HdaError::NotSupported),
        }
    }

    pub fn encode(&self, transaction_id: u32) -> Vec<u8> {
        match *self {
            StreamClientRequest::SetFormat {
                sample_rate,
                bits,
                channels,
            } => Writer::new(STREAM_SET_FORMAT, transaction_id)
                .u32(sample_rate)
                .u8(bits)
                .u8(channels)
                .pad(2)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClientReply {
    /// Carries the ring-buffer side channel as the message capability
    FormatSet,
    Error { status: u32 },
}

impl StreamClientReply {
    pub fn encode(&self, transaction_id: u32) -> Vec<u8> {
        match *self {
            StreamClientReply::FormatSet => Writer::new(STREAM_SET_FORMAT, transaction_id).finish(),
            StreamClientReply::Error { status } => {
                Writer::new(REPLY_ERROR, transaction_id).u32(status).finish()
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> HdaResult<(u32, Self)> {
        let hdr = Header::parse(bytes)?;
        let reply = match hdr.code() {
            STREAM_SET_FORMAT => {
                expect_len(bytes, 0)?;
                StreamClientReply::FormatSet
            }
            REPLY_ERROR => StreamClientReply::Error {
                status: expect_len(bytes, 4)?.u32()?,
            },
            _ => return Err(HdaError::NotSupported),
        };
        Ok((hdr.transaction_id, reply))
    }
}
