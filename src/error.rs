//! 統一エラーハンドリングモジュール
//!
//! HDA コントローラコア全体で使用される統一エラー型を定義します。
//! 要求単位のエラーは呼び出し元へ返され、ハードウェア起因の致命的エラーは
//! `Fatal` としてログに残したうえで処理を継続します。

use alloc::string::String;
use core::fmt;

/// コア全体の統一エラー型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HdaError {
    /// Malformed or undersized request, bad node id or verb
    InvalidArgument,
    /// Operation attempted outside its valid lifecycle phase
    BadState,
    /// Unknown transaction/stream id, or target already gone
    NotFound,
    /// No free stream, tag or slot
    ResourceExhausted,
    /// Unrecognized command code
    NotSupported,
    /// A single-client object already has a client attached
    AlreadyBound,
    /// The other end of a transport went away
    PeerClosed,
    /// Nothing to read yet
    ShouldWait,
    /// Bounded hardware wait expired
    Timeout,
    /// Controller bring-up failed
    InitFailed(String),
    /// DMA memory could not be allocated
    AllocFailed,
    /// Unrecoverable hardware condition
    Fatal(FatalKind),
}

/// 致命的エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// CORB memory error (CORBSTS.CMEI)
    CorbMemoryError,
    /// RIRB overrun (RIRBSTS.RIRBOIS), responses were dropped by hardware
    RirbOverrun,
    /// Codec protocol violation detected while probing or operating
    ProtocolViolation,
}

pub type HdaResult<T> = Result<T, HdaError>;

impl HdaError {
    /// 致命的エラーかどうか
    pub fn is_fatal(&self) -> bool {
        matches!(self, HdaError::Fatal(_))
    }

    /// リソース枯渇（回復可能）かどうか
    pub fn is_exhausted(&self) -> bool {
        matches!(self, HdaError::ResourceExhausted)
    }
}

// ===== Display implementations =====

impl fmt::Display for HdaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HdaError::InvalidArgument => write!(f, "invalid argument"),
            HdaError::BadState => write!(f, "bad state"),
            HdaError::NotFound => write!(f, "not found"),
            HdaError::ResourceExhausted => write!(f, "resource exhausted"),
            HdaError::NotSupported => write!(f, "not supported"),
            HdaError::AlreadyBound => write!(f, "already bound"),
            HdaError::PeerClosed => write!(f, "peer closed"),
            HdaError::ShouldWait => write!(f, "should wait"),
            HdaError::Timeout => write!(f, "timed out"),
            HdaError::InitFailed(msg) => write!(f, "init failed: {}", msg),
            HdaError::AllocFailed => write!(f, "DMA allocation failed"),
            HdaError::Fatal(kind) => write!(f, "fatal: {}", kind),
        }
    }
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalKind::CorbMemoryError => write!(f, "CORB memory error"),
            FatalKind::RirbOverrun => write!(f, "RIRB overrun"),
            FatalKind::ProtocolViolation => write!(f, "codec protocol violation"),
        }
    }
}

impl core::error::Error for HdaError {}
