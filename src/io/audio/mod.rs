// ============================================================================
// src/io/audio/mod.rs - Audio Subsystem Module
// ============================================================================
//!
//! # オーディオサブシステム
//!
//! Intel HD Audio コントローラコアとクライアント側ドライバフレームワーク。
//!
//! ## モジュール
//! - `hda`: コントローラ側（CORB/RIRB、ストリームプール、コーデック）
//! - `driver`: コーデックドライバとストリーム
//! - `regs`: HDA レジスタ定義

pub mod driver;
pub mod hda;
pub mod regs;

// Re-export main types
pub use driver::{CodecDriver, ConverterHooks, DriverStream, StreamContext, StreamHooks};
pub use hda::{
    CodecDeviceInfo, DeviceHost, HdaBus, HdaController, LifecycleEvent, NullDeviceHost, StreamDeviceInfo,
    StreamFormat,
};
