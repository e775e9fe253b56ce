// ============================================================================
// src/io/audio/hda/mod.rs - Intel High Definition Audio Controller Core
// ============================================================================
//!
//! # Intel HD Audio コントローラコア
//!
//! コントローラ側の制御プレーン。
//!
//! ## モジュール構成
//! - `bus` - レジスタアクセスと DMA メモリの抽象化
//! - `types` - コーデックコマンド / 応答 / 識別情報
//! - `corb_rirb` - コマンド・応答リングエンジン
//! - `stream` - DMA ストリーム記述子
//! - `stream_pool` - ストリームプールとタグ割り当て
//! - `codec` - コーデックのライフサイクル
//! - `controller` - HdaController の実装
//! - `irq` - 割り込みスレッド
//! - `proto` - クライアント向けメッセージ形式
//! - `device` - デバイス公開ホストとライフサイクルイベント
//! - `stats` - 統計カウンタ
//! - `regs` - レジスタ定義（親モジュールから）

pub mod bus;
pub mod codec;
pub mod controller;
pub mod corb_rirb;
pub mod device;
mod irq;
pub mod proto;
pub mod stats;
pub mod stream;
pub mod stream_pool;
pub mod types;

// 親モジュールのレジスタ定義を使用
use super::regs;

pub use bus::{DmaBuffer, HdaBus, InterruptLine, IrqSignal, MmioBus};
pub use codec::{Codec, CodecState};
pub use controller::{ControllerCaps, ControllerState, HdaController};
pub use corb_rirb::{RingEngine, RingResponse};
pub use device::{CodecDeviceInfo, DeviceHost, LifecycleEvent, NullDeviceHost, StreamDeviceInfo};
pub use stats::{ControllerStats, StatsSnapshot};
pub use stream::{DmaStream, StreamFormat, StreamType};
pub use stream_pool::{StreamPool, TagAllocator};
pub use types::{CodecCmdJob, CodecCommand, CodecIdentity, CodecResponse};
