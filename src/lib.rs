//! # rany_hda
//!
//! Intel HD Audio コントローラの制御プレーン。
//!
//! - `ipc`: 論理接続を小さなワーカープールへ多重化するディスパッチランタイム
//! - `io::audio::hda`: CORB/RIRB エンジン、DMA ストリームプール、コーデックのライフサイクル
//! - `io::audio::driver`: クライアント側コーデックドライバとストリーム
//! - `test`: ソフトウェアコントローラモデル（テスト・デモ用）

extern crate alloc;

pub mod config;
pub mod error;
pub mod io;
pub mod ipc;
pub mod sync;
pub mod test;

pub use config::{ControllerConfig, RuntimeConfig};
pub use error::{FatalKind, HdaError, HdaResult};
