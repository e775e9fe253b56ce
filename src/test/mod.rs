// ============================================================================
// src/test/mod.rs - Simulation Support
// テストとデモで使うソフトウェアモデル
// ============================================================================

pub mod recorder;
pub mod sim_hda;

pub use recorder::{EventRecorder, Recorded};
pub use sim_hda::{SimCodec, SimHda, SimHdaBuilder};
