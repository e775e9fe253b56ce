// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// ホスト実行用のブロッキング待機機構
// ============================================================================

pub mod wait_queue;

pub use wait_queue::{Completion, WaitQueue};
