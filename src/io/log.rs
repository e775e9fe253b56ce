// ============================================================================
// src/io/log.rs - Driver Logging System using the `log` crate
// ============================================================================
//!
//! ドライバ用ロギングシステム。
//!
//! ## 機能
//! - `log`クレートを使用した標準的なログインターフェース
//! - 標準エラー出力への行単位出力
//! - コンパイル時のログレベルフィルタリング
//! - マルチスレッド安全なSpinlock保護
//!
//! ## 使用方法
//! ```rust,ignore
//! use log::{info, debug, warn, error, trace};
//!
//! rany_hda::io::log::init().ok();
//! info!("[HDA] controller up");
//! ```

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

// ============================================================================
// ログレベル定義
// ============================================================================

/// コンパイル時のログレベル（featureで変更可能）
#[cfg(feature = "verbose_logging")]
const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;

#[cfg(not(feature = "verbose_logging"))]
const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

// ============================================================================
// ロガー状態管理
// ============================================================================

/// ロガーの初期化状態
static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// 現在のログレベル（実行時変更可能）
static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LevelFilter::Info as u8);

/// 出力排他制御用Spinlock
///
/// IRQスレッドとワーカースレッドの行が混ざらないようにする。
static OUTPUT_LOCK: Mutex<()> = Mutex::new(());

// ============================================================================
// ロガー実装
// ============================================================================

/// ドライバ用ロガー
struct DriverLogger;

impl DriverLogger {
    /// ログレベルのプレフィックスを取得
    fn level_prefix(level: Level) -> &'static str {
        match level {
            Level::Error => "[ERROR] ",
            Level::Warn => "[WARN]  ",
            Level::Info => "[INFO]  ",
            Level::Debug => "[DEBUG] ",
            Level::Trace => "[TRACE] ",
        }
    }
}

fn level_from_u8(raw: u8) -> LevelFilter {
    LevelFilter::iter()
        .nth(raw as usize)
        .unwrap_or(LevelFilter::Info)
}

impl Log for DriverLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= level_from_u8(CURRENT_LOG_LEVEL.load(Ordering::Relaxed))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let _guard = OUTPUT_LOCK.lock();
        let stderr = std::io::stderr();
        let mut out = stderr.lock();

        let _ = out.write_all(Self::level_prefix(record.level()).as_bytes());
        if let Some(module) = record.module_path() {
            let _ = write!(out, "[{}] ", module);
        }
        let _ = writeln!(out, "{}", record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// グローバルロガーインスタンス
static LOGGER: DriverLogger = DriverLogger;

// ============================================================================
// 公開API
// ============================================================================

/// ロギングシステムを初期化
///
/// 二度目以降の呼び出しは `SetLoggerError` を返す（テストでは無視してよい）。
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(MAX_LOG_LEVEL);
    CURRENT_LOG_LEVEL.store(MAX_LOG_LEVEL as u8, Ordering::SeqCst);
    LOGGER_INITIALIZED.store(true, Ordering::SeqCst);
    Ok(())
}

/// 実行時にログレベルを変更
pub fn set_log_level(level: LevelFilter) {
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
    log::set_max_level(level);
}

/// 現在のログレベルを取得
pub fn current_log_level() -> LevelFilter {
    level_from_u8(CURRENT_LOG_LEVEL.load(Ordering::Relaxed))
}

/// ロガーが初期化済みかどうか
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_roundtrip() {
        assert_eq!(level_from_u8(LevelFilter::Debug as u8), LevelFilter::Debug);
        assert_eq!(level_from_u8(200), LevelFilter::Info);
    }

    #[test]
    fn test_init_is_idempotent_enough() {
        let first = init();
        let second = init();
        // The second call always fails because the facade is already set.
        assert!(second.is_err());
        if first.is_ok() {
            assert!(is_initialized());
        }
    }
}
