// ============================================================================
// I/O Subsystem Module
// ============================================================================
pub mod audio;
pub mod log;
