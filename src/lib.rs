// 导出模块
pub mod klcommon;
pub mod kldata;
pub mod kldump;
pub mod klfeed;
pub mod klspider;
pub mod klstore;

// Re-export error types
pub use klcommon::error::{AppError, Result};
