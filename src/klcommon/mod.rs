// 导出共享模块
pub mod btime;
pub mod config;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod problem_summary;
pub mod retry_waits;
pub mod timeframe;

// 重新导出常用类型，方便使用
pub use btime::{Clock, ClockRef, LiveClock, SimClock};
pub use config::AppConfig;
pub use error::{AppError, Result};
pub use models::{
    AdjFactor, AdjInfo, AdjMode, Calendar, ExSymbol, KHole, KInfo, Kline, MarkPrice, NotifyKLines,
    OrderBook, PriceMap, Trade, UnfinishedBar,
};
pub use retry_waits::RetryWaits;
