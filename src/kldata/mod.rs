// 行情数据获取：交易所接入、K线聚合与历史下载
pub mod aggregator;
pub mod binance;
pub mod downloader;
pub mod exchange;

// 重新导出常用类型，方便使用
pub use aggregator::build_ohlcv;
pub use binance::BinanceExchange;
pub use downloader::{plan_intervals, Downloader, FetchInterval};
pub use exchange::{Exchange, ExchangeRef, StreamBatch, StreamKind};
