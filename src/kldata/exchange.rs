//! 交易所抽象
//!
//! 爬虫和下载器只通过 [`Exchange`] 访问交易所：REST 拉取K线，
//! 以及按数据流类型订阅/退订 websocket 推送。

use crate::klcommon::{AppError, Kline, MarkPrice, OrderBook, Result, Trade};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// websocket 数据流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// K线：现货 1s，合约 1m
    Ohlcv,
    Trade,
    /// 订单簿
    Depth,
    /// 标记价格，仅合约市场
    Price,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [StreamKind::Ohlcv, StreamKind::Trade, StreamKind::Depth, StreamKind::Price];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Ohlcv => "ohlcv",
            StreamKind::Trade => "trade",
            StreamKind::Depth => "depth",
            StreamKind::Price => "price",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "ohlcv" => Ok(StreamKind::Ohlcv),
            "trade" => Ok(StreamKind::Trade),
            "depth" | "book" => Ok(StreamKind::Depth),
            "price" | "mark" => Ok(StreamKind::Price),
            other => Err(AppError::DataError(format!("未知的数据流类型: {}", other))),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 交易所推送的一批数据
#[derive(Debug, Clone, PartialEq)]
pub enum StreamBatch {
    /// 同一品种的K线，按时间升序；last_closed 为 false 时最后一根仍在形成
    Klines { symbol: String, tf_ms: i64, bars: Vec<Kline>, last_closed: bool },
    Trades(Vec<Trade>),
    Depth(Vec<OrderBook>),
    Prices(Vec<MarkPrice>),
    /// 数据流已终止（连接断开、被服务端关闭等），之后不会再有数据
    Closed { reason: String },
}

impl StreamBatch {
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamBatch::Closed { .. })
    }
}

/// 交易所接口
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// 该市场 ohlcv 推送的周期
    fn ohlcv_tf(&self, market: &str) -> &'static str {
        if market == "spot" {
            "1s"
        } else {
            "1m"
        }
    }

    /// 拉取 [since_ms, end_ms) 内最多 limit 根K线，升序
    async fn fetch_ohlcv(
        &self,
        market: &str,
        symbol: &str,
        tf: &str,
        since_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Kline>>;

    /// 订阅数据流，推送写入 tx；数据流结束时必须发送一条 [`StreamBatch::Closed`]
    ///
    /// 同一 (market, kind) 多次调用时追加品种。
    async fn watch(
        &self,
        market: &str,
        kind: StreamKind,
        symbols: &[String],
        tx: mpsc::Sender<StreamBatch>,
    ) -> Result<()>;

    /// 退订品种
    async fn unwatch(&self, market: &str, kind: StreamKind, symbols: &[String]) -> Result<()>;
}

pub type ExchangeRef = Arc<dyn Exchange>;
