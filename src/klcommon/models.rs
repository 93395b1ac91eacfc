use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// K线 - 存储与传输统一格式
///
/// `time` 为开盘时间（毫秒），周期为 T 的 K 线满足 `time % tf_ms == 0`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Kline {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// 附加信息（如持仓量），没有时为 0
    #[serde(default)]
    pub info: f64,
}

impl Kline {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self { time, open, high, low, close, volume, info: 0.0 }
    }

    /// 以收盘价生成一根量为0的平K线
    pub fn flat(time: i64, price: f64) -> Self {
        Self::new(time, price, price, price, price, 0.0)
    }

    /// 合并一根同桶内更晚的K线
    pub fn merge(&mut self, other: &Kline) {
        if other.high > self.high {
            self.high = other.high;
        }
        if other.low < self.low {
            self.low = other.low;
        }
        self.close = other.close;
        self.volume += other.volume;
        self.info = other.info;
    }
}

/// 交易品种的唯一标识
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExSymbol {
    pub id: i32,
    pub exchange: String,
    pub exg_real: String,
    pub market: String,
    pub symbol: String,
    /// 组合/连续合约，永远不直接下载
    pub combined: bool,
    pub list_ms: i64,
    pub delist_ms: i64,
}

impl ExSymbol {
    /// 尚未入库的品种描述，id 由存储层分配
    pub fn new_key(exchange: &str, market: &str, symbol: &str) -> Self {
        Self {
            id: 0,
            exchange: exchange.to_string(),
            exg_real: exchange.to_string(),
            market: market.to_string(),
            symbol: symbol.to_string(),
            combined: false,
            list_ms: 0,
            delist_ms: 0,
        }
    }

    pub fn key(&self) -> (String, String, String) {
        (self.exchange.clone(), self.market.clone(), self.symbol.clone())
    }
}

/// (sid, tf) 的有效连续区间 [start, stop)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KInfo {
    pub sid: i32,
    pub start: i64,
    pub stop: i64,
}

/// KInfo 区间内的缺口
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KHole {
    pub id: i64,
    pub sid: i32,
    pub timeframe: String,
    pub start: i64,
    pub stop: i64,
    /// true 表示交易所已确认该区间无数据
    pub no_data: bool,
}

/// 正在形成中的K线（kline_un 表的一行）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnfinishedBar {
    pub sid: i32,
    pub start: i64,
    pub stop: i64,
    pub bar: Kline,
}

/// 复权因子，作用于 [start_ms, 下一个因子的 start_ms)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjFactor {
    pub id: i64,
    pub sid: i32,
    pub sub_id: i32,
    pub start_ms: i64,
    pub factor: f64,
}

/// 查询区间内生效的复权窗口
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjInfo {
    pub sid: i32,
    pub sub_id: i32,
    pub start_ms: i64,
    pub stop_ms: i64,
    pub factor: f64,
    /// 从第一个窗口起的累计乘积
    pub cum_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjMode {
    None,
    /// 前复权：最新窗口保持原价
    Front,
    /// 后复权：最早窗口保持原价
    Back,
}

/// 交易日历区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: i64,
    pub name: String,
    pub start_ms: i64,
    pub stop_ms: i64,
}

/// 逐笔成交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub id: i64,
    pub price: f64,
    pub amount: f64,
    pub time: i64,
    pub is_buyer_maker: bool,
}

/// 订单簿快照
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub time: i64,
    /// [price, amount]
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
}

/// 标记价格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPrice {
    pub symbol: String,
    pub price: f64,
    pub time: i64,
}

/// ohlcv/uohlcv 消息体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyKLines {
    #[serde(rename = "tfSecs")]
    pub tf_secs: i32,
    pub interval: i32,
    pub bars: Vec<Kline>,
}

pub type PriceMap = HashMap<String, f64>;
