#![allow(dead_code)]

use async_trait::async_trait;
use kline_hub::kldata::{Exchange, StreamBatch, StreamKind};
use kline_hub::klcommon::timeframe::MINUTE_MS;
use kline_hub::klcommon::{AppError, Kline, Result, SimClock};
use kline_hub::klfeed::BarHandler;
use kline_hub::klstore::KlineStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// 整分钟，且距离5分钟边界3分钟
pub const T0: i64 = 1_699_999_980_000;

pub fn minute(m: i64) -> i64 {
    T0 + m * MINUTE_MS
}

pub fn temp_store(now_ms: i64) -> (tempfile::TempDir, KlineStore, Arc<SimClock>) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(SimClock::new(now_ms));
    let store = KlineStore::open(dir.path().join("kline.db"), 4, clock.clone()).unwrap();
    (dir, store, clock)
}

pub fn minute_bars(minutes: &[i64]) -> Vec<Kline> {
    minutes
        .iter()
        .map(|m| Kline::new(minute(*m), 100.0 + *m as f64, 101.0 + *m as f64, 99.0 + *m as f64, 100.5 + *m as f64, 10.0))
        .collect()
}

/// 按 (品种, 周期, 时间, 是否预热) 记录回调
#[derive(Debug, Default, Clone)]
pub struct Record(pub Vec<(String, String, i64, bool)>);

impl BarHandler for Record {
    fn on_bar(&mut self, symbol: &str, tf: &str, bar: &Kline, is_warmup: bool) {
        self.0.push((symbol.to_string(), tf.to_string(), bar.time, is_warmup));
    }
}

/// 内存交易所：REST 从预置K线里取，watch 保存推送通道供测试注入
#[derive(Default)]
pub struct FakeExchange {
    bars: Mutex<HashMap<String, Vec<Kline>>>,
    fetches: Mutex<Vec<(String, i64, i64)>>,
    watches: Mutex<Vec<(StreamKind, Vec<String>)>>,
    senders: Mutex<HashMap<StreamKind, mpsc::Sender<StreamBatch>>>,
    /// 品种 → 成功请求次数上限，超过后返回 ApiError
    failing: Mutex<HashMap<String, usize>>,
}

impl FakeExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<Kline>) {
        self.bars.lock().unwrap().insert(symbol.to_string(), bars);
    }

    /// 该品种的 REST 请求一律返回 ApiError
    pub fn fail_fetch(&self, symbol: &str) {
        self.fail_fetch_after(symbol, 0);
    }

    /// 前 ok_calls 次请求正常，之后返回 ApiError
    pub fn fail_fetch_after(&self, symbol: &str, ok_calls: usize) {
        self.failing.lock().unwrap().insert(symbol.to_string(), ok_calls);
    }

    /// 每次 fetch_ohlcv 的 (品种, since, end)
    pub fn fetches(&self) -> Vec<(String, i64, i64)> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn watches(&self) -> Vec<(StreamKind, Vec<String>)> {
        self.watches.lock().unwrap().clone()
    }

    pub fn sender(&self, kind: StreamKind) -> Option<mpsc::Sender<StreamBatch>> {
        self.senders.lock().unwrap().get(&kind).cloned()
    }

    /// 等待某类数据流被订阅
    pub async fn wait_sender(&self, kind: StreamKind) -> mpsc::Sender<StreamBatch> {
        for _ in 0..200 {
            if let Some(tx) = self.sender(kind) {
                return tx;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stream {} was never watched", kind);
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    fn name(&self) -> &str {
        "binance"
    }

    async fn fetch_ohlcv(
        &self,
        _market: &str,
        symbol: &str,
        _tf: &str,
        since_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let calls = {
            let mut fetches = self.fetches.lock().unwrap();
            fetches.push((symbol.to_string(), since_ms, end_ms));
            fetches.iter().filter(|f| f.0 == symbol).count()
        };
        if let Some(ok_calls) = self.failing.lock().unwrap().get(symbol) {
            if calls > *ok_calls {
                return Err(AppError::ApiError(format!("{} unavailable", symbol)));
            }
        }
        let bars = self.bars.lock().unwrap();
        let Some(all) = bars.get(symbol) else {
            return Ok(Vec::new());
        };
        Ok(all
            .iter()
            .filter(|b| b.time >= since_ms && (end_ms <= 0 || b.time < end_ms))
            .take(limit.max(1))
            .copied()
            .collect())
    }

    async fn watch(
        &self,
        _market: &str,
        kind: StreamKind,
        symbols: &[String],
        tx: mpsc::Sender<StreamBatch>,
    ) -> Result<()> {
        self.watches.lock().unwrap().push((kind, symbols.to_vec()));
        self.senders.lock().unwrap().insert(kind, tx);
        Ok(())
    }

    async fn unwatch(&self, _market: &str, _kind: StreamKind, _symbols: &[String]) -> Result<()> {
        Ok(())
    }
}

/// 轮询直到条件成立
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
