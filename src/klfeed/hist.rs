//! 回放用的喂入器：从存储分批读取K线，逐根推进模拟时钟

use super::feeder::{BarHandler, Feeder};
use crate::kldata::Downloader;
use crate::klcommon::timeframe::tf_to_ms;
use crate::klcommon::{Kline, Result, SimClock};
use crate::klstore::KlineStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 每次从存储读取的K线数量
pub const HIST_BATCH_SIZE: usize = 3000;

/// Provider 持有的喂入器
pub trait KlineFeeder: Send {
    fn symbol(&self) -> &str;

    fn feeder(&self) -> &Feeder;

    fn feeder_mut(&mut self) -> &mut Feeder;
}

/// 可被回放调度器驱动的喂入器
pub trait HistFeeder: KlineFeeder {
    /// 下一根缓存K线的时间，耗尽时为 i64::MAX
    fn next_ms(&self) -> i64;

    fn get_bar(&self) -> Option<Kline>;

    /// 指针后移，必要时预读下一批
    fn call_next(&mut self) -> Result<()>;

    fn run_bar(&mut self, bar: &Kline, handler: &mut dyn BarHandler) -> Result<()>;

    /// 从 since_ms 开始回放到 end_ms
    fn seek(&mut self, since_ms: i64, end_ms: i64) -> Result<()>;
}

impl KlineFeeder for Feeder {
    fn symbol(&self) -> &str {
        Feeder::symbol(self)
    }

    fn feeder(&self) -> &Feeder {
        self
    }

    fn feeder_mut(&mut self) -> &mut Feeder {
        self
    }
}

pub struct HistKLineFeeder {
    feeder: Feeder,
    store: KlineStore,
    clock: Arc<SimClock>,
    cache: Vec<Kline>,
    idx: usize,
    next_load_ms: i64,
    end_ms: i64,
    batch: usize,
    exhausted: bool,
}

impl HistKLineFeeder {
    /// feeder 的时钟应当与 clock 是同一个模拟时钟
    pub fn new(feeder: Feeder, store: KlineStore, clock: Arc<SimClock>) -> Self {
        Self {
            feeder,
            store,
            clock,
            cache: Vec::new(),
            idx: 0,
            next_load_ms: 0,
            end_ms: 0,
            batch: HIST_BATCH_SIZE,
            exhausted: true,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn store(&self) -> &KlineStore {
        &self.store
    }

    fn head_tf(&self) -> Option<(String, i64)> {
        self.feeder.head().map(|s| (s.tf.clone(), s.tf_ms))
    }

    /// 读取下一批，跳过整批为空的窗口
    fn load_batch(&mut self) -> Result<()> {
        self.cache.clear();
        self.idx = 0;
        let Some((tf, tf_ms)) = self.head_tf() else {
            self.exhausted = true;
            return Ok(());
        };
        let span = tf_ms.saturating_mul(self.batch as i64);
        while self.next_load_ms < self.end_ms {
            let start = self.next_load_ms;
            let stop = self.end_ms.min(start.saturating_add(span));
            self.next_load_ms = stop;
            let bars = self.store.query_ohlcv(self.feeder.exsymbol().id, &tf, start, stop, 0, false)?;
            if !bars.is_empty() {
                debug!(target: "klfeed", symbol = %self.feeder.symbol(), tf = %tf, start, stop, count = bars.len(), "读取回放K线");
                self.cache = bars;
                return Ok(());
            }
        }
        self.exhausted = true;
        Ok(())
    }
}

impl KlineFeeder for HistKLineFeeder {
    fn symbol(&self) -> &str {
        self.feeder.symbol()
    }

    fn feeder(&self) -> &Feeder {
        &self.feeder
    }

    fn feeder_mut(&mut self) -> &mut Feeder {
        &mut self.feeder
    }
}

impl HistFeeder for HistKLineFeeder {
    fn next_ms(&self) -> i64 {
        match self.cache.get(self.idx) {
            Some(bar) => bar.time,
            None => i64::MAX,
        }
    }

    fn get_bar(&self) -> Option<Kline> {
        self.cache.get(self.idx).copied()
    }

    fn call_next(&mut self) -> Result<()> {
        self.idx += 1;
        if self.idx >= self.cache.len() && !self.exhausted {
            self.load_batch()?;
        }
        Ok(())
    }

    fn run_bar(&mut self, bar: &Kline, handler: &mut dyn BarHandler) -> Result<()> {
        let Some((_, tf_ms)) = self.head_tf() else {
            return Ok(());
        };
        self.clock.set(bar.time + tf_ms);
        self.feeder.on_new_bars(tf_ms, std::slice::from_ref(bar), handler)
    }

    fn seek(&mut self, since_ms: i64, end_ms: i64) -> Result<()> {
        self.feeder.seek(since_ms);
        let start = self.feeder.head().map(|s| s.next_ms).unwrap_or(since_ms);
        self.next_load_ms = start;
        self.end_ms = end_ms;
        self.exhausted = false;
        self.load_batch()
    }
}

/// 首次使用前补齐缺失区间的回放喂入器
pub struct DbKlineFeeder {
    inner: HistKLineFeeder,
    downloader: Downloader,
    downloaded: bool,
}

impl DbKlineFeeder {
    pub fn new(inner: HistKLineFeeder, downloader: Downloader) -> Self {
        Self { inner, downloader, downloaded: false }
    }

    /// 下载每个周期缺失的数据，只执行一次；预热需要的K线一并下载
    pub async fn download_missing(&mut self, tf_warms: &BTreeMap<String, usize>, start_ms: i64, end_ms: i64) -> Result<usize> {
        if self.downloaded {
            return Ok(0);
        }
        let exs = self.inner.feeder.exsymbol().clone();
        let mut total = 0;
        for tf in self.inner.feeder.tfs() {
            let warm = tf_warms.get(&tf).copied().unwrap_or(0) as i64;
            let from = start_ms - warm * tf_to_ms(&tf)?;
            total += self.downloader.download(&exs, &tf, from, end_ms).await?;
        }
        self.downloaded = true;
        info!(target: "klfeed", symbol = %exs.symbol, bars = total, "回放数据补齐完成");
        Ok(total)
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded
    }
}

impl KlineFeeder for DbKlineFeeder {
    fn symbol(&self) -> &str {
        self.inner.symbol()
    }

    fn feeder(&self) -> &Feeder {
        self.inner.feeder()
    }

    fn feeder_mut(&mut self) -> &mut Feeder {
        self.inner.feeder_mut()
    }
}

impl HistFeeder for DbKlineFeeder {
    fn next_ms(&self) -> i64 {
        self.inner.next_ms()
    }

    fn get_bar(&self) -> Option<Kline> {
        self.inner.get_bar()
    }

    fn call_next(&mut self) -> Result<()> {
        self.inner.call_next()
    }

    fn run_bar(&mut self, bar: &Kline, handler: &mut dyn BarHandler) -> Result<()> {
        self.inner.run_bar(bar, handler)
    }

    fn seek(&mut self, since_ms: i64, end_ms: i64) -> Result<()> {
        self.inner.seek(since_ms, end_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::timeframe::MINUTE_MS;
    use crate::klcommon::Clock;
    use crate::klstore::test_util::temp_store;

    const T0: i64 = 1_699_999_980_000;

    struct Count(usize);

    impl BarHandler for Count {
        fn on_bar(&mut self, _symbol: &str, _tf: &str, _bar: &Kline, _is_warmup: bool) {
            self.0 += 1;
        }
    }

    #[test]
    fn test_batches_and_sim_clock() {
        let (_dir, store, _) = temp_store(T0 + 100 * MINUTE_MS);
        let exs = store.get_exsymbol("binance", "linear", "BTCUSDT").unwrap();
        let bars: Vec<Kline> = (0..10).map(|i| Kline::flat(T0 + i * MINUTE_MS, 1.0)).collect();
        store.insert_klines("1m", exs.id, &bars).unwrap();

        let clock = Arc::new(SimClock::new(0));
        let mut feeder = Feeder::new(exs, clock.clone(), 0.0);
        feeder.sub_tfs(&["1m".to_string()], false).unwrap();
        let mut hist = HistKLineFeeder::new(feeder, store, clock.clone()).with_batch(3);
        hist.seek(T0, T0 + 10 * MINUTE_MS).unwrap();

        let mut count = Count(0);
        while let Some(bar) = hist.get_bar() {
            hist.call_next().unwrap();
            hist.run_bar(&bar, &mut count).unwrap();
            assert_eq!(clock.now_ms(), bar.time + MINUTE_MS);
        }
        assert_eq!(count.0, 10);
        assert_eq!(hist.next_ms(), i64::MAX);
    }

    #[test]
    fn test_skips_empty_windows() {
        let (_dir, store, _) = temp_store(T0 + 100 * MINUTE_MS);
        let exs = store.get_exsymbol("binance", "linear", "ETHUSDT").unwrap();
        store.insert_klines("1m", exs.id, &[Kline::flat(T0 + 50 * MINUTE_MS, 1.0)]).unwrap();

        let clock = Arc::new(SimClock::new(0));
        let mut feeder = Feeder::new(exs, clock.clone(), 0.0);
        feeder.sub_tfs(&["1m".to_string()], false).unwrap();
        let mut hist = HistKLineFeeder::new(feeder, store, clock).with_batch(5);
        hist.seek(T0, T0 + 60 * MINUTE_MS).unwrap();
        assert_eq!(hist.next_ms(), T0 + 50 * MINUTE_MS);
    }
}
