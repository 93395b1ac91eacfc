//! 喂入器集合：交易对订阅与预热、实盘接入、回放调度
//!
//! `Provider<F>` 只管理品种到喂入器的映射和预热；实盘由 [`LiveProvider`] 绑定监听客户端，
//! 回放由 [`HistProvider`] 驱动 [`Provider::loop_main`]，按 (下一根时间, 品种) 全局排序逐根推进。

use super::feeder::{BarHandler, Feeder};
use super::hist::{DbKlineFeeder, HistFeeder, KlineFeeder};
use super::prices::PriceCache;
use super::refresh::RefreshSchedule;
use crate::kldata::StreamKind;
use crate::kldump::DumpWriter;
use crate::klcommon::timeframe::tf_to_ms;
use crate::klcommon::{AppError, ClockRef, OrderBook, PriceMap, Result, SimClock, Trade};
use crate::klspider::protocol::{ohlcv_tag, price_tag, uohlcv_tag};
use crate::klspider::{KLineHandler, KLineMsg, KLineWatcher, WatchReq};
use crate::klstore::KlineStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// 品种 → 周期 → 预热根数
pub type WarmItems = BTreeMap<String, BTreeMap<String, usize>>;

/// 按品种创建喂入器
pub type FeederFactory<F> = Box<dyn FnMut(&str) -> Result<F> + Send>;

/// 回放进度日志的间隔
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// 交易对刷新时提供新的品种集合
pub trait PairSource: Send {
    fn pairs(&mut self, version: i64, now_ms: i64) -> Result<WarmItems>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubResult {
    /// 需要重新接续的品种（新建或头部周期变化）
    pub new: Vec<String>,
    /// 品种 → 实时数据接续起点
    pub since: BTreeMap<String, i64>,
    pub removed: Vec<String>,
}

/// 订阅阶段产出的预热计划
#[derive(Debug, Clone, Default)]
pub struct SubPlan {
    pub warms: Vec<(String, BTreeMap<String, usize>)>,
    pub result: SubResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub bars: u64,
    pub refreshes: u64,
    pub aborted: bool,
}

pub struct Provider<F: KlineFeeder> {
    holders: BTreeMap<String, F>,
    new_feeder: FeederFactory<F>,
    dirty_tx: mpsc::UnboundedSender<i64>,
    dirty_rx: mpsc::UnboundedReceiver<i64>,
    store: KlineStore,
}

impl<F: KlineFeeder> Provider<F> {
    pub fn new(store: KlineStore, new_feeder: FeederFactory<F>) -> Self {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        Self { holders: BTreeMap::new(), new_feeder, dirty_tx, dirty_rx, store }
    }

    pub fn store(&self) -> &KlineStore {
        &self.store
    }

    pub fn symbols(&self) -> Vec<String> {
        self.holders.keys().cloned().collect()
    }

    pub fn holder(&self, symbol: &str) -> Option<&F> {
        self.holders.get(symbol)
    }

    pub fn holder_mut(&mut self, symbol: &str) -> Option<&mut F> {
        self.holders.get_mut(symbol)
    }

    /// 刷新/中止通知的发送端；负数表示中止回放
    pub fn dirty_sender(&self) -> mpsc::UnboundedSender<i64> {
        self.dirty_tx.clone()
    }

    pub fn stop_all(&self) {
        let _ = self.dirty_tx.send(-1);
    }

    /// 建立或更新订阅，不做预热
    pub fn sub_pairs(&mut self, items: &WarmItems, del_other: bool) -> Result<SubPlan> {
        let mut plan = SubPlan::default();
        for (symbol, tf_warms) in items {
            let tfs: Vec<String> = tf_warms.keys().cloned().collect();
            match self.holders.get_mut(symbol) {
                None => {
                    let mut holder = (self.new_feeder)(symbol.as_str())?;
                    holder.feeder_mut().sub_tfs(&tfs, true)?;
                    self.holders.insert(symbol.clone(), holder);
                    plan.result.new.push(symbol.clone());
                    plan.warms.push((symbol.clone(), tf_warms.clone()));
                }
                Some(holder) => {
                    let old_head = holder.feeder().head_tf_secs();
                    let added = holder.feeder_mut().sub_tfs(&tfs, del_other)?;
                    if holder.feeder().head_tf_secs() != old_head {
                        plan.result.new.push(symbol.clone());
                        plan.warms.push((symbol.clone(), tf_warms.clone()));
                    } else {
                        if !added.is_empty() {
                            let part: BTreeMap<String, usize> = tf_warms
                                .iter()
                                .filter(|(tf, _)| added.contains(tf))
                                .map(|(tf, w)| (tf.clone(), *w))
                                .collect();
                            plan.warms.push((symbol.clone(), part));
                        }
                        let since = holder.feeder().head().map(|s| s.sub_next_ms).unwrap_or(0);
                        plan.result.since.insert(symbol.clone(), since);
                    }
                }
            }
        }
        if del_other {
            let gone: Vec<String> = self.holders.keys().filter(|s| !items.contains_key(*s)).cloned().collect();
            for symbol in gone {
                self.holders.remove(&symbol);
                plan.result.removed.push(symbol);
            }
        }
        Ok(plan)
    }

    /// 依次执行预热任务；预热会推进共享的时间和指标状态，不能并发
    pub fn run_warms(&mut self, plan: SubPlan, up_to_ms: i64, handler: &mut dyn BarHandler) -> Result<SubResult> {
        let SubPlan { warms, mut result } = plan;
        for (symbol, tf_warms) in warms {
            let Some(holder) = self.holders.get_mut(&symbol) else { continue };
            let since = holder.feeder_mut().warm_tfs(up_to_ms, &tf_warms, &self.store, handler)?;
            if result.new.contains(&symbol) {
                result.since.insert(symbol, since);
            }
        }
        Ok(result)
    }

    pub fn sub_warm_pairs(
        &mut self,
        items: &WarmItems,
        del_other: bool,
        up_to_ms: i64,
        handler: &mut dyn BarHandler,
    ) -> Result<SubResult> {
        let plan = self.sub_pairs(items, del_other)?;
        let result = self.run_warms(plan, up_to_ms, handler)?;
        info!(
            target: "klfeed",
            new = result.new.len(),
            removed = result.removed.len(),
            total = self.holders.len(),
            "交易对订阅已更新"
        );
        Ok(result)
    }
}

impl<F: HistFeeder> Provider<F> {
    fn sorted_holds(&self) -> Vec<String> {
        let mut holds: Vec<String> = self.holders.keys().cloned().collect();
        holds.sort_by(|a, b| self.hold_key(a).cmp(&self.hold_key(b)));
        holds
    }

    fn hold_key<'a>(&self, symbol: &'a str) -> (i64, &'a str) {
        let next = self.holders.get(symbol).map(|h| h.next_ms()).unwrap_or(i64::MAX);
        (next, symbol)
    }

    /// 回放主循环，所有喂入器耗尽或收到中止时返回
    ///
    /// `clock` 为回放时钟，刷新时作为预热截止时间；`refresh` 按K线时间触发交易对刷新。
    pub fn loop_main(
        &mut self,
        handler: &mut dyn BarHandler,
        clock: &SimClock,
        end_ms: i64,
        mut refresh: Option<(&RefreshSchedule, &mut dyn PairSource)>,
    ) -> Result<ReplayStats> {
        use crate::klcommon::Clock;

        let mut stats = ReplayStats::default();
        let mut holds = self.sorted_holds();
        let mut next_refresh = match (&refresh, holds.first()) {
            (Some((sch, _)), Some(first)) => sch.next_after(self.hold_key(first).0),
            _ => None,
        };
        let mut version = 0i64;
        let started = Instant::now();
        let mut last_report = started;

        loop {
            let mut refresh_ver = None;
            while let Ok(v) = self.dirty_rx.try_recv() {
                if v < 0 {
                    info!(target: "klfeed", bars = stats.bars, "收到中止信号，回放结束");
                    stats.aborted = true;
                    return Ok(stats);
                }
                refresh_ver = Some(v);
            }
            if let Some(ver) = refresh_ver {
                if let Some((_, source)) = refresh.as_mut() {
                    let now = clock.now_ms();
                    let items = source.pairs(ver, now)?;
                    let before = self.symbols();
                    let res = self.sub_warm_pairs(&items, true, now, handler)?;
                    let (added, dropped) = diff_symbols(&before, &self.symbols());
                    for symbol in &res.new {
                        let since = res.since.get(symbol).copied().unwrap_or(now);
                        if let Some(h) = self.holders.get_mut(symbol) {
                            h.seek(since, end_ms)?;
                        }
                    }
                    holds = self.sorted_holds();
                    stats.refreshes += 1;
                    info!(target: "klfeed", version = ver, symbols = holds.len(), added = ?added, removed = ?dropped, "回放中刷新交易对");
                }
            }

            let Some(first) = holds.first().cloned() else { break };
            let Some(holder) = self.holders.get_mut(&first) else {
                holds.remove(0);
                continue;
            };
            let Some(bar) = holder.get_bar() else { break };
            holder.call_next()?;

            let sym = holds.remove(0);
            let key = (holder.next_ms(), sym.clone());
            let pos = holds.partition_point(|s| {
                let k = self.hold_key(s);
                (k.0, k.1) < (key.0, key.1.as_str())
            });
            holds.insert(pos, sym);

            if let Some(at) = next_refresh {
                if bar.time >= at {
                    version += 1;
                    let _ = self.dirty_tx.send(version);
                    next_refresh = refresh.as_ref().and_then(|(sch, _)| sch.next_after(bar.time));
                }
            }

            if let Some(holder) = self.holders.get_mut(&first) {
                if let Err(e) = holder.run_bar(&bar, handler) {
                    error!(target: "klfeed", symbol = %first, error.summary = e.get_error_type_summary(), error.details = %e, "回放K线处理失败");
                    return Err(e);
                }
            }
            stats.bars += 1;

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                last_report = Instant::now();
                info!(target: "klfeed", bars = stats.bars, sim_ms = clock.now_ms(), elapsed_secs = started.elapsed().as_secs(), "回放进度");
            }
        }
        info!(target: "klfeed", log_type = "module", bars = stats.bars, refreshes = stats.refreshes, elapsed_ms = started.elapsed().as_millis() as u64, "回放完成");
        Ok(stats)
    }
}

/// 回放驱动：预热、定位并运行主循环
pub struct HistProvider<F: HistFeeder> {
    provider: Provider<F>,
    clock: Arc<SimClock>,
    start_ms: i64,
    end_ms: i64,
    refresh: Option<(RefreshSchedule, Box<dyn PairSource>)>,
}

impl<F: HistFeeder> HistProvider<F> {
    pub fn new(provider: Provider<F>, clock: Arc<SimClock>, start_ms: i64, end_ms: i64) -> Self {
        clock.set(start_ms);
        Self { provider, clock, start_ms, end_ms, refresh: None }
    }

    pub fn with_refresh(mut self, schedule: RefreshSchedule, source: Box<dyn PairSource>) -> Self {
        self.refresh = Some((schedule, source));
        self
    }

    pub fn provider(&self) -> &Provider<F> {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut Provider<F> {
        &mut self.provider
    }

    fn seek_new(&mut self, res: &SubResult) -> Result<()> {
        for symbol in &res.new {
            let since = res.since.get(symbol).copied().unwrap_or(self.start_ms);
            if let Some(h) = self.provider.holder_mut(symbol) {
                h.seek(since, self.end_ms)?;
            }
        }
        Ok(())
    }

    /// 预热到回放起点并定位
    pub fn sub_warm_pairs(&mut self, items: &WarmItems, handler: &mut dyn BarHandler) -> Result<SubResult> {
        self.clock.set(self.start_ms);
        let res = self.provider.sub_warm_pairs(items, true, self.start_ms, handler)?;
        self.seek_new(&res)?;
        Ok(res)
    }

    #[instrument(skip_all, fields(start = self.start_ms, end = self.end_ms))]
    pub fn run(&mut self, handler: &mut dyn BarHandler) -> Result<ReplayStats> {
        let refresh = self
            .refresh
            .as_mut()
            .map(|(sch, src)| (&*sch, src.as_mut() as &mut dyn PairSource));
        self.provider.loop_main(handler, &self.clock, self.end_ms, refresh)
    }
}

impl HistProvider<DbKlineFeeder> {
    /// 先建立订阅并补齐缺失数据，再预热
    pub async fn prepare(&mut self, items: &WarmItems, handler: &mut dyn BarHandler) -> Result<SubResult> {
        self.clock.set(self.start_ms);
        let plan = self.provider.sub_pairs(items, true)?;
        for (symbol, tf_warms) in &plan.warms {
            if let Some(h) = self.provider.holder_mut(symbol) {
                h.download_missing(tf_warms, self.start_ms, self.end_ms).await?;
            }
        }
        let res = self.provider.run_warms(plan, self.start_ms, handler)?;
        self.seek_new(&res)?;
        Ok(res)
    }
}

struct LiveState {
    provider: Provider<Feeder>,
    handler: Box<dyn BarHandler>,
}

/// 实盘：经监听客户端接收爬虫推送，分发给对应喂入器
pub struct LiveProvider {
    exchange: String,
    market: String,
    state: Mutex<LiveState>,
    prices: Arc<PriceCache>,
    watcher: Mutex<Option<Arc<KLineWatcher>>>,
    /// 策略额外需要的数据流
    extra: Vec<StreamKind>,
    dump: Mutex<Option<Arc<DumpWriter>>>,
    clock: ClockRef,
}

impl LiveProvider {
    pub fn new(
        exchange: &str,
        market: &str,
        provider: Provider<Feeder>,
        handler: Box<dyn BarHandler>,
        prices: Arc<PriceCache>,
        clock: ClockRef,
    ) -> Arc<Self> {
        Self::with_extra_streams(exchange, market, provider, handler, prices, clock, Vec::new())
    }

    pub fn with_extra_streams(
        exchange: &str,
        market: &str,
        provider: Provider<Feeder>,
        handler: Box<dyn BarHandler>,
        prices: Arc<PriceCache>,
        clock: ClockRef,
        extra: Vec<StreamKind>,
    ) -> Arc<Self> {
        Arc::new(Self {
            exchange: exchange.to_string(),
            market: market.to_string(),
            state: Mutex::new(LiveState { provider, handler }),
            prices,
            watcher: Mutex::new(None),
            extra,
            dump: Mutex::new(None),
            clock,
        })
    }

    /// 已完成K线推送同时写入诊断记录
    pub fn set_dump(&self, dump: Arc<DumpWriter>) {
        *self.dump.lock().unwrap_or_else(|e| e.into_inner()) = Some(dump);
    }

    pub fn bind(&self, watcher: Arc<KLineWatcher>) {
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
    }

    fn watcher(&self) -> Result<Arc<KLineWatcher>> {
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| AppError::ConfigError("实盘数据源尚未绑定监听客户端".to_string()))
    }

    pub fn symbols(&self) -> Vec<String> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).provider.symbols()
    }

    pub fn prices(&self) -> &Arc<PriceCache> {
        &self.prices
    }

    fn symbol_tags(&self, symbols: &[String]) -> Vec<String> {
        let mut tags = Vec::with_capacity(symbols.len() * 2 + 1);
        for sym in symbols {
            tags.push(ohlcv_tag(&self.exchange, &self.market, sym));
            tags.push(uohlcv_tag(&self.exchange, &self.market, sym));
        }
        tags
    }

    /// 订阅交易对：先登记推送，再预热并从存储补齐预热结束后的K线
    pub async fn sub_warm_pairs(self: &Arc<Self>, items: WarmItems, del_other: bool) -> Result<SubResult> {
        let watcher = self.watcher()?;
        let symbols: Vec<String> = items.keys().cloned().collect();
        let mut tags = self.symbol_tags(&symbols);
        tags.push(price_tag(&self.exchange, &self.market));
        watcher.subscribe(&tags).await?;
        for kind in std::iter::once(StreamKind::Ohlcv).chain(self.extra.iter().copied()) {
            let req = WatchReq {
                exchange: self.exchange.clone(),
                market: self.market.clone(),
                kind,
                symbols: symbols.clone(),
            };
            watcher.watch_pairs(&req).await?;
        }

        let this = self.clone();
        let res = tokio::task::spawn_blocking(move || this.warm_and_catch_up(&items, del_other))
            .await
            .map_err(|e| AppError::Unknown(format!("预热任务异常退出: {}", e)))??;

        if !res.removed.is_empty() {
            watcher.unsubscribe(&self.symbol_tags(&res.removed)).await?;
            for kind in std::iter::once(StreamKind::Ohlcv).chain(self.extra.iter().copied()) {
                let req = WatchReq {
                    exchange: self.exchange.clone(),
                    market: self.market.clone(),
                    kind,
                    symbols: res.removed.clone(),
                };
                watcher.unwatch_pairs(&req).await?;
            }
        }
        Ok(res)
    }

    fn warm_and_catch_up(&self, items: &WarmItems, del_other: bool) -> Result<SubResult> {
        let now = self.clock.now_ms();
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let LiveState { provider, handler } = &mut *guard;
        let res = provider.sub_warm_pairs(items, del_other, now, handler.as_mut())?;
        let store = provider.store().clone();
        for symbol in &res.new {
            let Some(feeder) = provider.holder_mut(symbol) else { continue };
            let Some(head) = feeder.head() else { continue };
            let (tf, tf_ms) = (head.tf.clone(), head.tf_ms);
            let since = res.since.get(symbol).copied().unwrap_or(now);
            let sid = feeder.exsymbol().id;
            let bars = store.query_ohlcv(sid, &tf, since, now, 0, false)?;
            if !bars.is_empty() {
                debug!(target: "klfeed", symbol = %symbol, tf = %tf, count = bars.len(), "从存储补齐预热后的K线");
                feeder.on_new_bars(tf_ms, &bars, handler.as_mut())?;
            }
        }
        Ok(res)
    }
}

impl KLineHandler for LiveProvider {
    fn on_kline_msg(&self, msg: KLineMsg) {
        if msg.exchange != self.exchange || msg.market != self.market {
            return;
        }
        let tf_ms = msg.tf_secs as i64 * 1000;
        if msg.is_update {
            if let Some(last) = msg.bars.last() {
                self.prices.set_bar_price(&msg.symbol, last.close);
            }
        } else if let Some(dump) = self.dump.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let tf = crate::klcommon::timeframe::secs_to_tf(msg.tf_secs as i64);
            if let Err(e) = dump.add_klines(&msg.symbol, &tf, &msg.bars) {
                warn!(target: "klfeed", symbol = %msg.symbol, error.details = %e, "记录K线推送失败");
            }
        }
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let LiveState { provider, handler } = &mut *guard;
        let Some(feeder) = provider.holder_mut(&msg.symbol) else { return };
        if msg.is_update {
            if let Some(last) = msg.bars.last() {
                feeder.set_unfinished_bar(tf_ms, *last);
            }
            return;
        }
        if let Err(e) = feeder.on_new_bars(tf_ms, &msg.bars, handler.as_mut()) {
            warn!(target: "klfeed", symbol = %msg.symbol, tf_secs = msg.tf_secs, error.summary = e.get_error_type_summary(), error.details = %e, "处理K线推送失败");
        }
    }

    fn on_prices(&self, exchange: &str, market: &str, prices: PriceMap) {
        if exchange == self.exchange && market == self.market {
            self.prices.set_prices(&prices);
        }
    }

    fn on_trades(&self, _exchange: &str, _market: &str, symbol: &str, trades: Vec<Trade>) {
        debug!(target: "klfeed", symbol, count = trades.len(), "收到成交推送");
    }

    fn on_depth(&self, _exchange: &str, _market: &str, book: OrderBook) {
        debug!(target: "klfeed", symbol = %book.symbol, levels = book.bids.len() + book.asks.len(), "收到深度推送");
    }
}

/// 解析 "品种 → 周期列表" 形式的订阅，统一预热根数
pub fn warm_items(pairs: &[(&str, &[&str])], warm: usize) -> Result<WarmItems> {
    let mut items = WarmItems::new();
    for (symbol, tfs) in pairs {
        let entry = items.entry(symbol.to_string()).or_default();
        for tf in *tfs {
            tf_to_ms(tf)?;
            entry.insert(tf.to_string(), warm);
        }
    }
    Ok(items)
}

/// 品种集合的差异 (新增, 移除)
pub fn diff_symbols(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let old: BTreeSet<&String> = old.iter().collect();
    let new: BTreeSet<&String> = new.iter().collect();
    let added = new.difference(&old).map(|s| s.to_string()).collect();
    let removed = old.difference(&new).map(|s| s.to_string()).collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::timeframe::MINUTE_MS;
    use crate::klcommon::Kline;
    use crate::klfeed::hist::HistKLineFeeder;
    use crate::klstore::test_util::temp_store;

    const T0: i64 = 1_699_999_980_000;

    #[derive(Default)]
    struct Record(Vec<(String, String, i64, bool)>);

    impl BarHandler for Record {
        fn on_bar(&mut self, symbol: &str, tf: &str, bar: &Kline, is_warmup: bool) {
            self.0.push((symbol.to_string(), tf.to_string(), bar.time, is_warmup));
        }
    }

    fn hist_factory(store: &KlineStore, clock: &Arc<SimClock>) -> FeederFactory<HistKLineFeeder> {
        let store = store.clone();
        let clock = clock.clone();
        Box::new(move |symbol: &str| {
            let exs = store.get_exsymbol("binance", "linear", symbol)?;
            let feeder = Feeder::new(exs, clock.clone(), 0.0);
            Ok(HistKLineFeeder::new(feeder, store.clone(), clock.clone()))
        })
    }

    fn seed(store: &KlineStore, symbol: &str, minutes: &[i64]) {
        let exs = store.get_exsymbol("binance", "linear", symbol).unwrap();
        let bars: Vec<Kline> = minutes.iter().map(|m| Kline::flat(T0 + m * MINUTE_MS, 1.0)).collect();
        store.insert_klines("1m", exs.id, &bars).unwrap();
    }

    #[test]
    fn test_known_symbol_keeps_since() {
        let (_dir, store, _) = temp_store(T0 + 100 * MINUTE_MS);
        let clock = Arc::new(SimClock::new(T0));
        let mut provider = Provider::new(store.clone(), hist_factory(&store, &clock));
        let items = warm_items(&[("BTCUSDT", &["1m"])], 0).unwrap();
        let mut rec = Record::default();
        let res = provider.sub_warm_pairs(&items, false, T0, &mut rec).unwrap();
        assert_eq!(res.new, vec!["BTCUSDT".to_string()]);
        assert_eq!(res.since["BTCUSDT"], T0);

        let items = warm_items(&[("BTCUSDT", &["1m", "5m"])], 0).unwrap();
        let res = provider.sub_warm_pairs(&items, false, T0, &mut rec).unwrap();
        assert!(res.new.is_empty());
        assert_eq!(res.since["BTCUSDT"], T0);
    }

    #[test]
    fn test_stop_all_aborts_loop() {
        let (_dir, store, _) = temp_store(T0 + 100 * MINUTE_MS);
        seed(&store, "BTCUSDT", &[0, 1, 2]);
        let clock = Arc::new(SimClock::new(T0));
        let provider = Provider::new(store.clone(), hist_factory(&store, &clock));
        let mut hist = HistProvider::new(provider, clock, T0, T0 + 10 * MINUTE_MS);
        let mut rec = Record::default();
        hist.sub_warm_pairs(&warm_items(&[("BTCUSDT", &["1m"])], 0).unwrap(), &mut rec).unwrap();
        hist.provider().stop_all();
        let stats = hist.run(&mut rec).unwrap();
        assert!(stats.aborted);
        assert_eq!(stats.bars, 0);
    }

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<(String, i64)>>>);

    impl BarHandler for Shared {
        fn on_bar(&mut self, symbol: &str, _tf: &str, bar: &Kline, _is_warmup: bool) {
            self.0.lock().unwrap().push((symbol.to_string(), bar.time));
        }
    }

    #[test]
    fn test_live_push_fires_and_dumps() {
        let (dir, store, clock) = temp_store(T0 + 2 * MINUTE_MS);
        let factory: FeederFactory<Feeder> = {
            let store = store.clone();
            let clock = clock.clone();
            Box::new(move |symbol: &str| Ok(Feeder::new(store.get_exsymbol("binance", "linear", symbol)?, clock.clone(), 0.0)))
        };
        let mut provider = Provider::new(store.clone(), factory);
        let fired = Shared::default();
        let mut warm_rec = fired.clone();
        provider
            .sub_warm_pairs(&warm_items(&[("BTCUSDT", &["1m"])], 0).unwrap(), false, T0, &mut warm_rec)
            .unwrap();
        let live = LiveProvider::new("binance", "linear", provider, Box::new(fired.clone()), Arc::new(PriceCache::new()), clock.clone());
        let dump_path = dir.path().join("live.bin");
        let dump = Arc::new(DumpWriter::open(&dump_path, clock).unwrap());
        live.set_dump(dump.clone());

        let bar = Kline::flat(T0, 2.0);
        let msg = |is_update| KLineMsg {
            exchange: "binance".into(),
            market: "linear".into(),
            symbol: "BTCUSDT".into(),
            tf_secs: 60,
            interval: 60,
            bars: vec![bar],
            is_update,
        };
        live.on_kline_msg(msg(true));
        assert!(fired.0.lock().unwrap().is_empty());
        assert_eq!(live.prices().get_price("BTCUSDT"), Some(2.0));

        live.on_kline_msg(msg(false));
        assert_eq!(*fired.0.lock().unwrap(), vec![("BTCUSDT".to_string(), T0)]);

        dump.flush_dumps().unwrap();
        let rows: Vec<_> = crate::kldump::DumpReader::open(&dump_path).unwrap().collect::<Result<Vec<_>>>().unwrap();
        let (symbol, tf, bars) = crate::kldump::decode_klines(&rows[1]).unwrap();
        assert_eq!((symbol.as_str(), tf.as_str()), ("BTCUSDT", "1m"));
        assert_eq!(bars, vec![bar]);
    }

    #[test]
    fn test_diff_symbols() {
        let (added, removed) = diff_symbols(
            &["A".to_string(), "B".to_string()],
            &["A".to_string(), "C".to_string()],
        );
        assert_eq!(added, vec!["C".to_string()]);
        assert_eq!(removed, vec!["B".to_string()]);
    }
}
