//! 行情矿工：每个 (交易所, 市场) 一个，管理四类数据流的订阅状态和入口协程
//!
//! 状态机：none → subscribing（首次订阅）→ subscribed（收到第一批数据）→ none（任何终止错误）。
//! 每次回到 none 都在 RetryWaits 里记一次失败，由爬虫的订阅监控按 next_retry 重新订阅。

use super::hub::ClientHub;
use super::protocol::{book_tag, ohlcv_tag, price_tag, trade_tag, uohlcv_tag, IOMsg};
use super::writer::{SaveKline, WriteQueue};
use crate::kldata::{build_ohlcv, ExchangeRef, StreamBatch, StreamKind};
use crate::klcommon::timeframe::{align_tf_msecs, tf_to_ms, MINUTE_MS};
use crate::klcommon::{
    ClockRef, Kline, MarkPrice, NotifyKLines, OrderBook, PriceMap, Result, RetryWaits, Trade,
};
use crate::klstore::KlineStore;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 入口通道容量
const INGRESS_QUEUE_SIZE: usize = 1024;
/// REST 补数检查周期
const STALL_CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// 分钟边界之后留出的余量
const STALL_SLACK_MS: i64 = 3000;
/// EMA 平滑系数
const INTV_ALPHA: f64 = 0.1;
/// 间隔超过均值的倍数视为断流
const INTV_GAP_RATE: f64 = 5.0;
const INTV_MIN_SAMPLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    None,
    Subscribing,
    Subscribed,
}

#[derive(Debug)]
struct StreamSlot {
    state: StreamState,
    symbols: BTreeSet<String>,
    tx: Option<mpsc::Sender<StreamBatch>>,
    /// 每次重新建立数据流加一，旧入口协程的终止信号据此忽略
    generation: u64,
}

impl StreamSlot {
    fn new() -> Self {
        Self { state: StreamState::None, symbols: BTreeSet::new(), tx: None, generation: 0 }
    }
}

/// 单个品种的K线订阅状态
#[derive(Debug, Clone, Default)]
pub struct SymbolSub {
    pub sid: i32,
    pub last_notify: i64,
    /// 下一根等待完成的K线的开始时间
    pub expect_ms: i64,
    pub prev_bar: Option<Kline>,
    /// 秒级K线合成分钟线时的未完成分钟线
    pub carry: Option<Kline>,
    pub intv_ma: f64,
    pub intv_count: u32,
}

impl SymbolSub {
    pub fn new(sid: i32, expect_ms: i64) -> Self {
        Self { sid, expect_ms, ..Default::default() }
    }

    /// 记录批次间隔；间隔异常放大时丢弃 prev_bar，视作数据断档
    pub fn record_interval(&mut self, now: i64) {
        if self.last_notify > 0 {
            let intv = (now - self.last_notify).max(0) as f64;
            if self.intv_count >= INTV_MIN_SAMPLES && intv > self.intv_ma * INTV_GAP_RATE && self.prev_bar.is_some() {
                debug!(target: "klspider", sid = self.sid, intv, ma = self.intv_ma, "推送间隔异常，丢弃未完成K线");
                self.prev_bar = None;
            }
            self.intv_ma = if self.intv_count == 0 { intv } else { INTV_ALPHA * intv + (1.0 - INTV_ALPHA) * self.intv_ma };
            self.intv_count += 1;
        }
        self.last_notify = now;
    }

    /// 计算本批的已完成K线，返回 (已完成, 当前未完成)
    ///
    /// 已完成 = 早于本批最后一根的 prev_bar + 本批除最后一根外的全部；
    /// last_closed 为 true 时最后一根也算完成。
    /// 时间不大于上一根已完成K线的修正会被丢弃，不做覆盖写入。
    pub fn take_completed(&mut self, bars: &[Kline], last_closed: bool, tf_ms: i64) -> (Vec<Kline>, Option<Kline>) {
        let Some(last) = bars.last().copied() else {
            return (Vec::new(), self.prev_bar);
        };
        let mut done = Vec::with_capacity(bars.len() + 1);
        if let Some(prev) = self.prev_bar.take() {
            if prev.time < last.time && bars.first().map_or(true, |b| b.time > prev.time) {
                done.push(prev);
            }
        }
        for bar in &bars[..bars.len() - 1] {
            if done.last().map_or(true, |d: &Kline| bar.time > d.time) {
                done.push(*bar);
            }
        }
        if last_closed {
            if done.last().map_or(true, |d| last.time > d.time) {
                done.push(last);
            }
            self.prev_bar = None;
            self.expect_ms = last.time + tf_ms;
        } else {
            self.prev_bar = Some(last);
            self.expect_ms = last.time;
        }
        (done, self.prev_bar)
    }
}

pub struct Miner {
    exchange: ExchangeRef,
    market: String,
    store: KlineStore,
    hub: Arc<ClientHub>,
    writes: WriteQueue,
    waits: Arc<RetryWaits>,
    clock: ClockRef,
    cancel: CancellationToken,
    ohlcv_tf: &'static str,
    ohlcv_tf_ms: i64,
    slots: HashMap<StreamKind, Mutex<StreamSlot>>,
    klines: Mutex<HashMap<String, SymbolSub>>,
}

impl std::fmt::Debug for Miner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Miner")
            .field("exchange", &self.exchange.name())
            .field("market", &self.market)
            .finish()
    }
}

impl Miner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: ExchangeRef,
        market: &str,
        store: KlineStore,
        hub: Arc<ClientHub>,
        writes: WriteQueue,
        waits: Arc<RetryWaits>,
        clock: ClockRef,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let ohlcv_tf = exchange.ohlcv_tf(market);
        let ohlcv_tf_ms = tf_to_ms(ohlcv_tf)?;
        let slots = StreamKind::ALL.iter().map(|k| (*k, Mutex::new(StreamSlot::new()))).collect();
        let miner = Arc::new(Self {
            exchange,
            market: market.to_string(),
            store,
            hub,
            writes,
            waits,
            clock,
            cancel,
            ohlcv_tf,
            ohlcv_tf_ms,
            slots,
            klines: Mutex::new(HashMap::new()),
        });
        tokio::spawn(miner.clone().run_stall_checker());
        info!(target: "klspider", log_type = "module", exchange = miner.exchange_name(), market, ohlcv_tf, "矿工已创建");
        Ok(miner)
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn stream_key(&self, kind: StreamKind) -> String {
        format!("{}_{}_{}", self.exchange.name(), self.market, kind)
    }

    pub fn state(&self, kind: StreamKind) -> StreamState {
        self.slot(kind).map(|s| s.state).unwrap_or(StreamState::None)
    }

    pub fn symbols(&self, kind: StreamKind) -> Vec<String> {
        self.slot(kind).map(|s| s.symbols.iter().cloned().collect()).unwrap_or_default()
    }

    fn slot(&self, kind: StreamKind) -> Option<std::sync::MutexGuard<'_, StreamSlot>> {
        self.slots.get(&kind).map(|m| m.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn lock_klines(&self) -> std::sync::MutexGuard<'_, HashMap<String, SymbolSub>> {
        self.klines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 订阅品种；已订阅的品种被忽略
    pub async fn sub_pairs(self: &Arc<Self>, kind: StreamKind, symbols: &[String]) -> Result<()> {
        if kind == StreamKind::Price && self.ohlcv_tf_ms < MINUTE_MS {
            // 现货的价格由秒级K线推导
            debug!(target: "klspider", market = %self.market, "现货市场不单独订阅价格流");
            return Ok(());
        }
        if kind == StreamKind::Ohlcv {
            self.ensure_kline_subs(symbols).await?;
        }

        let (added, start, tx) = {
            let Some(mut slot) = self.slot(kind) else {
                return Ok(());
            };
            let added: Vec<String> = symbols.iter().filter(|s| slot.symbols.insert((*s).clone())).cloned().collect();
            let start = slot.state == StreamState::None;
            if start {
                slot.state = StreamState::Subscribing;
            }
            (added, start, slot.tx.clone())
        };
        if start {
            return self.start_stream(kind).await;
        }
        if added.is_empty() {
            return Ok(());
        }
        if let Some(tx) = tx {
            if let Err(e) = self.exchange.watch(&self.market, kind, &added, tx).await {
                error!(target: "klspider", key = %self.stream_key(kind), error.summary = e.get_error_type_summary(), error.details = %e, "追加订阅失败");
                self.mark_none(kind, None);
                return Err(e);
            }
        }
        info!(target: "klspider", key = %self.stream_key(kind), added = added.len(), "追加订阅品种");
        Ok(())
    }

    async fn ensure_kline_subs(&self, symbols: &[String]) -> Result<()> {
        let missing: Vec<String> = {
            let subs = self.lock_klines();
            symbols.iter().filter(|s| !subs.contains_key(*s)).cloned().collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        let exg = self.exchange.name().to_string();
        let market = self.market.clone();
        let names = missing.clone();
        let sids: Vec<i32> = self
            .store
            .run_blocking(move |s| {
                names.iter().map(|sym| s.get_exsymbol(&exg, &market, sym).map(|e| e.id)).collect()
            })
            .await?;
        let expect = align_tf_msecs(self.clock.now_ms(), self.ohlcv_tf_ms);
        let mut subs = self.lock_klines();
        for (sym, sid) in missing.into_iter().zip(sids) {
            subs.entry(sym).or_insert_with(|| SymbolSub::new(sid, expect));
        }
        Ok(())
    }

    /// 建立数据流：新建入口通道和入口协程，再调用交易所 watch
    pub async fn start_stream(self: &Arc<Self>, kind: StreamKind) -> Result<()> {
        let (tx, rx) = mpsc::channel(INGRESS_QUEUE_SIZE);
        let (symbols, generation) = {
            let Some(mut slot) = self.slot(kind) else {
                return Ok(());
            };
            slot.state = StreamState::Subscribing;
            slot.generation += 1;
            slot.tx = Some(tx.clone());
            (slot.symbols.iter().cloned().collect::<Vec<_>>(), slot.generation)
        };
        if symbols.is_empty() {
            self.mark_none(kind, Some(generation));
            return Ok(());
        }
        tokio::spawn(self.clone().run_ingress(kind, generation, rx));
        info!(target: "klspider", key = %self.stream_key(kind), count = symbols.len(), "开始订阅数据流");
        if let Err(e) = self.exchange.watch(&self.market, kind, &symbols, tx).await {
            error!(target: "klspider", key = %self.stream_key(kind), error.summary = e.get_error_type_summary(), error.details = %e, "订阅数据流失败");
            self.mark_none(kind, Some(generation));
            return Err(e);
        }
        Ok(())
    }

    /// 回到 none 并记一次失败；generation 不匹配时说明已重新订阅，忽略
    fn mark_none(&self, kind: StreamKind, generation: Option<u64>) {
        {
            let Some(mut slot) = self.slot(kind) else {
                return;
            };
            if generation.is_some_and(|g| g != slot.generation) || slot.state == StreamState::None {
                return;
            }
            slot.state = StreamState::None;
            slot.tx = None;
        }
        let key = self.stream_key(kind);
        let next = self.waits.set_fail(&key);
        warn!(target: "klspider", key = %key, next_retry = next, "数据流已断开");
    }

    fn mark_subscribed(&self, kind: StreamKind, generation: u64) {
        let changed = {
            let Some(mut slot) = self.slot(kind) else {
                return;
            };
            if slot.generation != generation || slot.state != StreamState::Subscribing {
                false
            } else {
                slot.state = StreamState::Subscribed;
                true
            }
        };
        if changed {
            let key = self.stream_key(kind);
            self.waits.reset(&key);
            info!(target: "klspider", key = %key, "数据流已就绪");
        }
    }

    /// 需要重新订阅的数据流：状态为 none、仍有品种且已到重试时间
    pub fn due_retries(&self, now: i64) -> Vec<StreamKind> {
        StreamKind::ALL
            .iter()
            .copied()
            .filter(|kind| {
                self.slot(*kind)
                    .map(|s| s.state == StreamState::None && !s.symbols.is_empty())
                    .unwrap_or(false)
                    && self.waits.next_retry(&self.stream_key(*kind)) <= now
            })
            .collect()
    }

    /// 退订品种
    pub async fn un_sub_pairs(&self, kind: StreamKind, symbols: &[String]) -> Result<()> {
        let removed: Vec<String> = {
            let Some(mut slot) = self.slot(kind) else {
                return Ok(());
            };
            symbols.iter().filter(|s| slot.symbols.remove(*s)).cloned().collect()
        };
        if removed.is_empty() {
            return Ok(());
        }
        if kind == StreamKind::Ohlcv {
            let mut subs = self.lock_klines();
            for sym in &removed {
                subs.remove(sym);
            }
        }
        info!(target: "klspider", key = %self.stream_key(kind), removed = removed.len(), "退订品种");
        self.exchange.unwatch(&self.market, kind, &removed).await
    }

    async fn run_ingress(self: Arc<Self>, kind: StreamKind, generation: u64, mut rx: mpsc::Receiver<StreamBatch>) {
        loop {
            let first = tokio::select! {
                batch = rx.recv() => batch,
                _ = self.cancel.cancelled() => return,
            };
            let Some(first) = first else {
                self.mark_none(kind, Some(generation));
                return;
            };
            let mut batches = vec![first];
            // 积压时一次取完，深度和价格只保留每个品种最新的
            while let Ok(more) = rx.try_recv() {
                batches.push(more);
            }
            let closed = batches.iter().position(|b| b.is_closed());
            if let Some(pos) = closed {
                batches.truncate(pos + 1);
            }
            let has_data = batches.iter().any(|b| !b.is_closed());
            if has_data {
                self.mark_subscribed(kind, generation);
            }
            for batch in coalesce(batches) {
                match batch {
                    StreamBatch::Klines { symbol, tf_ms, bars, last_closed } => {
                        let now = self.clock.now_ms();
                        if let Err(e) = self.handle_sub_klines(&symbol, tf_ms, &bars, last_closed, now).await {
                            error!(target: "klspider", symbol = %symbol, error.summary = e.get_error_type_summary(), error.details = %e, "处理K线推送失败");
                        }
                    }
                    StreamBatch::Trades(trades) => self.publish_trades(trades),
                    StreamBatch::Depth(books) => self.publish_depth(books),
                    StreamBatch::Prices(prices) => self.publish_prices(prices),
                    StreamBatch::Closed { reason } => {
                        debug!(target: "klspider", key = %self.stream_key(kind), reason = %reason, "入口收到终止信号");
                        self.mark_none(kind, Some(generation));
                        return;
                    }
                }
            }
        }
    }

    /// 处理一个品种的一批K线：完成的进写入队列，全部广播为 uohlcv
    pub async fn handle_sub_klines(&self, symbol: &str, tf_ms: i64, bars: &[Kline], last_closed: bool, now: i64) -> Result<()> {
        if bars.is_empty() {
            return Ok(());
        }
        let (sid, done, partial, minute) = {
            let mut subs = self.lock_klines();
            let Some(sub) = subs.get_mut(symbol) else {
                return Ok(());
            };
            sub.record_interval(now);
            let (done, partial) = sub.take_completed(bars, last_closed, tf_ms);
            if tf_ms >= MINUTE_MS {
                (sub.sid, done, partial, None)
            } else {
                // 秒级K线：已完成部分合成分钟线，未完成的分钟线连同当前秒线一起作为 kline_un
                let (mut built, closed) = build_ohlcv(&done, 60, 0.0, sub.carry.as_ref(), tf_ms);
                sub.carry = if closed { None } else { built.pop() };
                let mut live = sub.carry;
                if let Some(p) = partial {
                    let bucket = align_tf_msecs(p.time, MINUTE_MS);
                    match live.as_mut() {
                        Some(c) if c.time == bucket => c.merge(&p),
                        _ => {
                            let mut k = p;
                            k.time = bucket;
                            live = Some(k);
                        }
                    }
                }
                (sub.sid, done, partial, Some((built, live)))
            }
        };

        let exg = self.exchange.name();
        let action = ohlcv_tag(exg, &self.market, symbol);
        let (save_bars, save_partial) = match minute {
            Some((built, live)) => (built, live),
            None => (done.clone(), partial),
        };
        if !save_bars.is_empty() || save_partial.is_some() {
            self.writes
                .push(SaveKline { sid, tf: "1m", bars: save_bars, partial: save_partial, action: action.clone() })
                .await?;
        }

        let tf_secs = (tf_ms / 1000) as i32;
        let mut all = done;
        if let Some(p) = partial {
            all.push(p);
        }
        let last_close = all.last().map(|b| b.close);
        let msg = IOMsg::new(uohlcv_tag(exg, &self.market, symbol), &NotifyKLines { tf_secs, interval: tf_secs, bars: all })?;
        self.hub.broadcast(&msg);

        if tf_ms < MINUTE_MS {
            if let Some(close) = last_close {
                let mut prices = PriceMap::new();
                prices.insert(symbol.to_string(), close);
                self.hub.broadcast(&IOMsg::new(price_tag(exg, &self.market), &prices)?);
            }
        }
        Ok(())
    }

    fn publish_trades(&self, trades: Vec<Trade>) {
        let mut groups: BTreeMap<String, Vec<Trade>> = BTreeMap::new();
        for t in trades {
            groups.entry(t.symbol.clone()).or_default().push(t);
        }
        for (symbol, list) in groups {
            if let Ok(msg) = IOMsg::new(trade_tag(self.exchange.name(), &self.market, &symbol), &list) {
                self.hub.broadcast(&msg);
            }
        }
    }

    fn publish_depth(&self, books: Vec<OrderBook>) {
        let mut latest: BTreeMap<String, OrderBook> = BTreeMap::new();
        for b in books {
            latest.insert(b.symbol.clone(), b);
        }
        for (symbol, book) in latest {
            if let Ok(msg) = IOMsg::new(book_tag(self.exchange.name(), &self.market, &symbol), &book) {
                self.hub.broadcast(&msg);
            }
        }
    }

    fn publish_prices(&self, prices: Vec<MarkPrice>) {
        let map: PriceMap = prices.into_iter().map(|p| (p.symbol, p.price)).collect();
        if map.is_empty() {
            return;
        }
        if let Ok(msg) = IOMsg::new(price_tag(self.exchange.name(), &self.market), &map) {
            self.hub.broadcast(&msg);
        }
    }

    async fn run_stall_checker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(STALL_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => return,
            }
            let now = self.clock.now_ms();
            if let Err(e) = self.check_stalls(now).await {
                warn!(target: "klspider", market = %self.market, error.summary = e.get_error_type_summary(), error.details = %e, "REST补数失败");
            }
        }
    }

    /// 分钟边界过后仍没收到推送的品种，用 REST 拉取补上
    pub async fn check_stalls(&self, now: i64) -> Result<usize> {
        let minute = align_tf_msecs(now, MINUTE_MS);
        if now - minute < STALL_SLACK_MS {
            return Ok(0);
        }
        let stalled: Vec<(String, i64)> = self
            .lock_klines()
            .iter()
            .filter(|(_, sub)| sub.expect_ms + STALL_SLACK_MS < minute)
            .map(|(sym, sub)| (sym.clone(), sub.expect_ms))
            .collect();
        let mut fixed = 0;
        for (symbol, expect) in stalled {
            let mut bars = self
                .exchange
                .fetch_ohlcv(&self.market, &symbol, self.ohlcv_tf, expect, 0, 1000)
                .await?;
            let Some(last) = bars.last().copied() else {
                continue;
            };
            let cur = align_tf_msecs(now, self.ohlcv_tf_ms);
            if last.time < cur {
                bars.push(Kline::flat(cur, last.close));
            }
            debug!(target: "klspider", symbol = %symbol, expect, count = bars.len(), "REST补齐K线");
            self.handle_sub_klines(&symbol, self.ohlcv_tf_ms, &bars, false, now).await?;
            fixed += 1;
        }
        Ok(fixed)
    }
}

/// 合并一次取出的多个批次：K线按到达顺序保留，成交累积，深度/价格只保留每个品种最新的
fn coalesce(batches: Vec<StreamBatch>) -> Vec<StreamBatch> {
    let mut out = Vec::with_capacity(batches.len());
    let mut trades: Vec<Trade> = Vec::new();
    let mut books: BTreeMap<String, OrderBook> = BTreeMap::new();
    let mut prices: BTreeMap<String, MarkPrice> = BTreeMap::new();
    let mut closed = None;
    for batch in batches {
        match batch {
            StreamBatch::Trades(list) => trades.extend(list),
            StreamBatch::Depth(list) => {
                for b in list {
                    books.insert(b.symbol.clone(), b);
                }
            }
            StreamBatch::Prices(list) => {
                for p in list {
                    prices.insert(p.symbol.clone(), p);
                }
            }
            StreamBatch::Closed { .. } => closed = Some(batch),
            k @ StreamBatch::Klines { .. } => out.push(k),
        }
    }
    if !trades.is_empty() {
        out.push(StreamBatch::Trades(trades));
    }
    if !books.is_empty() {
        out.push(StreamBatch::Depth(books.into_values().collect()));
    }
    if !prices.is_empty() {
        out.push(StreamBatch::Prices(prices.into_values().collect()));
    }
    out.extend(closed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kldata::Exchange;
    use crate::klstore::test_util::temp_store;
    use async_trait::async_trait;

    fn bar(t: i64, c: f64) -> Kline {
        Kline::flat(t * MINUTE_MS, c)
    }

    #[test]
    fn test_completed_set_rule() {
        let mut sub = SymbolSub::new(1, 0);
        let (done, partial) = sub.take_completed(&[bar(0, 1.0)], false, MINUTE_MS);
        assert!(done.is_empty());
        assert_eq!(partial.map(|b| b.time), Some(0));

        // 同一时间的更新覆盖 prev_bar
        let (done, _) = sub.take_completed(&[bar(0, 2.0)], false, MINUTE_MS);
        assert!(done.is_empty());
        assert_eq!(sub.prev_bar.map(|b| b.close), Some(2.0));

        let (done, partial) = sub.take_completed(&[bar(1, 3.0), bar(2, 4.0)], false, MINUTE_MS);
        assert_eq!(done.iter().map(|b| b.time).collect::<Vec<_>>(), vec![0, MINUTE_MS]);
        assert_eq!(done[0].close, 2.0);
        assert_eq!(partial.map(|b| b.time), Some(2 * MINUTE_MS));
        assert_eq!(sub.expect_ms, 2 * MINUTE_MS);
    }

    #[test]
    fn test_closed_flag_completes_last() {
        let mut sub = SymbolSub::new(1, 0);
        sub.take_completed(&[bar(2, 99.0)], false, MINUTE_MS);
        let (done, partial) = sub.take_completed(&[bar(2, 100.0)], true, MINUTE_MS);
        assert_eq!(done, vec![bar(2, 100.0)]);
        assert!(partial.is_none());
        assert_eq!(sub.expect_ms, 3 * MINUTE_MS);
    }

    #[test]
    fn test_interval_gap_drops_prev_bar() {
        let mut sub = SymbolSub::new(1, 0);
        for i in 0..4 {
            sub.record_interval(1000 + i * 1000);
        }
        sub.prev_bar = Some(bar(0, 1.0));
        sub.record_interval(4000 + 10_000);
        assert!(sub.prev_bar.is_none());
    }

    #[test]
    fn test_coalesce_keeps_latest_depth() {
        let book = |sym: &str, t: i64| OrderBook { symbol: sym.to_string(), time: t, ..Default::default() };
        let out = coalesce(vec![
            StreamBatch::Depth(vec![book("A", 1)]),
            StreamBatch::Depth(vec![book("A", 2), book("B", 1)]),
        ]);
        match &out[0] {
            StreamBatch::Depth(books) => {
                assert_eq!(books.len(), 2);
                assert_eq!(books[0].time, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[derive(Default)]
    struct SpotExchange {
        tx: Mutex<Option<mpsc::Sender<StreamBatch>>>,
    }

    #[async_trait]
    impl Exchange for SpotExchange {
        fn name(&self) -> &str {
            "binance"
        }

        async fn fetch_ohlcv(&self, _: &str, _: &str, _: &str, _: i64, _: i64, _: usize) -> Result<Vec<Kline>> {
            Ok(Vec::new())
        }

        async fn watch(&self, _: &str, _: StreamKind, _: &[String], tx: mpsc::Sender<StreamBatch>) -> Result<()> {
            *self.tx.lock().unwrap() = Some(tx);
            Ok(())
        }

        async fn unwatch(&self, _: &str, _: StreamKind, _: &[String]) -> Result<()> {
            Ok(())
        }
    }

    async fn drain_until(rx: &mut mpsc::Receiver<IOMsg>, msgs: &mut Vec<IOMsg>, mut cond: impl FnMut(&[IOMsg]) -> bool) -> bool {
        for _ in 0..300 {
            while let Ok(m) = rx.try_recv() {
                msgs.push(m);
            }
            if cond(msgs.as_slice()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_spot_seconds_close_one_minute() {
        const T0: i64 = 1_699_999_980_000;
        let (_dir, store, clock) = temp_store(T0 + 30_000);
        let cancel = CancellationToken::new();
        let hub = Arc::new(ClientHub::new());
        let (tx, mut rx) = mpsc::channel::<IOMsg>(256);
        let client = hub.register(tx);
        let done_tag = ohlcv_tag("binance", "spot", "BTCUSDT");
        let live_tag = uohlcv_tag("binance", "spot", "BTCUSDT");
        hub.subscribe(client, &[done_tag.clone(), live_tag.clone()]);

        let (writes, _handles) = WriteQueue::start(store.clone(), hub.clone(), 1, 64, cancel.clone());
        let waits = Arc::new(RetryWaits::new(clock.clone()));
        let exchange: ExchangeRef = Arc::new(SpotExchange::default());
        let miner = Miner::new(exchange, "spot", store.clone(), hub.clone(), writes, waits, clock.clone(), cancel.clone()).unwrap();
        assert_eq!(miner.ohlcv_tf, "1s");
        miner.sub_pairs(StreamKind::Ohlcv, &["BTCUSDT".to_string()]).await.unwrap();
        let sid = store.get_exsymbol("binance", "spot", "BTCUSDT").unwrap().id;

        let sec = |i: i64| {
            let p = 100.0 + i as f64;
            Kline::new(T0 + i * 1000, p, p + 0.5, p - 0.5, p, 1.0)
        };
        let head: Vec<Kline> = (0..=30).map(sec).collect();
        miner.handle_sub_klines("BTCUSDT", 1000, &head, false, T0 + 31_000).await.unwrap();
        let mut msgs = Vec::new();
        assert!(drain_until(&mut rx, &mut msgs, |_| store.get_unfinished(sid, "1m").unwrap().is_some()).await);
        assert!(store.query_ohlcv(sid, "1m", T0, T0 + 120_000, 0, false).unwrap().is_empty());

        clock.set(T0 + 61_000);
        let tail: Vec<Kline> = (31..=60).map(sec).collect();
        miner.handle_sub_klines("BTCUSDT", 1000, &tail, false, T0 + 61_000).await.unwrap();
        assert!(drain_until(&mut rx, &mut msgs, |m| m.iter().any(|x| x.action == done_tag)).await);

        let saved = store.query_ohlcv(sid, "1m", T0, T0 + 120_000, 0, false).unwrap();
        assert_eq!(saved.len(), 1);
        let m = saved[0];
        assert_eq!((m.time, m.open, m.high, m.low, m.close, m.volume), (T0, 100.0, 159.5, 99.5, 159.0, 60.0));
        assert!(wait_unfinished(&store, sid, T0 + 60_000).await);

        let done: Vec<&IOMsg> = msgs.iter().filter(|x| x.action == done_tag).collect();
        assert_eq!(done.len(), 1);
        let body: NotifyKLines = serde_json::from_value(done[0].data.clone()).unwrap();
        assert_eq!(body.tf_secs, 60);
        assert_eq!(body.bars.len(), 1);
        assert_eq!(msgs.iter().filter(|x| x.action == live_tag).count(), 2);
        cancel.cancel();
    }

    async fn wait_unfinished(store: &KlineStore, sid: i32, time: i64) -> bool {
        for _ in 0..300 {
            if store.get_unfinished(sid, "1m").unwrap().map(|b| b.time) == Some(time) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}
