//! 单品种多周期的K线喂入器
//!
//! 状态按周期升序排列，头部周期等于全部订阅周期的最大公约数；不满足时插入一个合成头部，
//! 合成头部只负责承接输入，不回调策略。

use crate::kldata::aggregator::build_ohlcv;
use crate::klcommon::timeframe::{align_tf_msecs, gcd_all, secs_to_tf, tf_to_secs, MINUTE_MS};
use crate::klcommon::{AppError, ClockRef, ExSymbol, Kline, Result};
use crate::klstore::KlineStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// K线回调
pub trait BarHandler: Send {
    fn on_bar(&mut self, symbol: &str, tf: &str, bar: &Kline, is_warmup: bool);
}

/// 单个周期的状态
#[derive(Debug, Clone, PartialEq)]
pub struct TfState {
    pub tf: String,
    pub tf_secs: i64,
    pub tf_ms: i64,
    /// 尚未产出的下一根K线时间
    pub next_ms: i64,
    /// 下一根输入K线的时间，早于它的输入视为重复
    pub sub_next_ms: i64,
    /// 正在形成的K线
    pub wait_bar: Option<Kline>,
    pub latest_bar: Option<Kline>,
    /// 爬虫推送的未完成K线
    pub live_bar: Option<Kline>,
    pub synthetic: bool,
}

impl TfState {
    fn new(tf: &str, tf_secs: i64, synthetic: bool) -> Self {
        Self {
            tf: tf.to_string(),
            tf_secs,
            tf_ms: tf_secs * 1000,
            next_ms: 0,
            sub_next_ms: 0,
            wait_bar: None,
            latest_bar: None,
            live_bar: None,
            synthetic,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Feeder {
    symbol: String,
    exs: Arc<ExSymbol>,
    states: Vec<TfState>,
    clock: ClockRef,
    pre_fire: f64,
}

impl Feeder {
    pub fn new(exs: Arc<ExSymbol>, clock: ClockRef, pre_fire: f64) -> Self {
        Self { symbol: exs.symbol.clone(), exs, states: Vec::new(), clock, pre_fire }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn exsymbol(&self) -> &Arc<ExSymbol> {
        &self.exs
    }

    pub fn states(&self) -> &[TfState] {
        &self.states
    }

    pub fn head(&self) -> Option<&TfState> {
        self.states.first()
    }

    pub fn head_tf_secs(&self) -> i64 {
        self.states.first().map(|s| s.tf_secs).unwrap_or(0)
    }

    /// 已订阅的周期，不含合成头部
    pub fn tfs(&self) -> Vec<String> {
        self.states.iter().filter(|s| !s.synthetic).map(|s| s.tf.clone()).collect()
    }

    /// 实盘才允许提前触发
    fn effective_pre_fire(&self) -> f64 {
        if self.clock.is_live() {
            self.pre_fire
        } else {
            0.0
        }
    }

    /// 安装新的周期，返回新增的周期；del_other 为 true 时删除不在列表中的周期
    pub fn sub_tfs(&mut self, tfs: &[String], del_other: bool) -> Result<Vec<String>> {
        let mut parsed = Vec::with_capacity(tfs.len());
        for tf in tfs {
            parsed.push((tf.clone(), tf_to_secs(tf)?));
        }
        if del_other {
            self.states.retain(|s| s.synthetic || parsed.iter().any(|(_, secs)| *secs == s.tf_secs));
        }
        let mut added = Vec::new();
        for (tf, secs) in parsed {
            match self.states.iter_mut().find(|s| s.tf_secs == secs) {
                Some(s) if s.synthetic => {
                    // 合成头部转为正式订阅，沿用已有进度
                    s.synthetic = false;
                    s.tf = tf.clone();
                    added.push(tf);
                }
                Some(_) => {}
                None => {
                    self.states.push(TfState::new(&tf, secs, false));
                    added.push(tf);
                }
            }
        }
        self.rebuild_head();
        Ok(added)
    }

    fn rebuild_head(&mut self) {
        let head_secs = gcd_all(self.states.iter().filter(|s| !s.synthetic).map(|s| s.tf_secs));
        self.states.retain(|s| !s.synthetic || s.tf_secs == head_secs);
        if head_secs > 0 && !self.states.iter().any(|s| s.tf_secs == head_secs) {
            let mut head = TfState::new(&secs_to_tf(head_secs), head_secs, true);
            if let Some(min_next) = self.states.iter().map(|s| s.next_ms).filter(|t| *t > 0).min() {
                head.next_ms = min_next;
                head.sub_next_ms = min_next;
            }
            debug!(target: "klfeed", symbol = %self.symbol, tf = %head.tf, "插入合成头部周期");
            self.states.push(head);
        }
        if head_secs == 0 {
            self.states.clear();
        }
        self.states.sort_by_key(|s| s.tf_secs);
    }

    /// 从存储加载每个周期最后 warm 根已完成K线并以预热方式回调
    ///
    /// 不在 tf_warms 中的周期保持原状。返回实时数据应当接续的起点。
    pub fn warm_tfs(
        &mut self,
        up_to_ms: i64,
        tf_warms: &BTreeMap<String, usize>,
        store: &KlineStore,
        handler: &mut dyn BarHandler,
    ) -> Result<i64> {
        let head_ms = self.states.first().map(|s| s.tf_ms).unwrap_or(MINUTE_MS);
        let full = self.states.iter().filter(|s| !s.synthetic).all(|s| tf_warms.contains_key(&s.tf));
        let mut since = 0i64;
        for state in self.states.iter_mut() {
            // 只重置本次预热涉及的周期
            let included = if state.synthetic { full } else { tf_warms.contains_key(&state.tf) };
            if !included {
                continue;
            }
            let aligned = align_tf_msecs(up_to_ms, state.tf_ms);
            state.wait_bar = None;
            state.live_bar = None;
            state.next_ms = aligned;
            state.sub_next_ms = aligned;
            let warm = if state.synthetic { 0 } else { tf_warms.get(&state.tf).copied().unwrap_or(0) };
            if warm > 0 {
                let bars = store.query_ohlcv(self.exs.id, &state.tf, 0, aligned, warm, false)?;
                for bar in &bars {
                    handler.on_bar(&self.symbol, &state.tf, bar, true);
                }
                if let Some(last) = bars.last() {
                    // 从最后一根预热K线之后接续
                    state.latest_bar = Some(*last);
                    state.next_ms = last.time + state.tf_ms;
                    state.sub_next_ms = state.next_ms;
                    since = since.max(state.next_ms);
                }
                debug!(target: "klfeed", symbol = %self.symbol, tf = %state.tf, want = warm, got = bars.len(), "周期预热完成");
            }
        }
        if since == 0 {
            since = align_tf_msecs(up_to_ms, head_ms);
        }
        Ok(since)
    }

    /// 接收一批 bar_tf_ms 周期的已完成K线
    pub fn on_new_bars(&mut self, bar_tf_ms: i64, bars: &[Kline], handler: &mut dyn BarHandler) -> Result<()> {
        let Some(head) = self.states.first() else {
            return Ok(());
        };
        if bars.is_empty() {
            return Ok(());
        }
        let head_ms = head.tf_ms;
        if bar_tf_ms > head_ms {
            return Err(AppError::InvalidBar(format!(
                "{} 输入周期 {}ms 大于头部周期 {}ms",
                self.symbol, bar_tf_ms, head_ms
            )));
        }
        let pre_fire = self.effective_pre_fire();
        let is_live = self.clock.is_live();
        let now = self.clock.now_ms();

        for idx in 0..self.states.len() {
            let state = &mut self.states[idx];
            let fresh: Vec<Kline> = bars.iter().filter(|b| b.time >= state.sub_next_ms).copied().collect();
            let Some(last_in) = fresh.last() else { continue };
            let in_end = last_in.time + bar_tf_ms;
            let (out, last_closed) = if bar_tf_ms < state.tf_ms {
                build_ohlcv(&fresh, state.tf_secs, pre_fire, state.wait_bar.as_ref(), bar_tf_ms)
            } else {
                (fresh, true)
            };
            state.sub_next_ms = in_end;
            on_state_ohlcvs(&self.symbol, state, out, last_closed, handler, is_live, now);
        }
        Ok(())
    }

    /// 记录推送来的未完成K线，不触发回调
    pub fn set_unfinished_bar(&mut self, tf_ms: i64, bar: Kline) {
        if let Some(state) = self.states.iter_mut().find(|s| s.tf_ms == tf_ms) {
            state.live_bar = Some(bar);
        }
    }

    pub fn unfinished_bar(&self, tf: &str) -> Option<Kline> {
        self.states.iter().find(|s| s.tf == tf).and_then(|s| s.live_bar)
    }

    /// 设定所有周期的起点，用于回放前定位
    pub fn seek(&mut self, since_ms: i64) {
        for state in self.states.iter_mut() {
            let aligned = align_tf_msecs(since_ms, state.tf_ms);
            state.next_ms = aligned;
            state.sub_next_ms = aligned;
            state.wait_bar = None;
        }
    }
}

/// 识别完成部分、更新等待K线并回调
fn on_state_ohlcvs(
    symbol: &str,
    state: &mut TfState,
    mut bars: Vec<Kline>,
    last_closed: bool,
    handler: &mut dyn BarHandler,
    is_live: bool,
    now: i64,
) {
    bars.retain(|b| b.time >= state.next_ms);
    let Some(first) = bars.first() else { return };
    if let Some(wait) = state.wait_bar {
        if wait.time < first.time && wait.time >= state.next_ms {
            bars.insert(0, wait);
        }
    }
    let done = if last_closed { bars.len() } else { bars.len() - 1 };
    state.wait_bar = if last_closed { None } else { bars.last().copied() };
    if done == 0 {
        return;
    }
    let last = bars[done - 1];
    state.next_ms = last.time + state.tf_ms;
    state.latest_bar = Some(last);
    if state.synthetic {
        return;
    }
    for bar in &bars[..done] {
        handler.on_bar(symbol, &state.tf, bar, false);
    }
    if is_live && state.tf_ms >= MINUTE_MS {
        let delay = now - (last.time + state.tf_ms);
        if delay > state.tf_ms {
            warn!(target: "klfeed", symbol, tf = %state.tf, delay_ms = delay, "K线延迟过大");
        }
    }
}
