//! 下载编排：按 kinfo 计算缺失区间，生产者拉取、消费者写库，最后一次性更新区间

use super::exchange::ExchangeRef;
use crate::klcommon::config::DownloadConfig;
use crate::klcommon::timeframe::{align_tf_msecs, align_up, get_down_tf, tf_to_ms};
use crate::klcommon::{AppError, ExSymbol, Kline, Result};
use crate::klstore::KlineStore;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// 拉取结果在通道里的缓冲数量
const FETCH_QUEUE_SIZE: usize = 4;

/// 一个待下载区间；reverse 为 true 时从大端向小端拉取
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchInterval {
    pub start: i64,
    pub end: i64,
    pub reverse: bool,
}

/// 一次请求的窗口及交易所返回的K线
#[derive(Debug, Clone)]
pub struct FetchedChunk {
    pub start: i64,
    pub end: i64,
    pub bars: Vec<Kline>,
}

/// 计算需要下载的区间：先是 old_end 之后的尾部（正向），再是 old_start 之前的头部（反向）
pub fn plan_intervals(old: Option<(i64, i64)>, start: i64, end: i64) -> Vec<FetchInterval> {
    if start >= end {
        return Vec::new();
    }
    let Some((old_start, old_end)) = old else {
        return vec![FetchInterval { start, end, reverse: false }];
    };
    let mut out = Vec::with_capacity(2);
    if end > old_end {
        let tail_start = start.max(old_end);
        out.push(FetchInterval { start: tail_start, end, reverse: false });
    }
    if start < old_start {
        let head_end = end.min(old_start);
        out.push(FetchInterval { start, end: head_end, reverse: true });
    }
    out
}

/// 把区间切成每段最多 batch 根K线的请求窗口，反向区间从大端开始
pub fn split_windows(interval: &FetchInterval, tf_ms: i64, batch: usize) -> Vec<(i64, i64)> {
    let step = tf_ms * batch.max(1) as i64;
    let mut out = Vec::new();
    if interval.reverse {
        let mut hi = interval.end;
        while hi > interval.start {
            let lo = (hi - step).max(interval.start);
            out.push((lo, hi));
            hi = lo;
        }
    } else {
        let mut lo = interval.start;
        while lo < interval.end {
            let hi = (lo + step).min(interval.end);
            out.push((lo, hi));
            lo = hi;
        }
    }
    out
}

/// 请求窗口里交易所没有返回数据的部分
pub fn empty_windows(chunk: &FetchedChunk, tf_ms: i64) -> Vec<(i64, i64)> {
    let (Some(first), Some(last)) = (chunk.bars.first(), chunk.bars.last()) else {
        return vec![(chunk.start, chunk.end)];
    };
    let mut out = Vec::new();
    if first.time > chunk.start {
        out.push((chunk.start, first.time));
    }
    let last_end = last.time + tf_ms;
    if last_end < chunk.end {
        out.push((last_end, chunk.end));
    }
    out
}

#[derive(Debug, Default)]
struct WriteSummary {
    bars: usize,
    /// 实际写入K线的范围
    real: Option<(i64, i64)>,
    empties: Vec<(i64, i64)>,
}

impl WriteSummary {
    fn absorb(&mut self, chunk: &FetchedChunk, tf_ms: i64) {
        if let (Some(first), Some(last)) = (chunk.bars.first(), chunk.bars.last()) {
            let (lo, hi) = (first.time, last.time + tf_ms);
            self.real = Some(match self.real {
                Some((s, e)) => (s.min(lo), e.max(hi)),
                None => (lo, hi),
            });
        }
        self.bars += chunk.bars.len();
        self.empties.extend(empty_windows(chunk, tf_ms));
    }
}

/// 拉取 [start, end) 的K线并按请求窗口写入 out；start > end 时从大端反向拉取
///
/// 返回拉到的K线数量。time >= end 的K线会被丢弃。
#[allow(clippy::too_many_arguments)]
pub async fn fetch_api_ohlcv(
    exchange: &ExchangeRef,
    exs: &ExSymbol,
    tf: &str,
    start: i64,
    end: i64,
    batch: usize,
    max_retries: usize,
    out: &mpsc::Sender<FetchedChunk>,
    cancel: &CancellationToken,
) -> Result<usize> {
    let tf_ms = tf_to_ms(tf)?;
    let interval = if start > end {
        FetchInterval { start: end, end: start, reverse: true }
    } else {
        FetchInterval { start, end, reverse: false }
    };
    let mut total = 0;
    for (lo, hi) in split_windows(&interval, tf_ms, batch) {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!("{} 下载已取消", exs.symbol)));
        }
        let mut bars = fetch_with_retry(exchange, exs, tf, lo, hi, batch, max_retries, cancel).await?;
        bars.retain(|b| b.time >= lo && b.time < hi);
        bars.sort_by_key(|b| b.time);
        bars.dedup_by_key(|b| b.time);
        total += bars.len();
        let chunk = FetchedChunk { start: lo, end: hi, bars };
        tokio::select! {
            sent = out.send(chunk) => {
                if sent.is_err() {
                    return Err(AppError::ChannelError("下载结果通道已关闭".to_string()));
                }
            }
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled(format!("{} 下载已取消", exs.symbol)));
            }
        }
    }
    Ok(total)
}

#[allow(clippy::too_many_arguments)]
async fn fetch_with_retry(
    exchange: &ExchangeRef,
    exs: &ExSymbol,
    tf: &str,
    lo: i64,
    hi: i64,
    batch: usize,
    max_retries: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Kline>> {
    let mut attempt = 0;
    loop {
        match exchange.fetch_ohlcv(&exs.market, &exs.symbol, tf, lo, hi, batch).await {
            Ok(bars) => return Ok(bars),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(
                    target: "kldata",
                    symbol = %exs.symbol,
                    tf,
                    attempt,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "下载K线失败，稍后重试"
                );
                if !crate::klcommon::btime::sleep(Duration::from_secs(attempt as u64), cancel).await {
                    return Err(AppError::Cancelled(format!("{} 下载已取消", exs.symbol)));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// 下载器
#[derive(Clone)]
pub struct Downloader {
    store: KlineStore,
    exchange: ExchangeRef,
    config: DownloadConfig,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(store: KlineStore, exchange: ExchangeRef, config: DownloadConfig, cancel: CancellationToken) -> Self {
        Self { store, exchange, config, cancel }
    }

    pub fn store(&self) -> &KlineStore {
        &self.store
    }

    /// 下载 [start_ms, end_ms) 的K线，按 tf 的下载周期写库；end_ms 为 0 表示到当前
    ///
    /// 返回写入的K线数量。
    #[instrument(skip(self, exs), fields(symbol = %exs.symbol, sid = exs.id), err)]
    pub async fn download(&self, exs: &ExSymbol, tf: &str, start_ms: i64, end_ms: i64) -> Result<usize> {
        let down_tf = get_down_tf(tf)?;
        match self.download_once(exs, down_tf, start_ms, end_ms).await {
            Err(AppError::UniqueViolation(msg)) => {
                warn!(target: "kldata", symbol = %exs.symbol, tf = down_tf, error.details = %msg, "下载写入遇到唯一键冲突，重置 kinfo 后重试");
                let sid = exs.id;
                self.store.run_blocking(move |s| s.reset_kinfo(sid, down_tf)).await?;
                self.download_once(exs, down_tf, start_ms, end_ms).await
            }
            other => other,
        }
    }

    async fn download_once(&self, exs: &ExSymbol, tf: &'static str, start_ms: i64, end_ms: i64) -> Result<usize> {
        let tf_ms = tf_to_ms(tf)?;
        let now = self.store.now_ms();
        let cur_bucket = align_tf_msecs(now, tf_ms);
        let req_end = if end_ms > 0 { end_ms } else { now };
        let start = align_up(start_ms, tf_ms);
        let end = align_tf_msecs(req_end.min(now), tf_ms);
        let want_unfinished = req_end > cur_bucket;

        if exs.combined || exs.delist_ms > 0 {
            debug!(target: "kldata", symbol = %exs.symbol, "组合或已下架品种，跳过下载");
            return Ok(0);
        }
        if start >= end || end <= exs.list_ms {
            return Ok(0);
        }

        let sid = exs.id;
        let old = self.store.run_blocking(move |s| s.get_kinfo(sid, tf)).await?;
        let old_range = old.map(|k| (k.start, k.stop));
        if let Some((os, oe)) = old_range {
            if os <= start && end <= oe {
                debug!(target: "kldata", decision = "range_covered", symbol = %exs.symbol, tf, "区间已覆盖，跳过下载");
                return Ok(0);
            }
        }

        let intervals = plan_intervals(old_range, start, end);
        let summary = self.run_intervals(exs, tf, &intervals).await?;

        if want_unfinished && end == cur_bucket {
            self.refresh_unfinished(exs, tf, end, now).await?;
        }

        if let Some((real_start, real_end)) = summary.real {
            self.store
                .run_blocking(move |s| s.update_range(sid, tf, real_start, real_end))
                .await?;
        }
        if !summary.empties.is_empty() {
            let empties = summary.empties;
            self.store.run_blocking(move |s| s.mark_nodata_holes(sid, tf, &empties)).await?;
        }
        info!(
            target: "kldata",
            log_type = "module",
            symbol = %exs.symbol,
            tf,
            bars = summary.bars,
            intervals = intervals.len(),
            "K线下载完成"
        );
        Ok(summary.bars)
    }

    /// 拉取一组区间并写库；生产者出错或取消时消费者随之退出
    async fn run_intervals(&self, exs: &ExSymbol, tf: &'static str, intervals: &[FetchInterval]) -> Result<WriteSummary> {
        let tf_ms = tf_to_ms(tf)?;
        let token = self.cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<FetchedChunk>(FETCH_QUEUE_SIZE);

        let producer = {
            let exchange = self.exchange.clone();
            let exs = exs.clone();
            let token = token.clone();
            let intervals = intervals.to_vec();
            let batch = self.config.batch_size;
            let retries = self.config.max_retries;
            tokio::spawn(async move {
                let mut total = 0;
                for iv in intervals {
                    let (s, e) = if iv.reverse { (iv.end, iv.start) } else { (iv.start, iv.end) };
                    match fetch_api_ohlcv(&exchange, &exs, tf, s, e, batch, retries, &tx, &token).await {
                        Ok(n) => total += n,
                        Err(e) => {
                            token.cancel();
                            return Err(e);
                        }
                    }
                }
                Ok::<usize, AppError>(total)
            })
        };

        let mut summary = WriteSummary::default();
        let mut consume_err: Option<AppError> = None;
        let sid = exs.id;
        loop {
            // 已进入通道的数据先落库，取消只在通道为空时生效
            let chunk = tokio::select! {
                biased;
                chunk = rx.recv() => chunk,
                _ = token.cancelled() => None,
            };
            let Some(chunk) = chunk else { break };
            if !chunk.bars.is_empty() {
                let bars = chunk.bars.clone();
                if let Err(e) = self.store.run_blocking(move |s| s.insert_klines(tf, sid, &bars)).await {
                    token.cancel();
                    consume_err = Some(e);
                    break;
                }
            }
            summary.absorb(&chunk, tf_ms);
        }
        drop(rx);

        let produced = producer
            .await
            .map_err(|e| AppError::Unknown(format!("下载任务异常退出: {}", e)))?;
        if let Some(e) = consume_err {
            error!(target: "kldata", symbol = %exs.symbol, tf, error.summary = e.get_error_type_summary(), error.details = %e, "写入下载数据失败");
            return Err(e);
        }
        if let Err(e) = produced {
            error!(target: "kldata", symbol = %exs.symbol, tf, error.summary = e.get_error_type_summary(), error.details = %e, "下载区间失败");
            // 已写入的部分仍然记入区间
            if let Some((rs, re)) = summary.real {
                if let Err(re_err) = self.store.run_blocking(move |s| s.update_range(sid, tf, rs, re)).await {
                    error!(target: "kldata", symbol = %exs.symbol, tf, start = rs, stop = re, error.summary = re_err.get_error_type_summary(), error.details = %re_err, "记录已写入区间失败");
                }
            }
            return Err(e);
        }
        Ok(summary)
    }

    async fn refresh_unfinished(&self, exs: &ExSymbol, tf: &'static str, bucket: i64, now: i64) -> Result<()> {
        let bars = self.exchange.fetch_ohlcv(&exs.market, &exs.symbol, tf, bucket, 0, 1).await?;
        let Some(bar) = bars.into_iter().find(|b| b.time == bucket) else {
            return Ok(());
        };
        let sid = exs.id;
        self.store.run_blocking(move |s| s.set_unfinished(sid, tf, &bar, now)).await
    }

    /// 多个品种并发下载，并发数为 concur_num
    pub async fn bulk_down(&self, items: &[Arc<ExSymbol>], tf: &str, start_ms: i64, end_ms: i64) -> Result<usize> {
        let concur = self.config.concur_num.max(1);
        let results: Vec<(Arc<ExSymbol>, Result<usize>)> = stream::iter(items.iter().cloned())
            .map(|exs| async move {
                let res = self.download(&exs, tf, start_ms, end_ms).await;
                (exs, res)
            })
            .buffer_unordered(concur)
            .collect()
            .await;

        let mut total = 0;
        let mut failed = 0;
        let mut first_err = None;
        for (exs, res) in results {
            match res {
                Ok(n) => total += n,
                Err(e) => {
                    failed += 1;
                    error!(target: "kldata", symbol = %exs.symbol, tf, error.summary = e.get_error_type_summary(), error.details = %e, "品种下载失败");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        info!(target: "kldata", log_type = "module", symbols = items.len(), failed, bars = total, "批量下载结束");
        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// 重新下载尚未确认无数据的缺口
    pub async fn fill_holes(&self, exs: &ExSymbol, tf: &str) -> Result<usize> {
        let down_tf = get_down_tf(tf)?;
        let sid = exs.id;
        let holes = self.store.run_blocking(move |s| s.get_kholes(sid, down_tf)).await?;
        let intervals: Vec<FetchInterval> = holes
            .iter()
            .filter(|h| !h.no_data)
            .map(|h| FetchInterval { start: h.start, end: h.stop, reverse: false })
            .collect();
        if intervals.is_empty() {
            return Ok(0);
        }
        let summary = self.run_intervals(exs, down_tf, &intervals).await?;
        for iv in &intervals {
            let (s, e) = (iv.start, iv.end);
            self.store.run_blocking(move |st| st.update_range(sid, down_tf, s, e)).await?;
        }
        if !summary.empties.is_empty() {
            let empties = summary.empties;
            self.store.run_blocking(move |s| s.mark_nodata_holes(sid, down_tf, &empties)).await?;
        }
        info!(target: "kldata", log_type = "module", symbol = %exs.symbol, tf = down_tf, holes = intervals.len(), bars = summary.bars, "缺口补全完成");
        Ok(summary.bars)
    }
}
