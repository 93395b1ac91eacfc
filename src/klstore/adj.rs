//! 复权因子
//!
//! 因子按 start_ms 排序，每个因子作用于 [start_ms, 下一个因子的 start_ms)。
//! 存储层只返回原始K线和覆盖区间的因子窗口，由调用方用 [`apply_adj`] 复权。

use super::query::normalize_range;
use super::KlineStore;
use crate::klcommon::timeframe::tf_to_ms;
use crate::klcommon::{AdjFactor, AdjInfo, AdjMode, ExSymbol, Kline, Result};
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, info};

/// 由因子序列生成窗口，cum_factor 为从第一个窗口起的累计乘积
pub fn build_adj_infos(sid: i32, factors: &[AdjFactor]) -> Vec<AdjInfo> {
    let mut sorted: Vec<&AdjFactor> = factors.iter().collect();
    sorted.sort_by_key(|f| f.start_ms);
    let mut out = Vec::with_capacity(sorted.len());
    let mut cum = 1.0;
    for (i, f) in sorted.iter().enumerate() {
        cum *= f.factor;
        let stop_ms = sorted.get(i + 1).map(|n| n.start_ms).unwrap_or(i64::MAX);
        out.push(AdjInfo {
            sid,
            sub_id: if f.sub_id > 0 { f.sub_id } else { sid },
            start_ms: f.start_ms,
            stop_ms,
            factor: f.factor,
            cum_factor: cum,
        });
    }
    out
}

/// 按复权方式调整价格
///
/// * `Back`：乘以从最早窗口起的累计因子，最早的价格保持不变
/// * `Front`：再除以总累计因子，最新窗口保持原价
/// * `None`：原样返回
///
/// `cut_end > 0` 时丢弃 time >= cut_end 的K线；`limit > 0` 时只保留最后 limit 根。
/// 成交量不做调整。
pub fn apply_adj(adjs: &[AdjInfo], bars: &[Kline], mode: AdjMode, cut_end: i64, limit: usize) -> Vec<Kline> {
    let mut out: Vec<Kline> = bars
        .iter()
        .take_while(|b| cut_end <= 0 || b.time < cut_end)
        .copied()
        .collect();
    if limit > 0 && out.len() > limit {
        out.drain(..out.len() - limit);
    }
    if mode == AdjMode::None || adjs.is_empty() {
        return out;
    }
    let total = adjs.last().map(|a| a.cum_factor).unwrap_or(1.0);
    for bar in out.iter_mut() {
        let idx = adjs.partition_point(|a| a.start_ms <= bar.time);
        let cum = if idx == 0 { 1.0 } else { adjs[idx - 1].cum_factor };
        let rate = match mode {
            AdjMode::Back => cum,
            AdjMode::Front => cum / total,
            AdjMode::None => 1.0,
        };
        if rate != 1.0 {
            bar.open *= rate;
            bar.high *= rate;
            bar.low *= rate;
            bar.close *= rate;
        }
    }
    out
}

impl KlineStore {
    /// 替换某个品种的全部复权因子
    pub fn insert_adj_factors(&self, sid: i32, factors: &[AdjFactor]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM adj_factors WHERE sid = ?1", params![sid])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO adj_factors (sid, sub_id, start_ms, factor) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for f in factors {
                stmt.execute(params![sid, f.sub_id, f.start_ms, f.factor])?;
            }
        }
        tx.commit()?;
        self.adj_cache().lock().unwrap_or_else(|e| e.into_inner()).remove(&sid);
        info!(target: "klstore", sid, count = factors.len(), "复权因子已更新");
        Ok(factors.len())
    }

    /// 读取复权因子，未命中时查库并放入缓存
    pub fn get_adj_factors(&self, sid: i32) -> Result<Arc<Vec<AdjFactor>>> {
        if let Some(found) = self.adj_cache().lock().unwrap_or_else(|e| e.into_inner()).get(&sid) {
            return Ok(found.clone());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, sub_id, start_ms, factor FROM adj_factors WHERE sid = ?1 ORDER BY start_ms",
        )?;
        let rows = stmt.query_map(params![sid], |row| {
            Ok(AdjFactor {
                id: row.get(0)?,
                sid,
                sub_id: row.get(1)?,
                start_ms: row.get(2)?,
                factor: row.get(3)?,
            })
        })?;
        let factors = Arc::new(rows.collect::<rusqlite::Result<Vec<_>>>()?);
        self.adj_cache()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sid, factors.clone());
        Ok(factors)
    }

    /// 返回原始K线和覆盖查询区间的复权窗口
    ///
    /// 组合品种的每个窗口从其 sub_id 对应的合约读取。
    pub fn get_adjusted(
        &self,
        exs: &ExSymbol,
        tf: &str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
        with_unfinished: bool,
    ) -> Result<(Vec<Kline>, Vec<AdjInfo>)> {
        let infos = build_adj_infos(exs.id, &self.get_adj_factors(exs.id)?);
        let tf_ms = tf_to_ms(tf)?;
        let (start, end) = normalize_range(tf_ms, start_ms, end_ms, limit, self.now_ms());
        let overlapping: Vec<AdjInfo> = infos
            .into_iter()
            .filter(|a| a.stop_ms > start && a.start_ms < end)
            .collect();

        if !exs.combined || overlapping.is_empty() {
            let bars = self.query_ohlcv(exs.id, tf, start_ms, end_ms, limit, with_unfinished)?;
            return Ok((bars, overlapping));
        }

        let mut bars = Vec::new();
        let last_idx = overlapping.len() - 1;
        for (i, win) in overlapping.iter().enumerate() {
            let part_start = start.max(win.start_ms);
            let part_end = end.min(win.stop_ms);
            let mut part = self.query_ohlcv(win.sub_id, tf, part_start, part_end, 0, with_unfinished && i == last_idx)?;
            part.retain(|b| b.time >= part_start);
            debug!(target: "klstore", sid = exs.id, sub_id = win.sub_id, count = part.len(), "读取组合品种窗口");
            bars.append(&mut part);
        }
        if limit > 0 && bars.len() > limit {
            if start_ms > 0 {
                bars.truncate(limit);
            } else {
                bars.drain(..bars.len() - limit);
            }
        }
        Ok((bars, overlapping))
    }
}
