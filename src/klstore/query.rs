//! K线查询，非持久化周期在查询时聚合

use super::range::get_kinfo_conn;
use super::{unfinished, KlineStore};
use crate::kldata::aggregator::build_ohlcv;
use crate::klcommon::timeframe::{align_tf_msecs, bucket_end, get_query_tf, stored_tf_by_secs, tf_to_secs, StoredTf};
use crate::klcommon::{KInfo, Kline, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;

pub(crate) fn read_bars(conn: &Connection, st: &StoredTf, sid: i32, start: i64, end: i64) -> Result<Vec<Kline>> {
    let sql = format!(
        "SELECT time, open, high, low, close, volume, info FROM {}
         WHERE sid = ?1 AND time >= ?2 AND time < ?3 ORDER BY time",
        st.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![sid, start, end], |row| {
        Ok(Kline {
            time: row.get(0)?,
            open: row.get(1)?,
            high: row.get(2)?,
            low: row.get(3)?,
            close: row.get(4)?,
            volume: row.get(5)?,
            info: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn read_times(conn: &Connection, st: &StoredTf, sid: i32, start: i64, end: i64) -> Result<Vec<i64>> {
    let sql = format!(
        "SELECT time FROM {} WHERE sid = ?1 AND time >= ?2 AND time < ?3 ORDER BY time",
        st.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![sid, start, end], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// 规范化查询区间，返回 (start, end)
///
/// end 向下对齐（0 表示当前时间）；limit>0 且 start>0 时 end 截断到 start+limit 根；
/// start 为 0 且 limit>0 时从 end 倒推 start。
pub fn normalize_range(tf_ms: i64, start_ms: i64, end_ms: i64, limit: usize, now_ms: i64) -> (i64, i64) {
    let mut end = align_tf_msecs(if end_ms > 0 { end_ms } else { now_ms }, tf_ms);
    let mut start = start_ms;
    let span = tf_ms.saturating_mul(limit as i64);
    if limit > 0 && start > 0 {
        end = end.min(start.saturating_add(span));
    } else if start == 0 && limit > 0 {
        start = end - span;
    }
    (start, end)
}

/// 读取 [start, end) 的完整K线，非持久化周期从可整除的最大持久化周期聚合
pub(crate) fn query_range(conn: &Connection, sid: i32, tf_secs: i64, start: i64, end: i64) -> Result<Vec<Kline>> {
    if start >= end {
        return Ok(Vec::new());
    }
    if let Some(st) = stored_tf_by_secs(tf_secs) {
        return read_bars(conn, st, sid, start, end);
    }
    let tf_ms = tf_secs * 1000;
    let src = get_query_tf(tf_secs)?;
    let rows = read_bars(conn, src, sid, align_tf_msecs(start, tf_ms), end)?;
    let (mut bars, _) = build_ohlcv(&rows, tf_secs, 0.0, None, src.ms());
    bars.retain(|b| b.time >= start && bucket_end(b.time, tf_ms) <= end);
    Ok(bars)
}

impl KlineStore {
    /// 按区间查询K线，升序；见 [`normalize_range`] 的边界规则
    ///
    /// `with_unfinished` 为 true 且结果已到达当前桶时，追加未完成K线。
    pub fn query_ohlcv(
        &self,
        sid: i32,
        tf: &str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
        with_unfinished: bool,
    ) -> Result<Vec<Kline>> {
        let tf_secs = tf_to_secs(tf)?;
        let tf_ms = tf_secs * 1000;
        let now = self.now_ms();
        let (start, end) = normalize_range(tf_ms, start_ms, end_ms, limit, now);
        let conn = self.conn()?;
        let mut bars = query_range(&conn, sid, tf_secs, start, end)?;
        if limit > 0 && bars.len() > limit {
            if start_ms > 0 {
                bars.truncate(limit);
            } else {
                bars.drain(..bars.len() - limit);
            }
        }

        if with_unfinished {
            let cur = align_tf_msecs(now, tf_ms);
            let reaches_now = match bars.last() {
                Some(last) => bucket_end(last.time, tf_ms) == cur,
                None => start <= cur && end >= cur,
            };
            if reaches_now {
                if let Some(un) = unfinished::compose_unfinished(&conn, sid, tf_ms, now)? {
                    bars.push(un);
                }
            }
        }
        Ok(bars)
    }

    /// 批量查询多个品种，适用于预热大量交易对
    pub fn query_ohlcv_batch(
        &self,
        sids: &[i32],
        tf: &str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<HashMap<i32, Vec<Kline>>> {
        let mut out = HashMap::with_capacity(sids.len());
        for sid in sids {
            let bars = self.query_ohlcv(*sid, tf, start_ms, end_ms, limit, false)?;
            out.insert(*sid, bars);
        }
        Ok(out)
    }

    /// 区间内的有效范围（非持久化周期按其查询来源周期）
    pub fn query_kinfo(&self, sid: i32, tf: &str) -> Result<Option<KInfo>> {
        let src = get_query_tf(tf_to_secs(tf)?)?;
        let conn = self.conn()?;
        get_kinfo_conn(&conn, sid, src.tf)
    }
}
