//! 写入路径：K线 upsert、有效区间、缺口、连续聚合
//!
//! `update_range` 在调用方的事务里完成四件事：
//! 1. kinfo 取已有区间、实际最小/最大K线与观测区间的并集
//! 2. 在扫描区间内重新检测缺口并与旧缺口合并
//! 3. 对以本周期为来源的更高周期重新聚合跨越边界的桶，并递归 1、2
//! 4. 更新更高周期的未完成K线

use super::holes::{self, HoleSpan};
use super::query::{read_bars, read_times};
use super::{unfinished, KlineStore};
use crate::kldata::aggregator::build_ohlcv;
use crate::klcommon::timeframe::{agg_targets, align_tf_msecs, stored_tf, StoredTf};
use crate::klcommon::{AppError, KHole, KInfo, Kline, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

pub(crate) fn require_stored(tf: &str) -> Result<&'static StoredTf> {
    stored_tf(tf).ok_or_else(|| AppError::InvalidTimeframe(format!("{} 不是持久化周期", tf)))
}

/// upsert K线，冲突时覆盖
pub(crate) fn upsert_bars(conn: &Connection, st: &StoredTf, sid: i32, bars: &[Kline]) -> Result<usize> {
    let tf_ms = st.ms();
    let sql = format!(
        "INSERT INTO {} (sid, time, open, high, low, close, volume, info)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(sid, time) DO UPDATE SET
            open = excluded.open, high = excluded.high, low = excluded.low,
            close = excluded.close, volume = excluded.volume, info = excluded.info",
        st.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    for b in bars {
        if b.time.rem_euclid(tf_ms) != 0 {
            return Err(AppError::InvalidBar(format!("sid={} tf={} time={} 未对齐", sid, st.tf, b.time)));
        }
        stmt.execute(params![sid, b.time, b.open, b.high, b.low, b.close, b.volume, b.info])?;
    }
    Ok(bars.len())
}

pub(crate) fn get_kinfo_conn(conn: &Connection, sid: i32, tf: &str) -> Result<Option<KInfo>> {
    let info = conn
        .query_row(
            "SELECT start, stop FROM kinfo WHERE sid = ?1 AND timeframe = ?2",
            params![sid, tf],
            |row| Ok(KInfo { sid, start: row.get(0)?, stop: row.get(1)? }),
        )
        .optional()?;
    Ok(info)
}

fn set_kinfo_conn(conn: &Connection, sid: i32, tf: &str, start: i64, stop: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO kinfo (sid, timeframe, start, stop) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(sid, timeframe) DO UPDATE SET start = excluded.start, stop = excluded.stop",
        params![sid, tf, start, stop],
    )?;
    Ok(())
}

fn load_holes_conn(conn: &Connection, sid: i32, tf: &str) -> Result<Vec<KHole>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, start, stop, no_data FROM khole WHERE sid = ?1 AND timeframe = ?2 ORDER BY start",
    )?;
    let rows = stmt.query_map(params![sid, tf], |row| {
        Ok(KHole {
            id: row.get(0)?,
            sid,
            timeframe: tf.to_string(),
            start: row.get(1)?,
            stop: row.get(2)?,
            no_data: row.get::<_, i64>(3)? != 0,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn to_spans(holes: &[KHole]) -> Vec<HoleSpan> {
    holes.iter().map(|h| HoleSpan::new(h.start, h.stop, h.no_data)).collect()
}

fn replace_holes_conn(conn: &Connection, sid: i32, tf: &str, spans: &[HoleSpan]) -> Result<()> {
    conn.execute("DELETE FROM khole WHERE sid = ?1 AND timeframe = ?2", params![sid, tf])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO khole (sid, timeframe, start, stop, no_data) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for h in spans {
        stmt.execute(params![sid, tf, h.start, h.stop, h.no_data as i64])?;
    }
    Ok(())
}

/// 更新 (sid, tf) 的区间、缺口、聚合周期；`root` 为 false 时跳过未完成K线
pub(crate) fn update_range_tx(
    conn: &Connection,
    sid: i32,
    st: &StoredTf,
    obs_start: i64,
    obs_end: i64,
    now_ms: i64,
    root: bool,
) -> Result<()> {
    let tf_ms = st.ms();
    let old = get_kinfo_conn(conn, sid, st.tf)?;
    let (min_t, max_t): (Option<i64>, Option<i64>) = conn.query_row(
        &format!("SELECT MIN(time), MAX(time) FROM {} WHERE sid = ?1", st.table()),
        params![sid],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let has_obs = obs_start < obs_end;

    let mut starts: Vec<i64> = Vec::with_capacity(3);
    let mut stops: Vec<i64> = Vec::with_capacity(3);
    if let Some(o) = old {
        starts.push(o.start);
        stops.push(o.stop);
    }
    if let (Some(lo), Some(hi)) = (min_t, max_t) {
        starts.push(lo);
        stops.push(hi + tf_ms);
    }
    if has_obs {
        starts.push(obs_start);
        stops.push(obs_end);
    }
    let (Some(&start), Some(&stop)) = (starts.iter().min(), stops.iter().max()) else {
        return Ok(());
    };
    if old.map(|o| (o.start, o.stop)) != Some((start, stop)) {
        set_kinfo_conn(conn, sid, st.tf, start, stop)?;
    }

    if !has_obs {
        return Ok(());
    }

    // 扫描区间与旧区间不相接时向旧区间延伸，中间的空白也是缺口
    let mut scan_start = obs_start;
    let mut scan_end = obs_end;
    if let Some(o) = old {
        scan_start = scan_start.min(o.stop);
        scan_end = scan_end.max(o.start);
    }
    let times = read_times(conn, st, sid, scan_start, scan_end)?;
    let detected = holes::find_gaps(&times, scan_start, scan_end, tf_ms, align_tf_msecs(now_ms, tf_ms));
    let existing = to_spans(&load_holes_conn(conn, sid, st.tf)?);
    let merged = holes::clip(&holes::merge_holes(&existing, scan_start, scan_end, &detected), start, stop);
    if merged != existing {
        debug!(target: "klstore", sid, tf = st.tf, before = existing.len(), after = merged.len(), "缺口已更新");
        replace_holes_conn(conn, sid, st.tf, &merged)?;
    }

    for agg in agg_targets(st.tf) {
        let agg_ms = agg.ms();
        let ref_end = align_tf_msecs(obs_end, agg_ms);
        if ref_end <= obs_start {
            continue;
        }
        let ref_start = align_tf_msecs(obs_start, agg_ms) - agg_ms;
        let rows = read_bars(conn, st, sid, ref_start, ref_end)?;
        let (aggs, _) = build_ohlcv(&rows, agg.secs, 0.0, None, tf_ms);
        let Some(first) = aggs.first() else {
            continue;
        };
        upsert_bars(conn, agg, sid, &aggs)?;
        update_range_tx(conn, sid, agg, first.time, ref_end, now_ms, false)?;
    }

    if root {
        unfinished::refresh_after_insert(conn, sid, st, obs_start, obs_end, now_ms)?;
    }
    Ok(())
}

impl KlineStore {
    /// 写入已完成K线（upsert），调用方负责随后调用 `update_range`
    pub fn insert_klines(&self, tf: &str, sid: i32, bars: &[Kline]) -> Result<usize> {
        let st = require_stored(tf)?;
        if bars.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let count = upsert_bars(&tx, st, sid, bars)?;
        tx.commit()?;
        Ok(count)
    }

    /// 在单个事务里维护区间、缺口、聚合周期与未完成K线
    pub fn update_range(&self, sid: i32, tf: &str, obs_start: i64, obs_end: i64) -> Result<()> {
        let st = require_stored(tf)?;
        let now = self.now_ms();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        update_range_tx(&tx, sid, st, obs_start, obs_end, now, true)?;
        tx.commit()?;
        Ok(())
    }

    /// 写入并更新区间，唯一键冲突时重置 kinfo 后重试一次
    pub fn insert_auto(&self, tf: &str, sid: i32, bars: &[Kline]) -> Result<usize> {
        let st = require_stored(tf)?;
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return Ok(0);
        };
        let obs_start = first.time;
        let obs_end = last.time + st.ms();
        let write = || -> Result<usize> {
            let now = self.now_ms();
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let count = upsert_bars(&tx, st, sid, bars)?;
            update_range_tx(&tx, sid, st, obs_start, obs_end, now, true)?;
            tx.commit()?;
            Ok(count)
        };
        match write() {
            Err(AppError::UniqueViolation(msg)) => {
                warn!(target: "klstore", sid, tf, error.details = %msg, "写入遇到唯一键冲突，重置 kinfo 后重试");
                self.reset_kinfo(sid, tf)?;
                write()
            }
            other => other,
        }
    }

    /// 删除 kinfo 行，下次 update_range 会按实际数据重建
    pub fn reset_kinfo(&self, sid: i32, tf: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kinfo WHERE sid = ?1 AND timeframe = ?2", params![sid, tf])?;
        Ok(())
    }

    pub fn get_kinfo(&self, sid: i32, tf: &str) -> Result<Option<KInfo>> {
        let conn = self.conn()?;
        get_kinfo_conn(&conn, sid, tf)
    }

    pub fn get_kholes(&self, sid: i32, tf: &str) -> Result<Vec<KHole>> {
        let conn = self.conn()?;
        load_holes_conn(&conn, sid, tf)
    }

    /// 标记交易所确认无数据的区间，这是 no_data=true 的唯一来源
    pub fn mark_nodata_holes(&self, sid: i32, tf: &str, windows: &[(i64, i64)]) -> Result<usize> {
        if windows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing = to_spans(&load_holes_conn(&tx, sid, tf)?);
        let marked = holes::mark_no_data(&existing, windows);
        let proven = marked.iter().filter(|h| h.no_data).count();
        if marked != existing {
            replace_holes_conn(&tx, sid, tf, &marked)?;
        }
        tx.commit()?;
        if proven > 0 {
            info!(target: "klstore", sid, tf, proven, "缺口已确认无数据");
        }
        Ok(proven)
    }

    /// 删除K线
    ///
    /// start 与 end 都为 0 时清空该周期的全部数据；否则按剩余数据重算 kinfo 并裁剪缺口。
    /// end 为 0 表示到最新，此时同时清除未完成K线。
    pub fn delete_range(&self, sid: i32, tfs: &[&str], start: i64, end: i64) -> Result<usize> {
        let mut total = 0;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for tf in tfs {
            let st = require_stored(tf)?;
            let table = st.table();
            if start == 0 && end == 0 {
                total += tx.execute(&format!("DELETE FROM {} WHERE sid = ?1", table), params![sid])?;
                tx.execute("DELETE FROM kinfo WHERE sid = ?1 AND timeframe = ?2", params![sid, st.tf])?;
                tx.execute("DELETE FROM khole WHERE sid = ?1 AND timeframe = ?2", params![sid, st.tf])?;
                tx.execute("DELETE FROM kline_un WHERE sid = ?1 AND timeframe = ?2", params![sid, st.tf])?;
                continue;
            }
            let stop = if end > 0 { end } else { i64::MAX };
            total += tx.execute(
                &format!("DELETE FROM {} WHERE sid = ?1 AND time >= ?2 AND time < ?3", table),
                params![sid, start, stop],
            )?;
            if end == 0 {
                tx.execute("DELETE FROM kline_un WHERE sid = ?1 AND timeframe = ?2", params![sid, st.tf])?;
            }

            let (min_t, max_t): (Option<i64>, Option<i64>) = tx.query_row(
                &format!("SELECT MIN(time), MAX(time) FROM {} WHERE sid = ?1", table),
                params![sid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let (Some(lo), Some(hi)) = (min_t, max_t) else {
                tx.execute("DELETE FROM kinfo WHERE sid = ?1 AND timeframe = ?2", params![sid, st.tf])?;
                tx.execute("DELETE FROM khole WHERE sid = ?1 AND timeframe = ?2", params![sid, st.tf])?;
                continue;
            };
            let new_stop = hi + st.ms();
            set_kinfo_conn(&tx, sid, st.tf, lo, new_stop)?;
            let mut spans = to_spans(&load_holes_conn(&tx, sid, st.tf)?);
            // 区间中间被删掉的部分成为缺口
            if start > lo && stop < new_stop {
                spans.push(HoleSpan::new(start, stop, false));
            }
            let spans = holes::clip(&holes::normalize(spans), lo, new_stop);
            replace_holes_conn(&tx, sid, st.tf, &spans)?;
        }
        tx.commit()?;
        info!(target: "klstore", sid, tfs = ?tfs, start, end, deleted = total, "已删除K线");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use crate::klcommon::timeframe::{DAY_MS, MINUTE_MS};
    use crate::klcommon::Kline;
    use crate::klstore::test_util::temp_store;

    fn minutes(idx: impl IntoIterator<Item = i64>) -> Vec<Kline> {
        idx.into_iter()
            .map(|i| Kline::new(i * MINUTE_MS, 10.0, 11.0, 9.0, 10.5, 1.0))
            .collect()
    }

    #[test]
    fn test_single_gap_detected() {
        let (_dir, store, _clock) = temp_store(DAY_MS);
        let sid = store.get_exsymbol("binance", "spot", "BTCUSDT").unwrap().id;
        store.insert_klines("1m", sid, &minutes([0, 1, 3, 4])).unwrap();
        store.update_range(sid, "1m", 0, 5 * MINUTE_MS).unwrap();

        let holes = store.get_kholes(sid, "1m").unwrap();
        assert_eq!(holes.len(), 1);
        assert_eq!((holes[0].start, holes[0].stop, holes[0].no_data), (120_000, 180_000, false));
    }

    #[test]
    fn test_gap_backfill_kinfo_and_hole() {
        let (_dir, store, _clock) = temp_store(DAY_MS);
        let sid = store.get_exsymbol("binance", "spot", "ETHUSDT").unwrap().id;
        let bars: Vec<Kline> = minutes((0..5).chain(8..13));
        store.insert_klines("1m", sid, &bars).unwrap();
        store.update_range(sid, "1m", 0, 13 * MINUTE_MS).unwrap();

        let info = store.get_kinfo(sid, "1m").unwrap().unwrap();
        assert_eq!((info.start, info.stop), (0, 780_000));
        let holes = store.get_kholes(sid, "1m").unwrap();
        assert_eq!(holes.len(), 1);
        assert_eq!((holes[0].start, holes[0].stop, holes[0].no_data), (300_000, 480_000, false));

        // 补上缺口后缺口消失
        store.insert_auto("1m", sid, &minutes(5..8)).unwrap();
        assert!(store.get_kholes(sid, "1m").unwrap().is_empty());
    }

    #[test]
    fn test_disjoint_insert_records_gap_between_ranges() {
        let (_dir, store, _clock) = temp_store(DAY_MS);
        let sid = store.get_exsymbol("binance", "spot", "BNBUSDT").unwrap().id;
        store.insert_auto("1m", sid, &minutes(0..3)).unwrap();
        store.insert_auto("1m", sid, &minutes(10..12)).unwrap();
        let info = store.get_kinfo(sid, "1m").unwrap().unwrap();
        assert_eq!((info.start, info.stop), (0, 12 * MINUTE_MS));
        let holes = store.get_kholes(sid, "1m").unwrap();
        assert_eq!(holes.len(), 1);
        assert_eq!((holes[0].start, holes[0].stop), (3 * MINUTE_MS, 10 * MINUTE_MS));
    }

    #[test]
    fn test_rollup_to_five_minutes() {
        let (_dir, store, _clock) = temp_store(DAY_MS);
        let sid = store.get_exsymbol("binance", "spot", "XRPUSDT").unwrap().id;
        store.insert_auto("1m", sid, &minutes(0..10)).unwrap();
        let five = store.query_ohlcv(sid, "5m", 0, 10 * MINUTE_MS, 0, false).unwrap();
        assert_eq!(five.len(), 2);
        assert_eq!(five[0].volume, 5.0);
        assert_eq!(five[1].time, 5 * MINUTE_MS);
        let info = store.get_kinfo(sid, "5m").unwrap().unwrap();
        assert_eq!((info.start, info.stop), (0, 10 * MINUTE_MS));
    }

    #[test]
    fn test_mark_nodata_keeps_flag_on_rescan() {
        let (_dir, store, _clock) = temp_store(DAY_MS);
        let sid = store.get_exsymbol("binance", "spot", "ADAUSDT").unwrap().id;
        store.insert_auto("1m", sid, &minutes([0, 1, 6, 7])).unwrap();
        assert_eq!(store.mark_nodata_holes(sid, "1m", &[(2 * MINUTE_MS, 6 * MINUTE_MS)]).unwrap(), 1);
        store.insert_auto("1m", sid, &minutes([7, 8])).unwrap();
        store.update_range(sid, "1m", 0, 9 * MINUTE_MS).unwrap();
        let holes = store.get_kholes(sid, "1m").unwrap();
        assert_eq!(holes.len(), 1);
        assert!(holes[0].no_data, "确认无数据的标记在重新扫描后应保留");
    }

    #[test]
    fn test_delete_range_recomputes_kinfo() {
        let (_dir, store, _clock) = temp_store(DAY_MS);
        let sid = store.get_exsymbol("binance", "spot", "DOGEUSDT").unwrap().id;
        store.insert_auto("1m", sid, &minutes(0..10)).unwrap();

        store.delete_range(sid, &["1m"], 8 * MINUTE_MS, 0).unwrap();
        let info = store.get_kinfo(sid, "1m").unwrap().unwrap();
        assert_eq!((info.start, info.stop), (0, 8 * MINUTE_MS));

        store.delete_range(sid, &["1m"], 3 * MINUTE_MS, 5 * MINUTE_MS).unwrap();
        let holes = store.get_kholes(sid, "1m").unwrap();
        assert_eq!(holes.len(), 1);
        assert_eq!((holes[0].start, holes[0].stop), (3 * MINUTE_MS, 5 * MINUTE_MS));

        store.delete_range(sid, &["1m"], 0, 0).unwrap();
        assert!(store.get_kinfo(sid, "1m").unwrap().is_none());
        assert!(store.get_kholes(sid, "1m").unwrap().is_empty());
    }

    #[test]
    fn test_unaligned_bar_rejected() {
        let (_dir, store, _clock) = temp_store(DAY_MS);
        let bad = vec![Kline::new(30_000, 1.0, 1.0, 1.0, 1.0, 1.0)];
        assert!(matches!(
            store.insert_klines("1m", 1, &bad),
            Err(crate::klcommon::AppError::InvalidBar(_))
        ));
        assert!(store.insert_klines("4h", 1, &minutes(0..1)).is_err());
    }
}
