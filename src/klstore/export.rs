//! 导出/导入数据包
//!
//! `exinfo.pb`：一条长度前缀的 [`ExInfo`]（品种、缺口、复权因子、日历）。
//! `klines_NNNN.pb`：若干长度前缀的 [`KlineBlock`]，每个文件不超过 1 GiB，
//! 每个块只包含一段连续的K线，遇到缺口就开新块。

use super::KlineStore;
use crate::klcommon::timeframe::{stored_tf, tf_to_ms};
use crate::klcommon::{AdjFactor, AppError, ExSymbol, Kline, Result};
use bytes::{Buf, Bytes};
use prost::Message;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const EXINFO_FILE: &str = "exinfo.pb";
/// 单个K线文件的大小上限
pub const MAX_KLINE_FILE_BYTES: u64 = 1 << 30;
/// 导出时每次从库中读取的K线数
const EXPORT_READ_BARS: i64 = 50_000;

#[derive(Clone, PartialEq, Message)]
pub struct PbSymbol {
    #[prost(int32, tag = "1")]
    pub id: i32,
    #[prost(string, tag = "2")]
    pub exchange: String,
    #[prost(string, tag = "3")]
    pub exg_real: String,
    #[prost(string, tag = "4")]
    pub market: String,
    #[prost(string, tag = "5")]
    pub symbol: String,
    #[prost(bool, tag = "6")]
    pub combined: bool,
    #[prost(int64, tag = "7")]
    pub list_ms: i64,
    #[prost(int64, tag = "8")]
    pub delist_ms: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PbHole {
    #[prost(int32, tag = "1")]
    pub sid: i32,
    #[prost(string, tag = "2")]
    pub timeframe: String,
    #[prost(int64, tag = "3")]
    pub start: i64,
    #[prost(int64, tag = "4")]
    pub stop: i64,
    #[prost(bool, tag = "5")]
    pub no_data: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct PbAdjFactor {
    #[prost(int32, tag = "1")]
    pub sid: i32,
    #[prost(int32, tag = "2")]
    pub sub_id: i32,
    #[prost(int64, tag = "3")]
    pub start_ms: i64,
    #[prost(double, tag = "4")]
    pub factor: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PbCalendar {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub start_ms: i64,
    #[prost(int64, tag = "3")]
    pub stop_ms: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ExInfo {
    #[prost(message, repeated, tag = "1")]
    pub symbols: Vec<PbSymbol>,
    #[prost(message, repeated, tag = "2")]
    pub holes: Vec<PbHole>,
    #[prost(message, repeated, tag = "3")]
    pub adj_factors: Vec<PbAdjFactor>,
    #[prost(message, repeated, tag = "4")]
    pub calendars: Vec<PbCalendar>,
}

/// 一段连续K线，按列存储
#[derive(Clone, PartialEq, Message)]
pub struct KlineBlock {
    #[prost(int64, tag = "1")]
    pub start_ms: i64,
    #[prost(int64, tag = "2")]
    pub end_ms: i64,
    #[prost(int32, tag = "3")]
    pub sid: i32,
    #[prost(string, tag = "4")]
    pub tf: String,
    #[prost(double, repeated, tag = "5")]
    pub open: Vec<f64>,
    #[prost(double, repeated, tag = "6")]
    pub high: Vec<f64>,
    #[prost(double, repeated, tag = "7")]
    pub low: Vec<f64>,
    #[prost(double, repeated, tag = "8")]
    pub close: Vec<f64>,
    #[prost(double, repeated, tag = "9")]
    pub volume: Vec<f64>,
    #[prost(double, repeated, tag = "10")]
    pub info: Vec<f64>,
}

impl KlineBlock {
    fn from_run(sid: i32, tf: &str, tf_ms: i64, run: &[Kline]) -> Self {
        let mut block = KlineBlock {
            start_ms: run.first().map(|b| b.time).unwrap_or(0),
            end_ms: run.last().map(|b| b.time + tf_ms).unwrap_or(0),
            sid,
            tf: tf.to_string(),
            ..Default::default()
        };
        for b in run {
            block.open.push(b.open);
            block.high.push(b.high);
            block.low.push(b.low);
            block.close.push(b.close);
            block.volume.push(b.volume);
            block.info.push(b.info);
        }
        block
    }

    /// 还原为K线，列长度不一致时报错
    pub fn to_klines(&self) -> Result<Vec<Kline>> {
        let tf_ms = tf_to_ms(&self.tf)?;
        let n = self.open.len();
        if [self.high.len(), self.low.len(), self.close.len(), self.volume.len()].iter().any(|l| *l != n)
            || self.start_ms + n as i64 * tf_ms != self.end_ms
        {
            return Err(AppError::DataError(format!(
                "K线块列长度不一致: sid={} tf={} start={}",
                self.sid, self.tf, self.start_ms
            )));
        }
        Ok((0..n)
            .map(|i| Kline {
                time: self.start_ms + i as i64 * tf_ms,
                open: self.open[i],
                high: self.high[i],
                low: self.low[i],
                close: self.close[i],
                volume: self.volume[i],
                info: self.info.get(i).copied().unwrap_or(0.0),
            })
            .collect())
    }
}

/// 按连续性切分
pub fn split_runs(bars: &[Kline], tf_ms: i64) -> Vec<&[Kline]> {
    let mut runs = Vec::new();
    let mut begin = 0;
    for i in 1..bars.len() {
        if bars[i].time != bars[i - 1].time + tf_ms {
            runs.push(&bars[begin..i]);
            begin = i;
        }
    }
    if begin < bars.len() {
        runs.push(&bars[begin..]);
    }
    runs
}

/// 自动滚动文件的K线块写入器
struct BlockWriter {
    dir: PathBuf,
    max_bytes: u64,
    index: usize,
    written: u64,
    file: Option<BufWriter<File>>,
    files: Vec<PathBuf>,
}

impl BlockWriter {
    fn new(dir: &Path, max_bytes: u64) -> Self {
        Self { dir: dir.to_path_buf(), max_bytes, index: 0, written: 0, file: None, files: Vec::new() }
    }

    fn write(&mut self, block: &KlineBlock) -> Result<()> {
        let data = block.encode_length_delimited_to_vec();
        let size = data.len() as u64;
        if self.file.is_none() || (self.written > 0 && self.written + size > self.max_bytes) {
            self.roll()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&data)?;
            self.written += size;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        if let Some(mut old) = self.file.take() {
            old.flush()?;
        }
        self.index += 1;
        let path = self.dir.join(format!("klines_{:04}.pb", self.index));
        self.file = Some(BufWriter::new(File::create(&path)?));
        self.files.push(path);
        self.written = 0;
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<PathBuf>> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(self.files)
    }
}

/// 导出结果统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BundleStats {
    pub symbols: usize,
    pub blocks: usize,
    pub bars: usize,
    pub files: usize,
}

impl KlineStore {
    /// 导出 sids 在 tfs 上 [start, end) 的数据；end 为 0 表示不限
    pub fn export_bundle(&self, dir: &Path, sids: &[i32], tfs: &[&str], start: i64, end: i64) -> Result<BundleStats> {
        self.export_bundle_with_limit(dir, sids, tfs, start, end, MAX_KLINE_FILE_BYTES)
    }

    pub(crate) fn export_bundle_with_limit(
        &self,
        dir: &Path,
        sids: &[i32],
        tfs: &[&str],
        start: i64,
        end: i64,
        max_bytes: u64,
    ) -> Result<BundleStats> {
        std::fs::create_dir_all(dir)?;
        let stop = if end > 0 { end } else { i64::MAX };
        let mut stats = BundleStats::default();

        let mut info = ExInfo::default();
        for sid in sids {
            let exs = self.get_exsymbol_by_id(*sid)?;
            info.symbols.push(PbSymbol {
                id: exs.id,
                exchange: exs.exchange.clone(),
                exg_real: exs.exg_real.clone(),
                market: exs.market.clone(),
                symbol: exs.symbol.clone(),
                combined: exs.combined,
                list_ms: exs.list_ms,
                delist_ms: exs.delist_ms,
            });
            for tf in tfs {
                for h in self.get_kholes(*sid, tf)? {
                    info.holes.push(PbHole { sid: h.sid, timeframe: h.timeframe, start: h.start, stop: h.stop, no_data: h.no_data });
                }
            }
            for f in self.get_adj_factors(*sid)?.iter() {
                info.adj_factors.push(PbAdjFactor { sid: f.sid, sub_id: f.sub_id, start_ms: f.start_ms, factor: f.factor });
            }
        }
        for name in self.calendar_names()? {
            for c in self.get_calendars(&name, 0, 0)? {
                info.calendars.push(PbCalendar { name: c.name, start_ms: c.start_ms, stop_ms: c.stop_ms });
            }
        }
        stats.symbols = info.symbols.len();
        std::fs::write(dir.join(EXINFO_FILE), info.encode_length_delimited_to_vec())?;

        let mut writer = BlockWriter::new(dir, max_bytes);
        for sid in sids {
            for tf in tfs {
                let st = stored_tf(tf)
                    .ok_or_else(|| AppError::InvalidTimeframe(format!("{} 不是持久化周期", tf)))?;
                let Some(kinfo) = self.get_kinfo(*sid, tf)? else {
                    continue;
                };
                let tf_ms = st.ms();
                let mut cursor = start.max(kinfo.start);
                let range_end = stop.min(kinfo.stop);
                // 跨批次时把上一批的尾段拼到下一批，保证块内连续
                let mut pending: Vec<Kline> = Vec::new();
                while cursor < range_end {
                    let batch_end = range_end.min(cursor.saturating_add(EXPORT_READ_BARS * tf_ms));
                    let conn = self.conn()?;
                    let bars = super::query::read_bars(&conn, st, *sid, cursor, batch_end)?;
                    drop(conn);
                    pending.extend(bars);
                    cursor = batch_end;
                    let runs = split_runs(&pending, tf_ms);
                    let Some((tail, full)) = runs.split_last() else {
                        continue;
                    };
                    for run in full {
                        writer.write(&KlineBlock::from_run(*sid, tf, tf_ms, run))?;
                        stats.blocks += 1;
                        stats.bars += run.len();
                    }
                    pending = tail.to_vec();
                }
                if !pending.is_empty() {
                    writer.write(&KlineBlock::from_run(*sid, tf, tf_ms, &pending))?;
                    stats.blocks += 1;
                    stats.bars += pending.len();
                }
            }
        }
        stats.files = writer.finish()?.len();
        info!(target: "klstore", dir = %dir.display(), ?stats, "数据包导出完成");
        Ok(stats)
    }

    /// 导入数据包，品种按自然键映射为本库的 id
    pub fn import_bundle(&self, dir: &Path) -> Result<BundleStats> {
        let mut stats = BundleStats::default();
        let mut buf = Bytes::from(std::fs::read(dir.join(EXINFO_FILE))?);
        let info = ExInfo::decode_length_delimited(&mut buf)?;

        let items: Vec<ExSymbol> = info
            .symbols
            .iter()
            .map(|s| ExSymbol {
                id: 0,
                exchange: s.exchange.clone(),
                exg_real: s.exg_real.clone(),
                market: s.market.clone(),
                symbol: s.symbol.clone(),
                combined: s.combined,
                list_ms: s.list_ms,
                delist_ms: s.delist_ms,
            })
            .collect();
        let created = self.ensure_exsymbols(&items)?;
        let mut id_map: HashMap<i32, i32> = HashMap::new();
        for (src, dst) in info.symbols.iter().zip(created.iter()) {
            id_map.insert(src.id, dst.id);
            if (dst.list_ms, dst.delist_ms) != (src.list_ms, src.delist_ms) {
                self.set_list_ms(dst.id, src.list_ms, src.delist_ms)?;
            }
        }
        stats.symbols = created.len();
        let map_id = |id: i32| id_map.get(&id).copied().unwrap_or(id);

        let mut factors: HashMap<i32, Vec<AdjFactor>> = HashMap::new();
        for f in &info.adj_factors {
            let sid = map_id(f.sid);
            factors.entry(sid).or_default().push(AdjFactor {
                id: 0,
                sid,
                sub_id: map_id(f.sub_id),
                start_ms: f.start_ms,
                factor: f.factor,
            });
        }
        for (sid, list) in &factors {
            self.insert_adj_factors(*sid, list)?;
        }
        let mut cals: HashMap<&str, Vec<(i64, i64)>> = HashMap::new();
        for c in &info.calendars {
            cals.entry(c.name.as_str()).or_default().push((c.start_ms, c.stop_ms));
        }
        for (name, windows) in &cals {
            self.insert_calendars(name, windows)?;
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("klines_") && n.ends_with(".pb"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        for path in &files {
            let mut buf = Bytes::from(std::fs::read(path)?);
            while buf.has_remaining() {
                let block = KlineBlock::decode_length_delimited(&mut buf)?;
                let sid = map_id(block.sid);
                let bars = block.to_klines()?;
                self.insert_klines(&block.tf, sid, &bars)?;
                self.update_range(sid, &block.tf, block.start_ms, block.end_ms)?;
                stats.blocks += 1;
                stats.bars += bars.len();
            }
        }
        stats.files = files.len();

        // 已确认无数据的缺口需要在区间重建后重新标记
        let mut proven: HashMap<(i32, String), Vec<(i64, i64)>> = HashMap::new();
        for h in info.holes.iter().filter(|h| h.no_data) {
            proven.entry((map_id(h.sid), h.timeframe.clone())).or_default().push((h.start, h.stop));
        }
        for ((sid, tf), windows) in &proven {
            if let Err(e) = self.mark_nodata_holes(*sid, tf, windows) {
                warn!(target: "klstore", sid, tf = %tf, error.details = %e, "恢复无数据标记失败");
            }
        }
        info!(target: "klstore", dir = %dir.display(), ?stats, "数据包导入完成");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::timeframe::{DAY_MS, MINUTE_MS};
    use crate::klstore::test_util::temp_store;

    fn minutes(idx: impl IntoIterator<Item = i64>) -> Vec<Kline> {
        idx.into_iter()
            .map(|i| Kline::new(i * MINUTE_MS, 1.0 + i as f64, 2.0 + i as f64, 0.5, 1.5 + i as f64, 3.0))
            .collect()
    }

    #[test]
    fn test_split_runs_on_gap() {
        let bars = minutes([0, 1, 2, 5, 6, 9]);
        let runs = split_runs(&bars, MINUTE_MS);
        assert_eq!(runs.iter().map(|r| r.len()).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn test_export_then_import_into_fresh_store() {
        let (_src_dir, src, _clock) = temp_store(DAY_MS);
        let sid = src.get_exsymbol("binance", "spot", "BTCUSDT").unwrap().id;
        src.insert_auto("1m", sid, &minutes((0..4).chain(6..10))).unwrap();
        src.mark_nodata_holes(sid, "1m", &[(4 * MINUTE_MS, 6 * MINUTE_MS)]).unwrap();
        src.insert_calendars("binance", &[(0, DAY_MS)]).unwrap();

        let bundle = tempfile::tempdir().unwrap();
        let stats = src.export_bundle(bundle.path(), &[sid], &["1m"], 0, 0).unwrap();
        assert_eq!(stats.blocks, 2, "缺口处拆成两个块");
        assert_eq!(stats.bars, 8);

        // 目标库先建一个别的品种，使 id 不同
        let (_dst_dir, dst, _clock2) = temp_store(DAY_MS);
        dst.get_exsymbol("binance", "spot", "ETHUSDT").unwrap();
        let imported = dst.import_bundle(bundle.path()).unwrap();
        assert_eq!(imported.bars, 8);

        let new_sid = dst.find_exsymbol("binance", "spot", "BTCUSDT").unwrap().id;
        assert_ne!(new_sid, sid);
        let bars = dst.query_ohlcv(new_sid, "1m", 0, 10 * MINUTE_MS, 0, false).unwrap();
        assert_eq!(bars, src.query_ohlcv(sid, "1m", 0, 10 * MINUTE_MS, 0, false).unwrap());
        let holes = dst.get_kholes(new_sid, "1m").unwrap();
        assert_eq!(holes.len(), 1);
        assert!(holes[0].no_data);
        assert_eq!(dst.get_calendars("binance", 0, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_block_files_roll_over() {
        let (_dir, store, _clock) = temp_store(DAY_MS);
        let sid = store.get_exsymbol("binance", "spot", "ETHUSDT").unwrap().id;
        store.insert_auto("1m", sid, &minutes([0, 1, 3, 4, 6, 7])).unwrap();
        let bundle = tempfile::tempdir().unwrap();
        let stats = store
            .export_bundle_with_limit(bundle.path(), &[sid], &["1m"], 0, 0, 64)
            .unwrap();
        assert_eq!(stats.blocks, 3);
        assert!(stats.files >= 2, "超过上限时应滚动到新文件");
    }
}
