//! K线聚合：把低周期K线合并为高周期K线
//!
//! 纯函数，不做 I/O，也不读取全局状态。

use crate::klcommon::timeframe::{align_tf_msecs, bucket_end};
use crate::klcommon::Kline;

/// 将 `bars`（同一子周期、按时间升序）聚合为 `to_tf_secs` 周期的K线
///
/// * `carry` 为上一次调用遗留的未完成目标K线，逻辑上排在输入之前
/// * `pre_fire` ∈ [0,1)：桶内已覆盖的比例达到 `1 - pre_fire` 即视为完成
/// * `from_tf_ms` 为子周期毫秒数，传 0 时按输入间距推断
///
/// 返回聚合结果以及最后一根是否已完成。非最后一根总是完成的，因为后续桶已经开始。
pub fn build_ohlcv(
    bars: &[Kline],
    to_tf_secs: i64,
    pre_fire: f64,
    carry: Option<&Kline>,
    from_tf_ms: i64,
) -> (Vec<Kline>, bool) {
    let to_ms = to_tf_secs * 1000;
    let from_ms = if from_tf_ms > 0 { from_tf_ms } else { infer_tf_ms(bars) };

    let mut out: Vec<Kline> = Vec::with_capacity(bars.len() / ((to_ms / from_ms.max(1)).max(1) as usize) + 2);
    if let Some(c) = carry {
        let mut c = *c;
        c.time = align_tf_msecs(c.time, to_ms);
        out.push(c);
    }
    if bars.is_empty() {
        return (out, false);
    }

    let mut last_end = 0;
    for bar in bars {
        let bucket = align_tf_msecs(bar.time, to_ms);
        match out.last_mut() {
            Some(cur) if cur.time == bucket => cur.merge(bar),
            Some(cur) if cur.time > bucket => {
                // 乱序的旧数据，不再回写已结束的桶
                tracing::warn!(bar_time = bar.time, bucket_time = cur.time, "聚合输入时间倒退，已忽略");
                continue;
            }
            _ => {
                let mut k = *bar;
                k.time = bucket;
                out.push(k);
            }
        }
        last_end = bar.time + from_ms;
    }

    let last_closed = match out.last() {
        Some(last) => {
            let pre_ms = if pre_fire > 0.0 { (to_ms as f64 * pre_fire).floor() as i64 } else { 0 };
            last_end >= bucket_end(last.time, to_ms) - pre_ms
        }
        None => false,
    };
    (out, last_closed)
}

fn infer_tf_ms(bars: &[Kline]) -> i64 {
    bars.windows(2)
        .map(|w| w[1].time - w[0].time)
        .filter(|d| *d > 0)
        .min()
        .unwrap_or(60_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::timeframe::MINUTE_MS;

    fn minute_bars(range: std::ops::Range<i64>) -> Vec<Kline> {
        range
            .map(|i| {
                let base = 100.0 + i as f64;
                Kline::new(i * MINUTE_MS, base, base + 2.0, base - 1.0, base + 1.0, 10.0 + i as f64)
            })
            .collect()
    }

    #[test]
    fn test_build_two_five_minute_bars() {
        let bars = minute_bars(0..10);
        let (out, closed) = build_ohlcv(&bars, 300, 0.0, None, MINUTE_MS);
        assert_eq!(out.len(), 2, "10根1m应聚合为2根5m");
        assert!(closed);
        assert_eq!(out[0].time, 0);
        assert_eq!(out[1].time, 5 * MINUTE_MS);

        let first = &out[0];
        assert_eq!(first.open, bars[0].open);
        assert_eq!(first.high, bars[..5].iter().map(|b| b.high).fold(f64::MIN, f64::max));
        assert_eq!(first.low, bars[..5].iter().map(|b| b.low).fold(f64::MAX, f64::min));
        assert_eq!(first.close, bars[4].close);
        assert_eq!(first.volume, bars[..5].iter().map(|b| b.volume).sum::<f64>());
    }

    #[test]
    fn test_build_incomplete_tail() {
        let bars = minute_bars(0..7);
        let (out, closed) = build_ohlcv(&bars, 300, 0.0, None, MINUTE_MS);
        assert_eq!(out.len(), 2);
        assert!(!closed, "第二个桶只有2根，未完成");
    }

    #[test]
    fn test_build_with_carry() {
        let bars = minute_bars(0..5);
        let (first, closed) = build_ohlcv(&bars[..3], 300, 0.0, None, MINUTE_MS);
        assert!(!closed);
        let (out, closed) = build_ohlcv(&bars[3..], 300, 0.0, first.last(), MINUTE_MS);
        assert!(closed);
        assert_eq!(out.len(), 1);
        let (full, _) = build_ohlcv(&bars, 300, 0.0, None, MINUTE_MS);
        assert_eq!(out[0], full[0], "分两次聚合结果应与一次聚合一致");
    }

    #[test]
    fn test_carry_from_previous_bucket_is_emitted_first() {
        let bars = minute_bars(0..8);
        let (part, _) = build_ohlcv(&bars[..4], 300, 0.0, None, MINUTE_MS);
        let (out, closed) = build_ohlcv(&bars[5..8], 300, 0.0, part.last(), MINUTE_MS);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time, 0);
        assert_eq!(out[1].time, 5 * MINUTE_MS);
        assert!(!closed);
    }

    #[test]
    fn test_pre_fire_closes_early() {
        let bars = minute_bars(0..3);
        let (out, closed) = build_ohlcv(&bars[..2], 300, 0.5, None, MINUTE_MS);
        assert_eq!(out.len(), 1);
        assert!(!closed, "2根不足一半以上");
        let (out, closed) = build_ohlcv(&bars, 300, 0.5, None, MINUTE_MS);
        assert_eq!(out.len(), 1);
        assert!(closed, "preFire=0.5 时3根即视为完成");
    }

    #[test]
    fn test_passthrough_same_tf() {
        let bars = minute_bars(0..3);
        let (out, closed) = build_ohlcv(&bars, 60, 0.0, None, MINUTE_MS);
        assert_eq!(out, bars);
        assert!(closed);
    }

    #[test]
    fn test_empty_input() {
        let (out, closed) = build_ohlcv(&[], 300, 0.0, None, MINUTE_MS);
        assert!(out.is_empty());
        assert!(!closed);
    }
}
