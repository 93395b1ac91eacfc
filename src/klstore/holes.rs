//! K线缺口的区间运算
//!
//! 所有区间都是 [start, stop) 且已对齐到周期。

/// 不带 id 的缺口区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoleSpan {
    pub start: i64,
    pub stop: i64,
    pub no_data: bool,
}

impl HoleSpan {
    pub fn new(start: i64, stop: i64, no_data: bool) -> Self {
        Self { start, stop, no_data }
    }
}

/// 在 [scan_start, scan_end) 内根据已存K线时间找出缺口
///
/// 尾部缺口不会越过 `max_end`（当前尚未结束的桶不算缺口）。
pub fn find_gaps(times: &[i64], scan_start: i64, scan_end: i64, tf_ms: i64, max_end: i64) -> Vec<(i64, i64)> {
    let limit = scan_end.min(max_end);
    let mut gaps = Vec::new();
    let (Some(first), Some(last)) = (times.first(), times.last()) else {
        if scan_start < limit {
            gaps.push((scan_start, limit));
        }
        return gaps;
    };
    if *first > scan_start {
        gaps.push((scan_start, *first));
    }
    for w in times.windows(2) {
        if w[1] - w[0] > tf_ms {
            gaps.push((w[0] + tf_ms, w[1]));
        }
    }
    if last + tf_ms < limit {
        gaps.push((last + tf_ms, limit));
    }
    gaps
}

/// 排序并合并相接或重叠、且 no_data 标记相同的区间
pub fn normalize(mut holes: Vec<HoleSpan>) -> Vec<HoleSpan> {
    holes.retain(|h| h.start < h.stop);
    holes.sort_by_key(|h| (h.start, h.stop));
    let mut out: Vec<HoleSpan> = Vec::with_capacity(holes.len());
    for h in holes {
        match out.last_mut() {
            Some(prev) if prev.no_data == h.no_data && h.start <= prev.stop => {
                prev.stop = prev.stop.max(h.stop);
            }
            _ => out.push(h),
        }
    }
    out
}

/// 从 h 中扣除 [start, stop)
fn subtract(h: &HoleSpan, start: i64, stop: i64) -> Vec<HoleSpan> {
    if h.stop <= start || h.start >= stop {
        return vec![*h];
    }
    let mut parts = Vec::with_capacity(2);
    if h.start < start {
        parts.push(HoleSpan::new(h.start, start, h.no_data));
    }
    if h.stop > stop {
        parts.push(HoleSpan::new(stop, h.stop, h.no_data));
    }
    parts
}

/// 将 [start, stop) 按 `proven` 切分：与其重叠的部分标记为 no_data
fn split_by_proven(start: i64, stop: i64, proven: &[(i64, i64)]) -> Vec<HoleSpan> {
    let mut out = Vec::new();
    let mut cursor = start;
    for (ps, pe) in proven {
        let s = (*ps).max(cursor);
        let e = (*pe).min(stop);
        if s >= e {
            continue;
        }
        if cursor < s {
            out.push(HoleSpan::new(cursor, s, false));
        }
        out.push(HoleSpan::new(s, e, true));
        cursor = e;
    }
    if cursor < stop {
        out.push(HoleSpan::new(cursor, stop, false));
    }
    out
}

/// 用扫描区间内重新检测出的缺口替换旧记录
///
/// 扫描区间外的旧缺口保留；区间内已被确认无数据的部分保留 no_data 标记；
/// 已被K线填上的旧缺口消失。
pub fn merge_holes(existing: &[HoleSpan], scan_start: i64, scan_end: i64, detected: &[(i64, i64)]) -> Vec<HoleSpan> {
    let mut proven: Vec<(i64, i64)> = existing
        .iter()
        .filter(|h| h.no_data)
        .map(|h| (h.start.max(scan_start), h.stop.min(scan_end)))
        .filter(|(s, e)| s < e)
        .collect();
    proven.sort();

    let mut out: Vec<HoleSpan> = existing
        .iter()
        .flat_map(|h| subtract(h, scan_start, scan_end))
        .collect();
    for (s, e) in detected {
        out.extend(split_by_proven(*s, *e, &proven));
    }
    normalize(out)
}

/// 将落在 windows 内的缺口部分标记为已确认无数据
pub fn mark_no_data(existing: &[HoleSpan], windows: &[(i64, i64)]) -> Vec<HoleSpan> {
    let mut wins: Vec<(i64, i64)> = windows.iter().copied().filter(|(s, e)| s < e).collect();
    wins.sort();
    let mut out = Vec::with_capacity(existing.len());
    for h in existing {
        if h.no_data {
            out.push(*h);
            continue;
        }
        out.extend(split_by_proven(h.start, h.stop, &wins));
    }
    normalize(out)
}

/// 裁剪到 [start, stop)
pub fn clip(holes: &[HoleSpan], start: i64, stop: i64) -> Vec<HoleSpan> {
    holes
        .iter()
        .map(|h| HoleSpan::new(h.start.max(start), h.stop.min(stop), h.no_data))
        .filter(|h| h.start < h.stop)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: i64 = 60_000;

    #[test]
    fn test_find_gaps_middle() {
        let times = [0, M, 3 * M, 4 * M];
        assert_eq!(find_gaps(&times, 0, 5 * M, M, i64::MAX), vec![(2 * M, 3 * M)]);
    }

    #[test]
    fn test_find_gaps_edges() {
        let times = [2 * M, 3 * M];
        assert_eq!(
            find_gaps(&times, 0, 6 * M, M, i64::MAX),
            vec![(0, 2 * M), (4 * M, 6 * M)]
        );
        // 尾部不越过当前桶
        assert_eq!(find_gaps(&times, 0, 6 * M, M, 5 * M), vec![(0, 2 * M), (4 * M, 5 * M)]);
        assert_eq!(find_gaps(&[], 0, 3 * M, M, i64::MAX), vec![(0, 3 * M)]);
    }

    #[test]
    fn test_merge_touching_holes() {
        let existing = [HoleSpan::new(0, 2 * M, false)];
        let merged = merge_holes(&existing, 5 * M, 10 * M, &[(5 * M, 6 * M)]);
        assert_eq!(merged, vec![HoleSpan::new(0, 2 * M, false), HoleSpan::new(5 * M, 6 * M, false)]);

        let existing = [HoleSpan::new(0, 5 * M, false)];
        let merged = merge_holes(&existing, 5 * M, 10 * M, &[(5 * M, 6 * M)]);
        assert_eq!(merged, vec![HoleSpan::new(0, 6 * M, false)], "相接区间应合并");
    }

    #[test]
    fn test_filled_hole_disappears() {
        let existing = [HoleSpan::new(2 * M, 4 * M, false)];
        let merged = merge_holes(&existing, 0, 10 * M, &[]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_no_data_flag_survives_rescan() {
        let existing = [HoleSpan::new(2 * M, 4 * M, true)];
        let merged = merge_holes(&existing, 0, 10 * M, &[(2 * M, 6 * M)]);
        assert_eq!(
            merged,
            vec![HoleSpan::new(2 * M, 4 * M, true), HoleSpan::new(4 * M, 6 * M, false)]
        );
    }

    #[test]
    fn test_mark_no_data_splits() {
        let existing = [HoleSpan::new(0, 10 * M, false)];
        let marked = mark_no_data(&existing, &[(2 * M, 4 * M)]);
        assert_eq!(
            marked,
            vec![
                HoleSpan::new(0, 2 * M, false),
                HoleSpan::new(2 * M, 4 * M, true),
                HoleSpan::new(4 * M, 10 * M, false),
            ]
        );
    }
}
