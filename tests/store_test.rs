mod common;

use common::{minute, minute_bars, temp_store, FakeExchange};
use kline_hub::kldata::{Downloader, ExchangeRef};
use kline_hub::klcommon::config::DownloadConfig;
use kline_hub::klcommon::{AppError, ExSymbol};
use tokio_util::sync::CancellationToken;

#[test]
fn test_gap_detected_then_backfilled() {
    let (_dir, store, _) = temp_store(minute(100));
    let sid = store.get_exsymbol("binance", "linear", "BTCUSDT").unwrap().id;

    store.insert_klines("1m", sid, &minute_bars(&[0, 1, 2, 3, 4])).unwrap();
    store.update_range(sid, "1m", minute(0), minute(5)).unwrap();
    store.insert_klines("1m", sid, &minute_bars(&[8, 9])).unwrap();
    store.update_range(sid, "1m", minute(8), minute(10)).unwrap();

    let info = store.get_kinfo(sid, "1m").unwrap().unwrap();
    assert_eq!((info.start, info.stop), (minute(0), minute(10)));
    let holes = store.get_kholes(sid, "1m").unwrap();
    assert_eq!(holes.len(), 1);
    assert_eq!((holes[0].start, holes[0].stop, holes[0].no_data), (minute(5), minute(8), false));

    store.insert_klines("1m", sid, &minute_bars(&[5, 6, 7])).unwrap();
    store.update_range(sid, "1m", minute(5), minute(8)).unwrap();
    assert!(store.get_kholes(sid, "1m").unwrap().is_empty());
    let info = store.get_kinfo(sid, "1m").unwrap().unwrap();
    assert_eq!((info.start, info.stop), (minute(0), minute(10)));
    assert_eq!(store.query_ohlcv(sid, "1m", minute(0), minute(10), 0, false).unwrap().len(), 10);
}

#[test]
fn test_export_then_import_bundle() {
    let (_src_dir, src, _) = temp_store(minute(100));
    let sid = src.get_exsymbol("binance", "linear", "ETHUSDT").unwrap().id;
    let bars = minute_bars(&(0..20).collect::<Vec<_>>());
    src.insert_auto("1m", sid, &bars).unwrap();

    let bundle = tempfile::tempdir().unwrap();
    let stats = src.export_bundle(bundle.path(), &[sid], &["1m"], 0, 0).unwrap();
    assert_eq!(stats.symbols, 1);
    assert_eq!(stats.bars, 20);

    let (_dst_dir, dst, _) = temp_store(minute(100));
    // 目标库里先占用一个 id，导入时按自然键重新映射
    dst.get_exsymbol("binance", "spot", "BTCUSDT").unwrap();
    let imported = dst.import_bundle(bundle.path()).unwrap();
    assert_eq!(imported.bars, 20);
    let new_sid = dst.get_exsymbol("binance", "linear", "ETHUSDT").unwrap().id;
    assert_ne!(new_sid, sid);
    assert_eq!(dst.query_ohlcv(new_sid, "1m", minute(0), minute(20), 0, false).unwrap(), bars);
}

fn downloader(store: &kline_hub::klstore::KlineStore, fake: &std::sync::Arc<FakeExchange>) -> Downloader {
    let exchange: ExchangeRef = fake.clone();
    Downloader::new(store.clone(), exchange, DownloadConfig::default(), CancellationToken::new())
}

#[tokio::test]
async fn test_download_fetches_tail_then_head() {
    let (_dir, store, _) = temp_store(minute(100));
    let fake = FakeExchange::new();
    fake.set_bars("BTCUSDT", minute_bars(&(0..30).collect::<Vec<_>>()));
    let exs = store.ensure_exsymbols(&[ExSymbol::new_key("binance", "linear", "BTCUSDT")]).unwrap().remove(0);
    store.insert_klines("1m", exs.id, &minute_bars(&(10..20).collect::<Vec<_>>())).unwrap();
    store.update_range(exs.id, "1m", minute(10), minute(20)).unwrap();

    let dl = downloader(&store, &fake);
    let written = dl.download(&exs, "1m", minute(5), minute(30)).await.unwrap();
    assert_eq!(written, 15);
    let fetches: Vec<(i64, i64)> = fake.fetches().iter().map(|(_, s, e)| (*s, *e)).collect();
    assert_eq!(fetches, vec![(minute(20), minute(30)), (minute(5), minute(10))]);

    let info = store.get_kinfo(exs.id, "1m").unwrap().unwrap();
    assert_eq!((info.start, info.stop), (minute(5), minute(30)));
    assert!(store.get_kholes(exs.id, "1m").unwrap().is_empty());

    // 已覆盖的区间不再请求交易所
    dl.download(&exs, "1m", minute(5), minute(30)).await.unwrap();
    assert_eq!(fake.fetches().len(), 2);
}

#[tokio::test]
async fn test_fill_holes_marks_empty_exchange_windows() {
    let (_dir, store, _) = temp_store(minute(100));
    let fake = FakeExchange::new();
    fake.set_bars("BTCUSDT", minute_bars(&[5, 6]));
    let exs = store.get_exsymbol("binance", "linear", "BTCUSDT").unwrap();
    store.insert_klines("1m", exs.id, &minute_bars(&[0, 1, 2, 3, 4, 8, 9])).unwrap();
    store.update_range(exs.id, "1m", minute(0), minute(10)).unwrap();
    assert_eq!(store.get_kholes(exs.id, "1m").unwrap().len(), 1);

    let dl = downloader(&store, &fake);
    let filled = dl.fill_holes(&exs, "1m").await.unwrap();
    assert_eq!(filled, 2);
    let holes = store.get_kholes(exs.id, "1m").unwrap();
    assert_eq!(holes.len(), 1);
    assert_eq!((holes[0].start, holes[0].stop, holes[0].no_data), (minute(7), minute(8), true));

    // 已确认无数据的缺口不会再下载
    let before = fake.fetches().len();
    assert_eq!(dl.fill_holes(&exs, "1m").await.unwrap(), 0);
    assert_eq!(fake.fetches().len(), before);
}

#[tokio::test]
async fn test_bulk_down_reports_first_error() {
    let (_dir, store, _) = temp_store(minute(100));
    let fake = FakeExchange::new();
    fake.set_bars("BTCUSDT", minute_bars(&(0..10).collect::<Vec<_>>()));
    fake.fail_fetch("ETHUSDT");
    let items = store
        .ensure_exsymbols(&[
            ExSymbol::new_key("binance", "linear", "BTCUSDT"),
            ExSymbol::new_key("binance", "linear", "ETHUSDT"),
        ])
        .unwrap();

    let exchange: ExchangeRef = fake.clone();
    let config = DownloadConfig { max_retries: 0, ..DownloadConfig::default() };
    let dl = Downloader::new(store.clone(), exchange, config, CancellationToken::new());
    let err = dl.bulk_down(&items, "1m", minute(0), minute(10)).await.unwrap_err();
    assert!(matches!(err, AppError::ApiError(_)));

    // 失败的品种不影响其他品种落库
    let btc = items.iter().find(|e| e.symbol == "BTCUSDT").unwrap();
    assert_eq!(store.query_ohlcv(btc.id, "1m", minute(0), minute(10), 0, false).unwrap().len(), 10);
    let eth = items.iter().find(|e| e.symbol == "ETHUSDT").unwrap();
    assert!(store.get_kinfo(eth.id, "1m").unwrap().is_none());
}

#[tokio::test]
async fn test_failed_download_keeps_written_range() {
    let (_dir, store, _) = temp_store(minute(100));
    let fake = FakeExchange::new();
    fake.set_bars("BTCUSDT", minute_bars(&(0..10).collect::<Vec<_>>()));
    fake.fail_fetch_after("BTCUSDT", 1);
    let exs = store.get_exsymbol("binance", "linear", "BTCUSDT").unwrap();

    let exchange: ExchangeRef = fake.clone();
    let config = DownloadConfig { batch_size: 4, max_retries: 0, ..DownloadConfig::default() };
    let dl = Downloader::new(store.clone(), exchange, config, CancellationToken::new());
    let err = dl.download(&exs, "1m", minute(0), minute(10)).await.unwrap_err();
    assert!(matches!(err, AppError::ApiError(_)));
    assert_eq!(fake.fetches().len(), 2);

    // 第一批已写入的K线仍然记入区间
    let info = store.get_kinfo(exs.id, "1m").unwrap().unwrap();
    assert_eq!((info.start, info.stop), (minute(0), minute(4)));
    assert_eq!(store.query_ohlcv(exs.id, "1m", minute(0), minute(10), 0, false).unwrap(), minute_bars(&[0, 1, 2, 3]));
}
