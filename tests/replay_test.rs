mod common;

use common::{minute, minute_bars, temp_store, FakeExchange, Record};
use kline_hub::kldata::{Downloader, ExchangeRef};
use kline_hub::klcommon::config::DownloadConfig;
use kline_hub::klcommon::{Clock, Result, SimClock};
use kline_hub::klfeed::provider::{warm_items, FeederFactory};
use kline_hub::klfeed::{
    DbKlineFeeder, Feeder, HistKLineFeeder, HistProvider, PairSource, Provider, RefreshSchedule, WarmItems,
};
use kline_hub::klstore::KlineStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn hist_factory(store: &KlineStore, clock: &Arc<SimClock>) -> FeederFactory<HistKLineFeeder> {
    let store = store.clone();
    let clock = clock.clone();
    Box::new(move |symbol: &str| {
        let exs = store.get_exsymbol("binance", "linear", symbol)?;
        let feeder = Feeder::new(exs, clock.clone(), 0.0);
        Ok(HistKLineFeeder::new(feeder, store.clone(), clock.clone()))
    })
}

fn seed(store: &KlineStore, symbol: &str, minutes: &[i64]) {
    let exs = store.get_exsymbol("binance", "linear", symbol).unwrap();
    store.insert_klines("1m", exs.id, &minute_bars(minutes)).unwrap();
}

fn replay_two_symbols(store: &KlineStore) -> Record {
    let clock = Arc::new(SimClock::new(minute(0)));
    let provider = Provider::new(store.clone(), hist_factory(store, &clock));
    let mut hist = HistProvider::new(provider, clock, minute(0), minute(10));
    let mut rec = Record::default();
    let items = warm_items(&[("XUSDT", &["1m"]), ("YUSDT", &["1m"])], 0).unwrap();
    hist.sub_warm_pairs(&items, &mut rec).unwrap();
    let stats = hist.run(&mut rec).unwrap();
    assert!(!stats.aborted);
    assert_eq!(stats.bars, 15);
    rec
}

#[test]
fn test_replay_merges_symbols_in_time_order() {
    let (_dir, store, _) = temp_store(minute(100));
    seed(&store, "XUSDT", &(0..10).collect::<Vec<_>>());
    seed(&store, "YUSDT", &[0, 2, 4, 6, 8]);

    let rec = replay_two_symbols(&store);
    let mut expected = Vec::new();
    for m in 0..10 {
        expected.push(("XUSDT".to_string(), "1m".to_string(), minute(m), false));
        if m % 2 == 0 {
            expected.push(("YUSDT".to_string(), "1m".to_string(), minute(m), false));
        }
    }
    assert_eq!(rec.0, expected);
}

#[test]
fn test_replay_is_deterministic() {
    let (_dir, store, _) = temp_store(minute(100));
    seed(&store, "XUSDT", &(0..10).collect::<Vec<_>>());
    seed(&store, "YUSDT", &[1, 3, 5, 7, 9]);

    let first = replay_two_symbols(&store);
    let second = replay_two_symbols(&store);
    assert_eq!(first.0, second.0);
}

#[test]
fn test_replay_sets_clock_to_bar_end() {
    let (_dir, store, _) = temp_store(minute(100));
    seed(&store, "XUSDT", &[0, 1, 2]);
    let clock = Arc::new(SimClock::new(0));
    let provider = Provider::new(store.clone(), hist_factory(&store, &clock));
    let mut hist = HistProvider::new(provider, clock.clone(), minute(0), minute(3));
    let mut rec = Record::default();
    hist.sub_warm_pairs(&warm_items(&[("XUSDT", &["1m"])], 0).unwrap(), &mut rec).unwrap();
    hist.run(&mut rec).unwrap();
    assert_eq!(clock.now_ms(), minute(3));
}

struct SwapPairs;

impl PairSource for SwapPairs {
    fn pairs(&mut self, _version: i64, _now_ms: i64) -> Result<WarmItems> {
        warm_items(&[("AUSDT", &["1m"]), ("CUSDT", &["1m"])], 2)
    }
}

#[test]
fn test_pair_refresh_during_replay() {
    let (_dir, store, _) = temp_store(minute(100));
    let all: Vec<i64> = (0..10).collect();
    for sym in ["AUSDT", "BUSDT", "CUSDT"] {
        seed(&store, sym, &all);
    }
    let clock = Arc::new(SimClock::new(minute(0)));
    let provider = Provider::new(store.clone(), hist_factory(&store, &clock));
    // 每5分钟刷新一次，第一次在 minute(2)
    let schedule = RefreshSchedule::parse("0 */5 * * * *").unwrap();
    assert_eq!(schedule.next_after(minute(0)), Some(minute(2)));
    let mut hist = HistProvider::new(provider, clock, minute(0), minute(10)).with_refresh(schedule, Box::new(SwapPairs));

    let mut rec = Record::default();
    let items = warm_items(&[("AUSDT", &["1m"]), ("BUSDT", &["1m"])], 0).unwrap();
    hist.sub_warm_pairs(&items, &mut rec).unwrap();
    let stats = hist.run(&mut rec).unwrap();
    assert!(stats.refreshes >= 1);

    let b_times: Vec<i64> = rec.0.iter().filter(|r| r.0 == "BUSDT").map(|r| r.2).collect();
    assert_eq!(b_times, vec![minute(0), minute(1)]);

    let c_calls: Vec<&(String, String, i64, bool)> = rec.0.iter().filter(|r| r.0 == "CUSDT").collect();
    let warm: Vec<i64> = c_calls.iter().filter(|r| r.3).map(|r| r.2).collect();
    assert_eq!(warm, vec![minute(1), minute(2)]);
    let first_live = c_calls.iter().position(|r| !r.3).unwrap();
    assert!(c_calls[..first_live].iter().all(|r| r.3));
    assert!(c_calls[first_live..].iter().all(|r| !r.3));
    assert_eq!(c_calls[first_live].2, minute(3));
    assert_eq!(c_calls.last().unwrap().2, minute(9));

    let a_times: Vec<i64> = rec.0.iter().filter(|r| r.0 == "AUSDT").map(|r| r.2).collect();
    assert_eq!(a_times, all.iter().map(|m| minute(*m)).collect::<Vec<_>>());
    assert!(!hist.provider().symbols().contains(&"BUSDT".to_string()));
}

#[tokio::test]
async fn test_db_feeder_downloads_before_replay() {
    let (_dir, store, _) = temp_store(minute(100));
    let fake = FakeExchange::new();
    fake.set_bars("BTCUSDT", minute_bars(&(-5..10).collect::<Vec<_>>()));
    let exchange: ExchangeRef = fake.clone();

    let clock = Arc::new(SimClock::new(minute(0)));
    let factory: FeederFactory<DbKlineFeeder> = {
        let store = store.clone();
        let clock = clock.clone();
        Box::new(move |symbol: &str| {
            let exs = store.get_exsymbol("binance", "linear", symbol)?;
            let feeder = Feeder::new(exs, clock.clone(), 0.0);
            let inner = HistKLineFeeder::new(feeder, store.clone(), clock.clone());
            let downloader = Downloader::new(store.clone(), exchange.clone(), DownloadConfig::default(), CancellationToken::new());
            Ok(DbKlineFeeder::new(inner, downloader))
        })
    };
    let provider = Provider::new(store.clone(), factory);
    let mut hist = HistProvider::new(provider, clock, minute(0), minute(10));

    let mut rec = Record::default();
    let items = warm_items(&[("BTCUSDT", &["1m"])], 3).unwrap();
    hist.prepare(&items, &mut rec).await.unwrap();
    assert!(!fake.fetches().is_empty());
    assert!(fake.fetches().iter().all(|(_, since, _)| *since >= minute(-3)));
    assert!(hist.provider().holder("BTCUSDT").unwrap().is_downloaded());

    let stats = hist.run(&mut rec).unwrap();
    assert_eq!(stats.bars, 10);
    let warm: Vec<i64> = rec.0.iter().filter(|r| r.3).map(|r| r.2).collect();
    assert_eq!(warm, vec![minute(-3), minute(-2), minute(-1)]);
    let live: Vec<i64> = rec.0.iter().filter(|r| !r.3).map(|r| r.2).collect();
    assert_eq!(live, (0..10).map(minute).collect::<Vec<_>>());

    let sid = store.get_exsymbol("binance", "linear", "BTCUSDT").unwrap().id;
    let info = store.get_kinfo(sid, "1m").unwrap().unwrap();
    assert_eq!((info.start, info.stop), (minute(-3), minute(10)));
}
