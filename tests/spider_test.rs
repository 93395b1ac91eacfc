mod common;

use common::{minute, minute_bars, temp_store, wait_until, FakeExchange};
use futures_util::StreamExt;
use kline_hub::kldata::{ExchangeRef, StreamBatch, StreamKind};
use kline_hub::klcommon::config::SpiderConfig;
use kline_hub::klcommon::timeframe::MINUTE_MS;
use kline_hub::klcommon::{Clock, Kline, RetryWaits};
use kline_hub::klspider::protocol::{ohlcv_tag, uohlcv_tag, ACTION_SUBSCRIBE, ACTION_WATCH_PAIRS};
use kline_hub::klspider::{
    ClientHub, IOMsg, KLineHandler, KLineMsg, KLineWatcher, Miner, MsgCodec, Spider, StreamState, WatchReq, WriteQueue,
};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const SYMBOL: &str = "BTCUSDT";

#[derive(Default)]
struct Collect {
    klines: Mutex<Vec<KLineMsg>>,
}

impl KLineHandler for Collect {
    fn on_kline_msg(&self, msg: KLineMsg) {
        self.klines.lock().unwrap().push(msg);
    }
}

fn ohlcv_req() -> WatchReq {
    WatchReq {
        exchange: "binance".to_string(),
        market: "linear".to_string(),
        kind: StreamKind::Ohlcv,
        symbols: vec![SYMBOL.to_string()],
    }
}

fn klines_batch(bar: Kline, last_closed: bool) -> StreamBatch {
    StreamBatch::Klines { symbol: SYMBOL.to_string(), tf_ms: MINUTE_MS, bars: vec![bar], last_closed }
}

#[tokio::test]
async fn test_partial_bar_then_closed_bar() {
    let (_dir, store, clock) = temp_store(minute(2) + 30_000);
    let fake = FakeExchange::new();
    let cancel = CancellationToken::new();

    let hub = Arc::new(ClientHub::new());
    let (tx, mut rx) = mpsc::channel::<IOMsg>(64);
    let client = hub.register(tx);
    let ohlcv = ohlcv_tag("binance", "linear", SYMBOL);
    let uohlcv = uohlcv_tag("binance", "linear", SYMBOL);
    hub.subscribe(client, &[ohlcv.clone(), uohlcv.clone()]);

    let (writes, _handles) = WriteQueue::start(store.clone(), hub.clone(), 2, 64, cancel.clone());
    let waits = Arc::new(RetryWaits::new(clock.clone()));
    let miner = Miner::new(fake.clone(), "linear", store.clone(), hub.clone(), writes, waits, clock.clone(), cancel.clone())
        .unwrap();
    miner.sub_pairs(StreamKind::Ohlcv, &[SYMBOL.to_string()]).await.unwrap();
    let feed = fake.wait_sender(StreamKind::Ohlcv).await;
    let sid = store.get_exsymbol("binance", "linear", SYMBOL).unwrap().id;

    let partial = Kline::new(minute(2), 100.0, 102.0, 99.0, 101.0, 5.0);
    feed.send(klines_batch(partial, false)).await.unwrap();
    assert!(wait_until(|| store.get_unfinished(sid, "1m").unwrap().is_some()).await);
    assert_eq!(store.get_unfinished(sid, "1m").unwrap().unwrap().close, 101.0);
    assert!(store.query_ohlcv(sid, "1m", minute(0), minute(3), 0, false).unwrap().is_empty());

    clock.set(minute(3) + 1_000);
    let closed = Kline::new(minute(2), 100.0, 103.0, 99.0, 102.0, 8.0);
    feed.send(klines_batch(closed, true)).await.unwrap();
    let mut msgs = Vec::new();
    assert!(
        wait_until(|| {
            while let Ok(m) = rx.try_recv() {
                msgs.push(m);
            }
            msgs.iter().any(|m| m.action == ohlcv) && msgs.iter().filter(|m| m.action == uohlcv).count() >= 2
        })
        .await
    );

    let saved = store.query_ohlcv(sid, "1m", minute(0), minute(3), 0, false).unwrap();
    assert_eq!(saved, vec![closed]);
    assert!(store.get_unfinished(sid, "1m").unwrap().is_none());
    assert_eq!(msgs.iter().filter(|m| m.action == ohlcv).count(), 1);
    assert_eq!(msgs.iter().filter(|m| m.action == uohlcv).count(), 2);
    cancel.cancel();
}

async fn accept_frames(listener: &TcpListener, n: usize) -> Vec<IOMsg> {
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, MsgCodec::new());
    let mut got = Vec::new();
    while got.len() < n {
        match framed.next().await {
            Some(Ok(msg)) => got.push(msg),
            _ => break,
        }
    }
    got
}

#[tokio::test]
async fn test_watcher_replays_init_msgs_on_reconnect() {
    let (_dir, _store, clock) = temp_store(minute(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();

    let watcher = KLineWatcher::new(&addr, Arc::new(Collect::default()), clock, cancel.clone());
    watcher.subscribe(&[ohlcv_tag("binance", "linear", SYMBOL)]).await.unwrap();
    watcher.watch_pairs(&ohlcv_req()).await.unwrap();

    let server = tokio::spawn(async move {
        let first = accept_frames(&listener, 2).await;
        let second = accept_frames(&listener, 2).await;
        (first, second)
    });
    // 服务端读完后关闭连接，connect_once 正常返回，第二次调用即重连
    watcher.connect_once().await.unwrap();
    watcher.connect_once().await.unwrap();
    let (first, second) = server.await.unwrap();

    assert_eq!(first, watcher.init_msgs());
    assert_eq!(first, second);
    assert_eq!(first[0].action, ACTION_SUBSCRIBE);
    assert_eq!(first[1].action, ACTION_WATCH_PAIRS);
    assert_eq!(WatchReq::parse(&first[1].data).unwrap(), ohlcv_req());
    cancel.cancel();
}

#[tokio::test]
async fn test_watcher_reconnect_drops_removed_subscriptions() {
    let (_dir, _store, clock) = temp_store(minute(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();

    let watcher = KLineWatcher::new(&addr, Arc::new(Collect::default()), clock, cancel.clone());
    watcher.subscribe(&[ohlcv_tag("binance", "linear", SYMBOL)]).await.unwrap();
    watcher.watch_pairs(&ohlcv_req()).await.unwrap();

    let server = tokio::spawn(async move {
        let first = accept_frames(&listener, 2).await;
        let second = accept_frames(&listener, 1).await;
        (first, second)
    });
    watcher.connect_once().await.unwrap();
    // 断线期间的退订和新订阅只影响下一次重放的内容
    watcher.unwatch_pairs(&ohlcv_req()).await.unwrap();
    watcher.unsubscribe(&[ohlcv_tag("binance", "linear", SYMBOL)]).await.unwrap();
    watcher.subscribe(&[uohlcv_tag("binance", "linear", SYMBOL)]).await.unwrap();
    watcher.connect_once().await.unwrap();
    let (first, second) = server.await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert_eq!(second, watcher.init_msgs());
    assert_eq!(second[0].action, ACTION_SUBSCRIBE);
    assert_eq!(second[0].tags().unwrap(), vec![uohlcv_tag("binance", "linear", SYMBOL)]);
    cancel.cancel();
}

#[tokio::test]
async fn test_spider_end_to_end() {
    let (_dir, store, clock) = temp_store(minute(2) + 30_000);
    let fake = FakeExchange::new();
    let cancel = CancellationToken::new();
    let exchanges = vec![fake.clone() as ExchangeRef];
    let spider = Spider::new(&SpiderConfig::default(), store.clone(), exchanges, clock.clone(), cancel.clone())
        .await
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(spider.clone().run(listener));

    let handler = Arc::new(Collect::default());
    let watcher = KLineWatcher::new(&addr, handler.clone(), clock.clone(), cancel.clone());
    watcher
        .subscribe(&[ohlcv_tag("binance", "linear", SYMBOL), uohlcv_tag("binance", "linear", SYMBOL)])
        .await
        .unwrap();
    watcher.watch_pairs(&ohlcv_req()).await.unwrap();
    // 重复的 watch_pairs 不会再次订阅交易所
    watcher.watch_pairs(&ohlcv_req()).await.unwrap();
    let client = tokio::spawn(watcher.clone().run());

    let feed = fake.wait_sender(StreamKind::Ohlcv).await;
    clock.set(minute(3) + 1_000);
    let closed = Kline::new(minute(2), 100.0, 103.0, 99.0, 102.0, 8.0);
    feed.send(klines_batch(closed, true)).await.unwrap();

    assert!(wait_until(|| handler.klines.lock().unwrap().iter().any(|m| !m.is_update)).await);
    let msgs = handler.klines.lock().unwrap().clone();
    let done: Vec<&KLineMsg> = msgs.iter().filter(|m| !m.is_update).collect();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].symbol, SYMBOL);
    assert_eq!(done[0].tf_secs, 60);
    assert_eq!(done[0].bars, vec![closed]);
    assert_eq!(fake.watches().len(), 1);
    assert_eq!(spider.hub().client_count(), 1);

    cancel.cancel();
    server.await.unwrap().unwrap();
    client.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_closed_stream_resubscribed_after_retry_wait() {
    let (_dir, store, clock) = temp_store(minute(2) + 30_000);
    let fake = FakeExchange::new();
    let cancel = CancellationToken::new();
    let exchanges = vec![fake.clone() as ExchangeRef];
    let spider = Spider::new(&SpiderConfig::default(), store, exchanges, clock.clone(), cancel.clone())
        .await
        .unwrap();
    spider.watch_pairs(&ohlcv_req()).await.unwrap();
    let miner = spider.get_miner("binance", "linear").unwrap();
    let feed = fake.wait_sender(StreamKind::Ohlcv).await;

    feed.send(StreamBatch::Closed { reason: "socket reset".to_string() }).await.unwrap();
    assert!(wait_until(|| miner.state(StreamKind::Ohlcv) == StreamState::None).await);

    // 第一次失败等待 3 秒
    assert_eq!(spider.monitor_once().await, 0);
    assert_eq!(fake.watches().len(), 1);
    clock.set(minute(2) + 33_000);
    assert_eq!(spider.monitor_once().await, 1);
    assert_eq!(fake.watches().len(), 2);
    assert_eq!(fake.watches()[1], (StreamKind::Ohlcv, vec![SYMBOL.to_string()]));
    assert_eq!(miner.state(StreamKind::Ohlcv), StreamState::Subscribing);
    assert_eq!(spider.monitor_once().await, 0);
    cancel.cancel();
}

#[tokio::test]
async fn test_stalled_symbol_recovered_over_rest() {
    let (_dir, store, clock) = temp_store(minute(2) + 30_000);
    let fake = FakeExchange::new();
    fake.set_bars(SYMBOL, minute_bars(&[2, 3, 4]));
    let cancel = CancellationToken::new();
    let hub = Arc::new(ClientHub::new());
    let (writes, _handles) = WriteQueue::start(store.clone(), hub.clone(), 2, 64, cancel.clone());
    let waits = Arc::new(RetryWaits::new(clock.clone()));
    let miner = Miner::new(fake.clone(), "linear", store.clone(), hub, writes, waits, clock.clone(), cancel.clone())
        .unwrap();
    miner.sub_pairs(StreamKind::Ohlcv, &[SYMBOL.to_string()]).await.unwrap();
    let sid = store.get_exsymbol("binance", "linear", SYMBOL).unwrap().id;

    // 分钟边界后的余量内不检查
    clock.set(minute(5) + 1_000);
    assert_eq!(miner.check_stalls(clock.now_ms()).await.unwrap(), 0);

    clock.set(minute(5) + 10_000);
    assert_eq!(miner.check_stalls(clock.now_ms()).await.unwrap(), 1);
    assert!(fake.fetches().contains(&(SYMBOL.to_string(), minute(2), 0)));
    assert!(wait_until(|| store.query_ohlcv(sid, "1m", minute(0), minute(6), 0, false).unwrap().len() == 3).await);
    let saved = store.query_ohlcv(sid, "1m", minute(0), minute(6), 0, false).unwrap();
    assert_eq!(saved, minute_bars(&[2, 3, 4]));
    assert!(wait_until(|| store.get_unfinished(sid, "1m").unwrap().is_some()).await);
    assert_eq!(store.get_unfinished(sid, "1m").unwrap().unwrap().time, minute(5));

    // 已补齐的品种不会再次请求
    assert_eq!(miner.check_stalls(clock.now_ms()).await.unwrap(), 0);
    cancel.cancel();
}
