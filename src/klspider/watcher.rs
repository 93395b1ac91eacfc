//! K线监听客户端：连接爬虫，重连时按顺序重放初始化消息，把广播分发给处理器

use super::protocol::{
    tag_symbol, IOMsg, MsgCodec, WatchReq, ACTION_SUBSCRIBE, ACTION_UNSUBSCRIBE, ACTION_UNWATCH_PAIRS,
    ACTION_WATCH_PAIRS,
};
use crate::kldata::StreamKind;
use crate::klcommon::{AppError, ClockRef, Kline, NotifyKLines, OrderBook, PriceMap, Result, RetryWaits, Trade};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RETRY_KEY: &str = "kline_watcher";

/// 一条K线推送
#[derive(Debug, Clone, PartialEq)]
pub struct KLineMsg {
    pub exchange: String,
    pub market: String,
    pub symbol: String,
    pub tf_secs: i32,
    pub interval: i32,
    pub bars: Vec<Kline>,
    /// uohlcv：含未完成的最后一根
    pub is_update: bool,
}

/// 推送处理器
pub trait KLineHandler: Send + Sync {
    fn on_kline_msg(&self, msg: KLineMsg);

    fn on_prices(&self, _exchange: &str, _market: &str, _prices: PriceMap) {}

    fn on_trades(&self, _exchange: &str, _market: &str, _symbol: &str, _trades: Vec<Trade>) {}

    fn on_depth(&self, _exchange: &str, _market: &str, _book: OrderBook) {}
}

/// 把一条广播解析后分发给处理器；未识别的 action 返回 false
pub fn dispatch(handler: &dyn KLineHandler, msg: IOMsg) -> Result<bool> {
    let mut parts = msg.action.splitn(4, '_');
    let prefix = parts.next().unwrap_or_default();
    let exchange = parts.next().unwrap_or_default().to_string();
    let market = parts.next().unwrap_or_default().to_string();
    match prefix {
        "ohlcv" | "uohlcv" => {
            let symbol = tag_symbol(&msg.action)
                .ok_or_else(|| AppError::DataError(format!("K线消息缺少品种: {}", msg.action)))?
                .to_string();
            let body: NotifyKLines = serde_json::from_value(msg.data)?;
            handler.on_kline_msg(KLineMsg {
                exchange,
                market,
                symbol,
                tf_secs: body.tf_secs,
                interval: body.interval,
                bars: body.bars,
                is_update: prefix == "uohlcv",
            });
        }
        "price" => handler.on_prices(&exchange, &market, serde_json::from_value(msg.data)?),
        "trade" => {
            let symbol = tag_symbol(&msg.action).unwrap_or_default().to_string();
            handler.on_trades(&exchange, &market, &symbol, serde_json::from_value(msg.data)?);
        }
        "book" => handler.on_depth(&exchange, &market, serde_json::from_value(msg.data)?),
        _ => return Ok(false),
    }
    Ok(true)
}

/// 当前有效的订阅，重连时据此重建初始化消息
#[derive(Debug, Default)]
struct SubState {
    tags: BTreeSet<String>,
    pairs: BTreeMap<(String, String, StreamKind), BTreeSet<String>>,
}

impl SubState {
    fn watch_key(req: &WatchReq) -> (String, String, StreamKind) {
        (req.exchange.clone(), req.market.clone(), req.kind)
    }

    fn apply(&mut self, msg: &IOMsg) -> Result<()> {
        match msg.action.as_str() {
            ACTION_SUBSCRIBE => self.tags.extend(msg.tags()?),
            ACTION_UNSUBSCRIBE => {
                for tag in msg.tags()? {
                    self.tags.remove(&tag);
                }
            }
            ACTION_WATCH_PAIRS => {
                let req = WatchReq::parse(&msg.data)?;
                self.pairs.entry(Self::watch_key(&req)).or_default().extend(req.symbols);
            }
            ACTION_UNWATCH_PAIRS => {
                let req = WatchReq::parse(&msg.data)?;
                let key = Self::watch_key(&req);
                if let Some(symbols) = self.pairs.get_mut(&key) {
                    for sym in &req.symbols {
                        symbols.remove(sym);
                    }
                    if symbols.is_empty() {
                        self.pairs.remove(&key);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// 先订阅标签，再逐个 (交易所, 市场, 类型) 监听品种
    fn replay_msgs(&self) -> Vec<IOMsg> {
        let mut msgs = Vec::with_capacity(self.pairs.len() + 1);
        if !self.tags.is_empty() {
            let tags: Vec<String> = self.tags.iter().cloned().collect();
            msgs.push(IOMsg { action: ACTION_SUBSCRIBE.to_string(), data: Value::from(tags) });
        }
        for ((exchange, market, kind), symbols) in &self.pairs {
            let req = WatchReq {
                exchange: exchange.clone(),
                market: market.clone(),
                kind: *kind,
                symbols: symbols.iter().cloned().collect(),
            };
            msgs.push(IOMsg { action: ACTION_WATCH_PAIRS.to_string(), data: req.to_data() });
        }
        msgs
    }
}

pub struct KLineWatcher {
    addr: String,
    handler: Arc<dyn KLineHandler>,
    waits: RetryWaits,
    subs: Mutex<SubState>,
    tx: Mutex<Option<mpsc::Sender<IOMsg>>>,
    cancel: CancellationToken,
}

impl KLineWatcher {
    pub fn new(addr: &str, handler: Arc<dyn KLineHandler>, clock: ClockRef, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            handler,
            waits: RetryWaits::new(clock),
            subs: Mutex::new(SubState::default()),
            tx: Mutex::new(None),
            cancel,
        })
    }

    /// 重连后要按顺序发送的消息
    pub fn init_msgs(&self) -> Vec<IOMsg> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner()).replay_msgs()
    }

    /// 更新订阅状态并在已连接时立即发送
    async fn record_and_send(&self, msg: IOMsg) -> Result<()> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner()).apply(&msg)?;
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(tx) = tx {
            if tx.send(msg).await.is_err() {
                debug!(target: "klwatcher", "连接已断开，消息将在重连后重放");
            }
        }
        Ok(())
    }

    pub async fn subscribe(&self, tags: &[String]) -> Result<()> {
        self.record_and_send(IOMsg::new(ACTION_SUBSCRIBE, &tags)?).await
    }

    pub async fn unsubscribe(&self, tags: &[String]) -> Result<()> {
        self.record_and_send(IOMsg::new(ACTION_UNSUBSCRIBE, &tags)?).await
    }

    pub async fn watch_pairs(&self, req: &WatchReq) -> Result<()> {
        self.record_and_send(IOMsg { action: ACTION_WATCH_PAIRS.to_string(), data: req.to_data() }).await
    }

    pub async fn unwatch_pairs(&self, req: &WatchReq) -> Result<()> {
        self.record_and_send(IOMsg { action: ACTION_UNWATCH_PAIRS.to_string(), data: req.to_data() }).await
    }

    /// 持续运行：断线后按 RetryWaits 等待再重连，直到取消
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self.connect_once().await {
                Ok(()) => debug!(target: "klwatcher", addr = %self.addr, "连接已结束"),
                Err(e) => {
                    warn!(target: "klwatcher", addr = %self.addr, error.summary = e.get_error_type_summary(), error.details = %e, "连接爬虫失败");
                }
            }
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.waits.set_fail(RETRY_KEY);
            let wait = self.waits.wait_duration(RETRY_KEY);
            info!(target: "klwatcher", wait_ms = wait.as_millis() as u64, "稍后重连爬虫");
            if !crate::klcommon::btime::sleep(wait, &self.cancel).await {
                return Ok(());
            }
        }
    }

    /// 建立一次连接，重放初始化消息后读到断开为止
    pub async fn connect_once(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        let framed = Framed::new(stream, MsgCodec::new());
        let (mut sink, mut source) = framed.split();

        for msg in self.init_msgs() {
            sink.send(msg).await?;
        }
        self.waits.reset(RETRY_KEY);
        info!(target: "klwatcher", addr = %self.addr, "已连接爬虫并重放订阅");

        let (tx, mut rx) = mpsc::channel::<IOMsg>(256);
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let result = loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(msg)) => {
                        let action = msg.action.clone();
                        match dispatch(self.handler.as_ref(), msg) {
                            Ok(true) => {}
                            Ok(false) => debug!(target: "klwatcher", action = %action, "忽略未知消息"),
                            Err(e) => warn!(target: "klwatcher", action = %action, error.details = %e, "解析推送失败"),
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                outgoing = rx.recv() => {
                    if let Some(msg) = outgoing {
                        if let Err(e) = sink.send(msg).await {
                            break Err(e);
                        }
                    }
                }
                _ = self.cancel.cancelled() => break Ok(()),
            }
        };
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = None;
        result
    }
}
