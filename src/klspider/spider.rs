//! 爬虫服务：TCP 服务端、矿工表、写入队列和订阅监控

use super::hub::ClientHub;
use super::miner::Miner;
use super::protocol::{
    IOMsg, MsgCodec, WatchReq, ACTION_SUBSCRIBE, ACTION_UNSUBSCRIBE, ACTION_UNWATCH_PAIRS, ACTION_WATCH_PAIRS,
};
use super::writer::WriteQueue;
use crate::kldata::ExchangeRef;
use crate::klcommon::config::SpiderConfig;
use crate::klcommon::{AppError, ClockRef, Result, RetryWaits};
use crate::klstore::KlineStore;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// 单个客户端的发送队列容量
const CLIENT_QUEUE_SIZE: usize = 4096;
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

pub struct Spider {
    store: KlineStore,
    hub: Arc<ClientHub>,
    writes: WriteQueue,
    waits: Arc<RetryWaits>,
    clock: ClockRef,
    cancel: CancellationToken,
    exchanges: HashMap<String, ExchangeRef>,
    miners: Mutex<HashMap<(String, String), Arc<Miner>>>,
    writer_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Spider {
    /// 清理过期的未完成K线并启动写入协程
    pub async fn new(
        config: &SpiderConfig,
        store: KlineStore,
        exchanges: Vec<ExchangeRef>,
        clock: ClockRef,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let purged = store.run_blocking(|s| s.purge_stale_unfinished()).await?;
        info!(target: "klspider", log_type = "module", purged, "已清理过期的未完成K线");

        let hub = Arc::new(ClientHub::new());
        let (writes, handles) = WriteQueue::start(
            store.clone(),
            hub.clone(),
            config.write_workers,
            config.write_queue_size,
            cancel.clone(),
        );
        let waits = Arc::new(RetryWaits::new(clock.clone()));
        let exchanges = exchanges.into_iter().map(|e| (e.name().to_string(), e)).collect();
        Ok(Arc::new(Self {
            store,
            hub,
            writes,
            waits,
            clock,
            cancel,
            exchanges,
            miners: Mutex::new(HashMap::new()),
            writer_handles: Mutex::new(handles),
        }))
    }

    pub fn hub(&self) -> &Arc<ClientHub> {
        &self.hub
    }

    pub fn write_queue(&self) -> &WriteQueue {
        &self.writes
    }

    /// 取得 (交易所, 市场) 的矿工，不存在时创建
    pub fn get_miner(&self, exchange: &str, market: &str) -> Result<Arc<Miner>> {
        let mut miners = self.miners.lock().unwrap_or_else(|e| e.into_inner());
        let key = (exchange.to_string(), market.to_string());
        if let Some(m) = miners.get(&key) {
            return Ok(m.clone());
        }
        let exg = self
            .exchanges
            .get(exchange)
            .cloned()
            .ok_or_else(|| AppError::ConfigError(format!("未注册的交易所: {}", exchange)))?;
        let miner = Miner::new(
            exg,
            market,
            self.store.clone(),
            self.hub.clone(),
            self.writes.clone(),
            self.waits.clone(),
            self.clock.clone(),
            self.cancel.clone(),
        )?;
        miners.insert(key, miner.clone());
        Ok(miner)
    }

    fn all_miners(&self) -> Vec<Arc<Miner>> {
        self.miners.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    pub async fn watch_pairs(&self, req: &WatchReq) -> Result<()> {
        let miner = self.get_miner(&req.exchange, &req.market)?;
        miner.sub_pairs(req.kind, &req.symbols).await
    }

    pub async fn unwatch_pairs(&self, req: &WatchReq) -> Result<()> {
        let miner = self.get_miner(&req.exchange, &req.market)?;
        miner.un_sub_pairs(req.kind, &req.symbols).await
    }

    /// 监听地址并运行到取消
    pub async fn serve(self: Arc<Self>, addr: String) -> Result<()> {
        let addr: SocketAddr = addr.parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.run(listener).await
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(target: "klspider", log_type = "module", addr = %listener.local_addr()?, "🚀 爬虫服务已启动");
        tokio::spawn(self.clone().run_monitor());
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = self.cancel.cancelled() => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let spider = self.clone();
                    tokio::spawn(async move {
                        spider.handle_client(stream, peer).await;
                    });
                }
                Err(e) => {
                    warn!(target: "klspider", log_type = "module", error.details = %e, "接受连接失败");
                }
            }
        }
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.writer_handles.lock().unwrap_or_else(|e| e.into_inner()));
        for h in handles {
            let _ = h.await;
        }
        info!(target: "klspider", log_type = "module", "爬虫服务已停止");
        Ok(())
    }

    /// 每秒检查一次断开的数据流，到达重试时间后重新订阅
    async fn run_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => return,
            }
            self.monitor_once().await;
        }
    }

    pub async fn monitor_once(&self) -> usize {
        let now = self.clock.now_ms();
        let mut restarted = 0;
        for miner in self.all_miners() {
            for kind in miner.due_retries(now) {
                info!(target: "klspider", key = %miner.stream_key(kind), "重新订阅数据流");
                restarted += 1;
                if let Err(e) = miner.start_stream(kind).await {
                    warn!(target: "klspider", key = %miner.stream_key(kind), error.summary = e.get_error_type_summary(), error.details = %e, "重新订阅失败");
                }
            }
        }
        restarted
    }

    #[instrument(skip(self, stream), fields(peer = %peer))]
    async fn handle_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let framed = Framed::new(stream, MsgCodec::new());
        let (mut sink, mut source) = framed.split();
        let (tx, mut rx) = mpsc::channel::<IOMsg>(CLIENT_QUEUE_SIZE);
        let id = self.hub.register(tx);
        info!(target: "klspider", client = id, "客户端已连接");

        let cancel = self.cancel.clone();
        let sender = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => msg,
                    _ = cancel.cancelled() => None,
                };
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    debug!(target: "klspider", client = id, error.details = %e, "发送失败，连接关闭");
                    break;
                }
            }
        });

        loop {
            let next = tokio::select! {
                next = source.next() => next,
                _ = self.cancel.cancelled() => None,
            };
            match next {
                Some(Ok(msg)) => {
                    if let Err(e) = self.on_client_msg(id, msg).await {
                        error!(target: "klspider", client = id, error.summary = e.get_error_type_summary(), error.details = %e, "处理客户端消息失败");
                    }
                }
                Some(Err(e)) => {
                    warn!(target: "klspider", client = id, error.details = %e, "读取客户端消息失败");
                    break;
                }
                None => break,
            }
        }
        self.hub.remove(id);
        sender.abort();
        info!(target: "klspider", client = id, "客户端已断开");
    }

    async fn on_client_msg(&self, id: u64, msg: IOMsg) -> Result<()> {
        match msg.action.as_str() {
            ACTION_SUBSCRIBE => {
                let added = self.hub.subscribe(id, &msg.tags()?);
                debug!(target: "klspider", client = id, added, "订阅标签");
            }
            ACTION_UNSUBSCRIBE => {
                self.hub.unsubscribe(id, &msg.tags()?);
            }
            ACTION_WATCH_PAIRS => self.watch_pairs(&WatchReq::parse(&msg.data)?).await?,
            ACTION_UNWATCH_PAIRS => self.unwatch_pairs(&WatchReq::parse(&msg.data)?).await?,
            other => {
                warn!(target: "klspider", client = id, action = other, "未知的客户端消息");
            }
        }
        Ok(())
    }
}
