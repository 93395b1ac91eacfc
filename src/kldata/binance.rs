//! 币安 REST/WebSocket 接入
//!
//! * REST：现货 `/api/v3/klines`，U本位合约 `/fapi/v1/klines`
//! * WebSocket：组合流 `/stream`，每个 (market, kind) 一条连接，追加品种时发送 SUBSCRIBE

use super::exchange::{Exchange, StreamBatch, StreamKind};
use crate::klcommon::config::ProxyConfig;
use crate::klcommon::timeframe::tf_to_ms;
use crate::klcommon::{AppError, Kline, MarkPrice, OrderBook, Result, Trade};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

const SPOT_REST: &str = "https://api.binance.com/api/v3/klines";
const LINEAR_REST: &str = "https://fapi.binance.com/fapi/v1/klines";
const SPOT_WS: &str = "wss://stream.binance.com:9443/stream";
const LINEAR_WS: &str = "wss://fstream.binance.com/stream";

/// 服务端 10 分钟无数据会断开，定时发送 ping
const PING_INTERVAL: Duration = Duration::from_secs(180);

struct StreamConn {
    cmd_tx: mpsc::Sender<Message>,
    symbols: HashSet<String>,
}

pub struct BinanceExchange {
    client: Client,
    conns: Mutex<HashMap<(String, StreamKind), StreamConn>>,
    req_id: AtomicU64,
}

impl std::fmt::Debug for BinanceExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceExchange").finish()
    }
}

impl BinanceExchange {
    /// 创建客户端；启用代理时 REST 请求走代理，WebSocket 直连
    pub fn new(proxy: &ProxyConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10));
        if proxy.enabled {
            match reqwest::Proxy::all(&proxy.url) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => {
                    warn!(target: "api", log_type = "module", "设置代理失败，将尝试直接连接: {} - {}", proxy.url, e);
                }
            }
        }
        let client = builder
            .build()
            .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)))?;
        info!(target: "api", log_type = "module", proxy = proxy.enabled, "🌐 初始化币安交易所接入");
        Ok(Self { client, conns: Mutex::new(HashMap::new()), req_id: AtomicU64::new(1) })
    }

    fn rest_url(market: &str) -> Result<&'static str> {
        match market {
            "spot" => Ok(SPOT_REST),
            "linear" => Ok(LINEAR_REST),
            other => Err(AppError::ConfigError(format!("币安不支持的市场: {}", other))),
        }
    }

    fn ws_url(market: &str) -> Result<&'static str> {
        match market {
            "spot" => Ok(SPOT_WS),
            "linear" => Ok(LINEAR_WS),
            other => Err(AppError::ConfigError(format!("币安不支持的市场: {}", other))),
        }
    }

    fn next_id(&self) -> u64 {
        self.req_id.fetch_add(1, Ordering::Relaxed)
    }

    fn stream_names(&self, market: &str, kind: StreamKind, symbols: &[String]) -> Vec<String> {
        let ohlcv_tf = self.ohlcv_tf(market);
        symbols.iter().map(|s| stream_name(market, kind, s, ohlcv_tf)).collect()
    }
}

/// 单个品种的流名称
pub fn stream_name(market: &str, kind: StreamKind, symbol: &str, ohlcv_tf: &str) -> String {
    let sym = symbol.to_lowercase();
    match kind {
        StreamKind::Ohlcv => format!("{}@kline_{}", sym, ohlcv_tf),
        StreamKind::Trade => format!("{}@aggTrade", sym),
        StreamKind::Depth => format!("{}@depth20@100ms", sym),
        StreamKind::Price if market == "spot" => format!("{}@miniTicker", sym),
        StreamKind::Price => format!("{}@markPrice@1s", sym),
    }
}

fn parse_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// 解析 REST K线数组 `[openTime, "o", "h", "l", "c", "v", ...]`
pub fn parse_rest_kline(raw: &[Value]) -> Option<Kline> {
    if raw.len() < 6 {
        return None;
    }
    Some(Kline::new(
        raw[0].as_i64()?,
        parse_f64(&raw[1])?,
        parse_f64(&raw[2])?,
        parse_f64(&raw[3])?,
        parse_f64(&raw[4])?,
        parse_f64(&raw[5])?,
    ))
}

fn parse_levels(v: Option<&Value>) -> Vec<[f64; 2]> {
    v.and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let row = row.as_array()?;
                    Some([parse_f64(row.first()?)?, parse_f64(row.get(1)?)?])
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    stream: String,
    data: Value,
}

/// 解析组合流消息；订阅应答等非数据消息返回 None
pub fn parse_stream_message(text: &str) -> Result<Option<StreamBatch>> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("stream").is_none() {
        return Ok(None);
    }
    let env: StreamEnvelope = serde_json::from_value(value)?;
    let data = &env.data;
    let stream_symbol = env.stream.split('@').next().unwrap_or_default().to_uppercase();
    let bad = || AppError::DataError(format!("无法解析推送: {}", env.stream));

    if env.stream.contains("@kline_") {
        let k = data.get("k").ok_or_else(bad)?;
        let tf = k.get("i").and_then(|v| v.as_str()).ok_or_else(bad)?;
        let bar = Kline::new(
            k.get("t").and_then(|v| v.as_i64()).ok_or_else(bad)?,
            k.get("o").and_then(parse_f64).ok_or_else(bad)?,
            k.get("h").and_then(parse_f64).ok_or_else(bad)?,
            k.get("l").and_then(parse_f64).ok_or_else(bad)?,
            k.get("c").and_then(parse_f64).ok_or_else(bad)?,
            k.get("v").and_then(parse_f64).ok_or_else(bad)?,
        );
        let last_closed = k.get("x").and_then(|v| v.as_bool()).unwrap_or(false);
        let symbol = data.get("s").and_then(|v| v.as_str()).map(str::to_string).unwrap_or(stream_symbol);
        return Ok(Some(StreamBatch::Klines { symbol, tf_ms: tf_to_ms(tf)?, bars: vec![bar], last_closed }));
    }
    if env.stream.ends_with("@aggTrade") {
        let trade = Trade {
            symbol: data.get("s").and_then(|v| v.as_str()).map(str::to_string).unwrap_or(stream_symbol),
            id: data.get("a").and_then(|v| v.as_i64()).unwrap_or_default(),
            price: data.get("p").and_then(parse_f64).ok_or_else(bad)?,
            amount: data.get("q").and_then(parse_f64).ok_or_else(bad)?,
            time: data.get("T").and_then(|v| v.as_i64()).ok_or_else(bad)?,
            is_buyer_maker: data.get("m").and_then(|v| v.as_bool()).unwrap_or_default(),
        };
        return Ok(Some(StreamBatch::Trades(vec![trade])));
    }
    if env.stream.contains("@depth") {
        // 现货的部分深度推送不带品种和时间，合约推送为 b/a 字段
        let book = OrderBook {
            symbol: data.get("s").and_then(|v| v.as_str()).map(str::to_string).unwrap_or(stream_symbol),
            time: data.get("E").and_then(|v| v.as_i64()).unwrap_or_default(),
            bids: parse_levels(data.get("bids").or_else(|| data.get("b"))),
            asks: parse_levels(data.get("asks").or_else(|| data.get("a"))),
        };
        return Ok(Some(StreamBatch::Depth(vec![book])));
    }
    if env.stream.contains("@markPrice") || env.stream.ends_with("@miniTicker") {
        let price = data.get("p").or_else(|| data.get("c")).and_then(parse_f64).ok_or_else(bad)?;
        return Ok(Some(StreamBatch::Prices(vec![MarkPrice {
            symbol: data.get("s").and_then(|v| v.as_str()).map(str::to_string).unwrap_or(stream_symbol),
            price,
            time: data.get("E").and_then(|v| v.as_i64()).unwrap_or_default(),
        }])));
    }
    debug!(target: "api", stream = %env.stream, "忽略未知数据流");
    Ok(None)
}

fn subscribe_msg(method: &str, streams: &[String], id: u64) -> Message {
    let msg = serde_json::json!({ "method": method, "params": streams, "id": id });
    Message::Text(msg.to_string())
}

/// 单条连接的读写循环；结束时发送 Closed
async fn run_connection(
    url: String,
    mut cmd_rx: mpsc::Receiver<Message>,
    tx: mpsc::Sender<StreamBatch>,
) {
    let reason = match connect_async(&url).await {
        Ok((ws, _)) => {
            info!(target: "api", log_type = "module", url = %url, "币安WebSocket已连接");
            let (mut write, mut read) = ws.split();
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.tick().await;
            loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => match parse_stream_message(&text) {
                            Ok(Some(batch)) => {
                                if tx.send(batch).await.is_err() {
                                    break "接收方已关闭".to_string();
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(target: "api", log_type = "module", error.summary = e.get_error_type_summary(), error.details = %e, "解析推送失败");
                            }
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                break format!("发送pong失败: {}", e);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break format!("服务端关闭连接: {:?}", frame);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break format!("读取失败: {}", e),
                        None => break "连接已断开".to_string(),
                    },
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Message::Close(frame)) => {
                            let _ = write.send(Message::Close(frame)).await;
                            break "已退订全部品种".to_string();
                        }
                        Some(msg) => {
                            if let Err(e) = write.send(msg).await {
                                break format!("发送订阅命令失败: {}", e);
                            }
                        }
                        None => break "连接句柄已释放".to_string(),
                    },
                    _ = ping.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            break format!("发送ping失败: {}", e);
                        }
                    }
                }
            }
        }
        Err(e) => {
            let err = AppError::WebSocketError(e.to_string());
            error!(
                target: "api",
                log_type = "module",
                url = %url,
                error.summary = err.get_error_type_summary(),
                error.details = %err,
                "币安WebSocket连接失败"
            );
            format!("连接失败: {}", e)
        }
    };
    warn!(target: "api", url = %url, reason = %reason, "币安数据流已结束");
    let _ = tx.send(StreamBatch::Closed { reason }).await;
}

#[async_trait]
impl Exchange for BinanceExchange {
    fn name(&self) -> &str {
        "binance"
    }

    #[instrument(skip(self), err)]
    async fn fetch_ohlcv(
        &self,
        market: &str,
        symbol: &str,
        tf: &str,
        since_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let mut url = format!("{}?symbol={}&interval={}&limit={}", Self::rest_url(market)?, symbol, tf, limit.max(1));
        if since_ms > 0 {
            url.push_str(&format!("&startTime={}", since_ms));
        }
        if end_ms > 0 {
            url.push_str(&format!("&endTime={}", end_ms - 1));
        }

        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let http_error = AppError::from(e);
                error!(
                    target: "api",
                    log_type = "module",
                    symbol,
                    tf,
                    url = %url,
                    error.summary = http_error.get_error_type_summary(),
                    error.details = %http_error,
                    "K线请求失败"
                );
                return Err(http_error);
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            let api_error = AppError::ApiError(format!("下载 {} 的K线失败: {} - {}", symbol, status, text));
            error!(
                target: "api",
                log_type = "module",
                symbol,
                tf,
                status = %status,
                error.summary = api_error.get_error_type_summary(),
                error.details = %api_error,
                "API响应状态错误"
            );
            return Err(api_error);
        }

        let text = response.text().await?;
        let raw: Vec<Vec<Value>> = serde_json::from_str(&text).map_err(|e| {
            error!(target: "api", log_type = "module", symbol, tf, "解析K线JSON失败: {}, 响应前200个字符: {}", e, text.chars().take(200).collect::<String>());
            AppError::JsonError(e)
        })?;
        let bars: Vec<Kline> = raw.iter().filter_map(|r| parse_rest_kline(r)).collect();
        if bars.len() != raw.len() {
            warn!(target: "api", symbol, tf, parsed = bars.len(), raw = raw.len(), "部分K线解析失败");
        }
        debug!(target: "api", decision = "kline_fetch_success", symbol, tf, count = bars.len(), "K线下载完成");
        Ok(bars)
    }

    async fn watch(
        &self,
        market: &str,
        kind: StreamKind,
        symbols: &[String],
        tx: mpsc::Sender<StreamBatch>,
    ) -> Result<()> {
        let ws_base = Self::ws_url(market)?;
        let mut conns = self.conns.lock().await;
        let key = (market.to_string(), kind);

        if let Some(conn) = conns.get_mut(&key) {
            if !conn.cmd_tx.is_closed() {
                let added: Vec<String> = symbols.iter().filter(|s| !conn.symbols.contains(*s)).cloned().collect();
                if added.is_empty() {
                    return Ok(());
                }
                let streams = self.stream_names(market, kind, &added);
                conn.cmd_tx
                    .send(subscribe_msg("SUBSCRIBE", &streams, self.next_id()))
                    .await
                    .map_err(|e| AppError::ChannelError(format!("发送订阅失败: {}", e)))?;
                conn.symbols.extend(added);
                return Ok(());
            }
        }

        let mut all: HashSet<String> = conns.remove(&key).map(|c| c.symbols).unwrap_or_default();
        all.extend(symbols.iter().cloned());
        let mut sorted: Vec<String> = all.iter().cloned().collect();
        sorted.sort();
        let streams = self.stream_names(market, kind, &sorted);
        let url = format!("{}?streams={}", ws_base, streams.join("/"));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(run_connection(url, cmd_rx, tx));
        info!(target: "api", log_type = "module", market, kind = %kind, count = all.len(), "建立币安数据流");
        conns.insert(key, StreamConn { cmd_tx, symbols: all });
        Ok(())
    }

    async fn unwatch(&self, market: &str, kind: StreamKind, symbols: &[String]) -> Result<()> {
        let mut conns = self.conns.lock().await;
        let key = (market.to_string(), kind);
        let Some(conn) = conns.get_mut(&key) else {
            return Ok(());
        };
        let removed: Vec<String> = symbols.iter().filter(|s| conn.symbols.remove(*s)).cloned().collect();
        if removed.is_empty() {
            return Ok(());
        }
        let msg = if conn.symbols.is_empty() {
            Message::Close(None)
        } else {
            subscribe_msg("UNSUBSCRIBE", &self.stream_names(market, kind, &removed), self.next_id())
        };
        if conn.cmd_tx.send(msg).await.is_err() {
            debug!(target: "api", market, kind = %kind, "连接已结束，无需退订");
        }
        if conn.symbols.is_empty() {
            conns.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rest_kline() {
        let raw: Vec<Value> = serde_json::from_str(
            r#"[1700000000000,"10.5","11.0","10.0","10.8","123.4",1700000059999,"0",10,"0","0","0"]"#,
        )
        .unwrap();
        let bar = parse_rest_kline(&raw).unwrap();
        assert_eq!(bar.time, 1_700_000_000_000);
        assert_eq!(bar.close, 10.8);
        assert_eq!(bar.volume, 123.4);
        assert!(parse_rest_kline(&raw[..3]).is_none());
    }

    #[test]
    fn test_parse_kline_stream() {
        let text = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1,"s":"BTCUSDT",
            "k":{"t":60000,"T":119999,"i":"1m","o":"1","h":"3","l":"0.5","c":"2","v":"9","x":false}}}"#;
        match parse_stream_message(text).unwrap() {
            Some(StreamBatch::Klines { symbol, tf_ms, bars, last_closed }) => {
                assert_eq!(symbol, "BTCUSDT");
                assert!(!last_closed);
                assert_eq!(tf_ms, 60_000);
                assert_eq!(bars[0].time, 60_000);
                assert_eq!(bars[0].high, 3.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_spot_depth_uses_stream_symbol() {
        let text = r#"{"stream":"ethusdt@depth20@100ms","data":{"lastUpdateId":5,
            "bids":[["100.0","1.5"]],"asks":[["101.0","2"]]}}"#;
        match parse_stream_message(text).unwrap() {
            Some(StreamBatch::Depth(books)) => {
                assert_eq!(books[0].symbol, "ETHUSDT");
                assert_eq!(books[0].bids, vec![[100.0, 1.5]]);
                assert_eq!(books[0].asks, vec![[101.0, 2.0]]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_reply_ignored() {
        assert!(parse_stream_message(r#"{"result":null,"id":1}"#).unwrap().is_none());
    }

    #[test]
    fn test_stream_names() {
        assert_eq!(stream_name("spot", StreamKind::Ohlcv, "BTCUSDT", "1s"), "btcusdt@kline_1s");
        assert_eq!(stream_name("linear", StreamKind::Price, "BTCUSDT", "1m"), "btcusdt@markPrice@1s");
    }
}
