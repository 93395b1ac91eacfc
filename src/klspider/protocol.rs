//! 爬虫内部协议
//!
//! 帧格式：4 字节大端长度 + JSON `{"action": ..., "data": ...}`。
//! 广播类消息的 action 带有 `<前缀>_<交易所>_<市场>[_<品种>]` 标签，客户端按标签精确订阅。

use crate::kldata::StreamKind;
use crate::klcommon::{AppError, Result};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const ACTION_SUBSCRIBE: &str = "subscribe";
pub const ACTION_UNSUBSCRIBE: &str = "unsubscribe";
pub const ACTION_WATCH_PAIRS: &str = "watch_pairs";
pub const ACTION_UNWATCH_PAIRS: &str = "unwatch_pairs";

/// 单帧上限
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IOMsg {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl IOMsg {
    pub fn new<T: Serialize>(action: impl Into<String>, data: &T) -> Result<Self> {
        Ok(Self { action: action.into(), data: serde_json::to_value(data)? })
    }

    /// 标签列表：subscribe/unsubscribe 的消息体
    pub fn tags(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// 广播类消息的前缀，如 `ohlcv`、`uohlcv`
    pub fn prefix(&self) -> &str {
        self.action.split('_').next().unwrap_or_default()
    }
}

/// watch_pairs / unwatch_pairs 的消息体：[exg, market, streamType, sym...]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchReq {
    pub exchange: String,
    pub market: String,
    pub kind: StreamKind,
    pub symbols: Vec<String>,
}

impl WatchReq {
    pub fn parse(data: &Value) -> Result<Self> {
        let items: Vec<String> = serde_json::from_value(data.clone())?;
        if items.len() < 3 {
            return Err(AppError::DataError(format!("watch_pairs 参数不足: {:?}", items)));
        }
        let mut iter = items.into_iter();
        let exchange = iter.next().unwrap_or_default();
        let market = iter.next().unwrap_or_default();
        let kind = StreamKind::parse(&iter.next().unwrap_or_default())?;
        Ok(Self { exchange, market, kind, symbols: iter.collect() })
    }

    pub fn to_data(&self) -> Value {
        let mut items = vec![self.exchange.clone(), self.market.clone(), self.kind.as_str().to_string()];
        items.extend(self.symbols.iter().cloned());
        Value::from(items)
    }
}

pub fn ohlcv_tag(exchange: &str, market: &str, symbol: &str) -> String {
    format!("ohlcv_{}_{}_{}", exchange, market, symbol)
}

pub fn uohlcv_tag(exchange: &str, market: &str, symbol: &str) -> String {
    format!("uohlcv_{}_{}_{}", exchange, market, symbol)
}

pub fn price_tag(exchange: &str, market: &str) -> String {
    format!("price_{}_{}", exchange, market)
}

pub fn trade_tag(exchange: &str, market: &str, symbol: &str) -> String {
    format!("trade_{}_{}_{}", exchange, market, symbol)
}

pub fn book_tag(exchange: &str, market: &str, symbol: &str) -> String {
    format!("book_{}_{}_{}", exchange, market, symbol)
}

/// 从 `<prefix>_<exg>_<mkt>_<symbol>` 里取出品种；品种本身可能含下划线
pub fn tag_symbol(action: &str) -> Option<&str> {
    let mut parts = action.splitn(4, '_');
    parts.next()?;
    parts.next()?;
    parts.next()?;
    parts.next()
}

/// IOMsg 编解码器
#[derive(Debug)]
pub struct MsgCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MsgCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        Self { inner }
    }
}

impl Decoder for MsgCodec {
    type Item = IOMsg;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<IOMsg>> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<IOMsg> for MsgCodec {
    type Error = AppError;

    fn encode(&mut self, item: IOMsg, dst: &mut BytesMut) -> Result<()> {
        let body = serde_json::to_vec(&item)?;
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}
