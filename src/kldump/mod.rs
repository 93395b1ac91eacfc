//! 实盘诊断记录：追加写入的长度前缀二进制日志
//!
//! 每行格式（大端）：`[u32 len][i64 time][u8 kind][u16 key_len][key][u32 val_len][val]`，
//! len 为其后内容的字节数。写入端在一个互斥锁下缓存并批量追加，读取端需要独占文件。

use crate::klcommon::{AppError, ClockRef, Kline, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 单行上限，超过视为文件损坏
const MAX_ROW_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Kline,
    Startup,
    Trade,
    Price,
    Custom(u8),
}

impl DumpKind {
    pub fn to_u8(self) -> u8 {
        match self {
            DumpKind::Kline => 1,
            DumpKind::Startup => 2,
            DumpKind::Trade => 3,
            DumpKind::Price => 4,
            DumpKind::Custom(v) => v,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => DumpKind::Kline,
            2 => DumpKind::Startup,
            3 => DumpKind::Trade,
            4 => DumpKind::Price,
            other => DumpKind::Custom(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DumpRow {
    pub time_ms: i64,
    pub kind: DumpKind,
    pub key: String,
    pub val: Vec<u8>,
}

impl DumpRow {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let key = self.key.as_bytes();
        if key.len() > u16::MAX as usize {
            return Err(AppError::DataError(format!("记录键过长: {} 字节", key.len())));
        }
        let body_len = 8 + 1 + 2 + key.len() + 4 + self.val.len();
        if body_len > MAX_ROW_LEN as usize {
            return Err(AppError::DataError(format!("记录过长: {} 字节", body_len)));
        }
        buf.reserve(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_i64(self.time_ms);
        buf.put_u8(self.kind.to_u8());
        buf.put_u16(key.len() as u16);
        buf.put_slice(key);
        buf.put_u32(self.val.len() as u32);
        buf.put_slice(&self.val);
        Ok(())
    }

    /// 解码不含长度前缀的内容
    pub fn decode_body(mut body: &[u8]) -> Result<Self> {
        if body.remaining() < 11 {
            return Err(AppError::Eof("记录头不完整".to_string()));
        }
        let time_ms = body.get_i64();
        let kind = DumpKind::from_u8(body.get_u8());
        let key_len = body.get_u16() as usize;
        if body.remaining() < key_len + 4 {
            return Err(AppError::Eof("记录键不完整".to_string()));
        }
        let key = String::from_utf8(body[..key_len].to_vec())
            .map_err(|e| AppError::DataError(format!("记录键不是 UTF-8: {}", e)))?;
        body.advance(key_len);
        let val_len = body.get_u32() as usize;
        if body.remaining() < val_len {
            return Err(AppError::Eof("记录值不完整".to_string()));
        }
        let val = body[..val_len].to_vec();
        Ok(Self { time_ms, kind, key, val })
    }
}

/// K线记录的键
pub fn kline_key(symbol: &str, tf: &str) -> String {
    format!("{}|{}", symbol, tf)
}

/// 解出K线记录的 (品种, 周期, K线)
pub fn decode_klines(row: &DumpRow) -> Result<(String, String, Vec<Kline>)> {
    if row.kind != DumpKind::Kline {
        return Err(AppError::DataError(format!("不是K线记录: {:?}", row.kind)));
    }
    let (symbol, tf) = row
        .key
        .split_once('|')
        .ok_or_else(|| AppError::DataError(format!("K线记录键格式错误: {}", row.key)))?;
    let bars: Vec<Kline> = serde_json::from_slice(&row.val)?;
    Ok((symbol.to_string(), tf.to_string(), bars))
}

struct DumpInner {
    out: BufWriter<File>,
    pending: Vec<DumpRow>,
}

pub struct DumpWriter {
    path: PathBuf,
    clock: ClockRef,
    inner: Mutex<DumpInner>,
}

impl DumpWriter {
    /// 以追加方式打开，并写入一条启动记录
    pub fn open<P: AsRef<Path>>(path: P, clock: ClockRef) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = Self {
            path,
            clock,
            inner: Mutex::new(DumpInner { out: BufWriter::new(file), pending: Vec::new() }),
        };
        writer.add_dump_row(DumpKind::Startup, "startup", Vec::new());
        info!(target: "kldump", log_type = "module", path = %writer.path.display(), "诊断记录已打开");
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_dump_row(&self, kind: DumpKind, key: &str, val: Vec<u8>) {
        let row = DumpRow { time_ms: self.clock.now_ms(), kind, key: key.to_string(), val };
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).pending.push(row);
    }

    pub fn add_klines(&self, symbol: &str, tf: &str, bars: &[Kline]) -> Result<()> {
        let val = serde_json::to_vec(bars)?;
        self.add_dump_row(DumpKind::Kline, &kline_key(symbol, tf), val);
        Ok(())
    }

    /// 把缓存的记录追加到文件，返回写入行数
    pub fn flush_dumps(&self) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.pending.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::take(&mut inner.pending);
        let mut buf = BytesMut::new();
        for row in &rows {
            row.encode(&mut buf)?;
        }
        inner.out.write_all(&buf)?;
        inner.out.flush()?;
        debug!(target: "kldump", rows = rows.len(), bytes = buf.len(), "诊断记录已写入");
        Ok(rows.len())
    }

    /// 定期刷盘，取消时做最后一次刷盘
    pub async fn run_flush_loop(&self, every: Duration, cancel: CancellationToken) {
        loop {
            let alive = crate::klcommon::btime::sleep(every, &cancel).await;
            if let Err(e) = self.flush_dumps() {
                error!(target: "kldump", path = %self.path.display(), error.summary = e.get_error_type_summary(), error.details = %e, "写入诊断记录失败");
            }
            if !alive {
                return;
            }
        }
    }
}

/// 顺序读取诊断记录
pub struct DumpReader<R: Read> {
    src: R,
}

impl DumpReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> DumpReader<R> {
    pub fn new(src: R) -> Self {
        Self { src }
    }

    /// 读取下一行；文件正常结束返回 None，截断返回 Eof 错误
    pub fn read_row(&mut self) -> Result<Option<DumpRow>> {
        let mut len_buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            let n = self.src.read(&mut len_buf[got..])?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                return Err(AppError::Eof("记录长度不完整".to_string()));
            }
            got += n;
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_ROW_LEN {
            return Err(AppError::DataError(format!("记录长度异常: {}", len)));
        }
        let mut body = vec![0u8; len as usize];
        self.src.read_exact(&mut body).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => AppError::Eof("记录内容不完整".to_string()),
            _ => AppError::IoError(e),
        })?;
        DumpRow::decode_body(&body).map(Some)
    }
}

impl<R: Read> Iterator for DumpReader<R> {
    type Item = Result<DumpRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_row().transpose()
    }
}
