//! 写入队列：按 sid 分片到固定数量的写入协程，保证同一品种的写入顺序

use super::hub::ClientHub;
use super::protocol::IOMsg;
use crate::klcommon::timeframe::tf_to_secs;
use crate::klcommon::{AppError, Kline, NotifyKLines, Result};
use crate::klstore::KlineStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 一次写库任务
#[derive(Debug, Clone)]
pub struct SaveKline {
    pub sid: i32,
    pub tf: &'static str,
    /// 已完成K线，写库成功后以 action 广播
    pub bars: Vec<Kline>,
    /// 正在形成的K线，写入 kline_un
    pub partial: Option<Kline>,
    pub action: String,
}

#[derive(Clone)]
pub struct WriteQueue {
    shards: Arc<Vec<mpsc::Sender<SaveKline>>>,
}

impl WriteQueue {
    /// 启动 workers 个写入协程，队列总容量为 queue_size
    pub fn start(
        store: KlineStore,
        hub: Arc<ClientHub>,
        workers: usize,
        queue_size: usize,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let per_shard = (queue_size / workers).max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let (tx, rx) = mpsc::channel(per_shard);
            shards.push(tx);
            handles.push(tokio::spawn(run_writer(idx, rx, store.clone(), hub.clone(), cancel.clone())));
        }
        info!(target: "klspider", log_type = "module", workers, per_shard, "写入协程已启动");
        (Self { shards: Arc::new(shards) }, handles)
    }

    pub async fn push(&self, job: SaveKline) -> Result<()> {
        let idx = job.sid.unsigned_abs() as usize % self.shards.len();
        self.shards[idx]
            .send(job)
            .await
            .map_err(|_| AppError::ChannelError("写入队列已关闭".to_string()))
    }
}

async fn run_writer(
    idx: usize,
    mut rx: mpsc::Receiver<SaveKline>,
    store: KlineStore,
    hub: Arc<ClientHub>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            job = rx.recv() => job,
            _ = cancel.cancelled() => None,
        };
        let Some(job) = job else { break };
        if let Err(e) = save_job(&store, &hub, job).await {
            error!(
                target: "klspider",
                worker = idx,
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "写入K线失败"
            );
        }
    }
    debug!(target: "klspider", worker = idx, "写入协程退出");
}

/// 先持久化，成功后才广播
pub async fn save_job(store: &KlineStore, hub: &ClientHub, job: SaveKline) -> Result<()> {
    let SaveKline { sid, tf, bars, partial, action } = job;
    if !bars.is_empty() {
        let saved = bars.clone();
        store.run_blocking(move |s| s.insert_auto(tf, sid, &saved)).await?;
        let tf_secs = tf_to_secs(tf)? as i32;
        let msg = IOMsg::new(action, &NotifyKLines { tf_secs, interval: tf_secs, bars })?;
        hub.broadcast(&msg);
    }
    if let Some(bar) = partial {
        let now = store.now_ms();
        store.run_blocking(move |s| s.set_unfinished(sid, tf, &bar, now)).await?;
    }
    Ok(())
}
