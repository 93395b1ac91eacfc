//! 客户端连接表：按标签精确匹配转发广播

use super::protocol::IOMsg;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct ClientEntry {
    tx: mpsc::Sender<IOMsg>,
    tags: HashSet<String>,
}

#[derive(Default)]
pub struct ClientHub {
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, ClientEntry>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx: mpsc::Sender<IOMsg>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(id, ClientEntry { tx, tags: HashSet::new() });
        id
    }

    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// 重复订阅同一标签无副作用，返回新增数量
    pub fn subscribe(&self, id: u64, tags: &[String]) -> usize {
        let mut clients = self.lock();
        let Some(entry) = clients.get_mut(&id) else {
            return 0;
        };
        tags.iter().filter(|t| entry.tags.insert((*t).clone())).count()
    }

    pub fn unsubscribe(&self, id: u64, tags: &[String]) -> usize {
        let mut clients = self.lock();
        let Some(entry) = clients.get_mut(&id) else {
            return 0;
        };
        tags.iter().filter(|t| entry.tags.remove(*t)).count()
    }

    /// 发给订阅了 msg.action 的客户端，返回投递数量
    ///
    /// 客户端发送队列满时丢弃该条消息，连接已关闭的客户端会被移除。
    pub fn broadcast(&self, msg: &IOMsg) -> usize {
        let mut sent = 0;
        let mut closed = Vec::new();
        {
            let clients = self.lock();
            for (id, entry) in clients.iter() {
                if !entry.tags.contains(&msg.action) {
                    continue;
                }
                match entry.tx.try_send(msg.clone()) {
                    Ok(()) => sent += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(target: "klspider", client = id, action = %msg.action, "客户端发送队列已满，丢弃消息");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut clients = self.lock();
            for id in closed {
                debug!(target: "klspider", client = id, "移除已断开的客户端");
                clients.remove(&id);
            }
        }
        sent
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ClientEntry>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}
