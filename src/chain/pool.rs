//! 链池：固定数量的 worker 并发排空一个链队列
//!
//! 每个仿真 tick 产生一批互相独立的链，预先入队后由 W 个 worker 取用；
//! 每处理完一条链 worker 等待固定间隔，限制对传输后端的请求速率。
//! 单条链失败不会终止 worker：每条链连同自己的结果一起交还给调用方。
//! 链运行中 panic（例如工具回调 panic）在 worker 内捕获，记为 ChainError::Panicked。

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::chain::Chain;
use crate::config::PoolSection;
use crate::core::ChainError;

/// 默认 worker 数
pub const DEFAULT_WORKERS: usize = 8;
/// 默认条目间隔
pub const DEFAULT_INTER_ITEM_DELAY: Duration = Duration::from_secs(5);

/// 池状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Init,
    Ready,
}

/// 单条链的处理结果
#[derive(Debug)]
pub struct ChainOutcome {
    pub chain: Chain,
    pub result: Result<(), ChainError>,
}

impl ChainOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// 链池
pub struct ChainPool {
    id: String,
    queue: VecDeque<Chain>,
    workers: usize,
    inter_item_delay: Duration,
    status: PoolStatus,
}

impl ChainPool {
    pub fn new(workers: usize) -> Self {
        Self {
            id: format!("pool_{}", uuid::Uuid::new_v4()),
            queue: VecDeque::new(),
            workers: workers.max(1),
            inter_item_delay: DEFAULT_INTER_ITEM_DELAY,
            status: PoolStatus::Init,
        }
    }

    pub fn from_config(cfg: &PoolSection) -> Self {
        Self::new(cfg.workers).with_inter_item_delay(Duration::from_millis(cfg.inter_item_delay_ms))
    }

    pub fn with_inter_item_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay = delay;
        self
    }

    pub fn status(&self) -> PoolStatus {
        self.status
    }

    /// 待处理链数
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 追加到队尾（可多次调用），池进入 ready
    pub fn enqueue<I>(&mut self, chains: I)
    where
        I: IntoIterator<Item = Chain>,
    {
        self.queue.extend(chains);
        self.status = PoolStatus::Ready;
    }

    /// 启动 worker 并等待队列排空；返回每条链及其结果（顺序不保证）。
    /// 仅 ready 可调用，排空后回到 init
    pub async fn start(&mut self) -> Result<Vec<ChainOutcome>, ChainError> {
        if self.status != PoolStatus::Ready {
            return Err(ChainError::state("start", format!("{:?}", self.status)));
        }

        let total = self.queue.len();
        info!(pool = %self.id, chains = total, workers = self.workers, "chain pool started");

        let queue = Arc::new(Mutex::new(std::mem::take(&mut self.queue)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handles: Vec<_> = (0..self.workers)
            .map(|index| {
                tokio::spawn(worker(
                    index,
                    Arc::clone(&queue),
                    tx.clone(),
                    self.inter_item_delay,
                ))
            })
            .collect();
        drop(tx);

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!(pool = %self.id, error = %e, "pool worker panicked");
            }
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        // worker 全部异常退出时，队列里剩下的链原样交还
        let stranded: Vec<Chain> = queue.lock().await.drain(..).collect();
        if !stranded.is_empty() {
            error!(pool = %self.id, chains = stranded.len(), "chains left unrun by dead workers");
        }
        outcomes.extend(stranded.into_iter().map(|chain| ChainOutcome {
            chain,
            result: Err(ChainError::Panicked("worker exited before running chain".into())),
        }));

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        info!(
            pool = %self.id,
            processed = outcomes.len(),
            failed,
            "chain pool drained"
        );
        self.status = PoolStatus::Init;
        Ok(outcomes)
    }
}

impl Default for ChainPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

/// worker 循环：取一条 → 运行 → 上报 → 队列空则退出，否则等待间隔
async fn worker(
    index: usize,
    queue: Arc<Mutex<VecDeque<Chain>>>,
    tx: mpsc::UnboundedSender<ChainOutcome>,
    delay: Duration,
) {
    loop {
        let next = queue.lock().await.pop_front();
        let Some(mut chain) = next else {
            break;
        };

        let result = match AssertUnwindSafe(chain.run()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                chain.reset_interrupted();
                Err(ChainError::Panicked(panic_message(payload.as_ref())))
            }
        };
        if let Err(e) = &result {
            warn!(worker = index, chain = chain.id(), error = %e, "chain failed in pool");
        }
        if tx.send(ChainOutcome { chain, result }).is_err() {
            break;
        }

        if queue.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(delay).await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
