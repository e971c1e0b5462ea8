//! 记忆工厂：全仿真共享的向量库 + 单调 id 空间 + 反思协议
//!
//! 一次仿真运行只构造一个 MemoryFactory，所有 agent 的 Memory 门面持有它的 Arc。
//! 底层向量库不是事务性的，id 分配是「读条目数 → 写入」的两步操作，因此插入、查询、
//! 反思取数全部由同一把互斥锁串行化：锁覆盖从读计数到写入完成的全过程，
//! 并发插入不可能拿到重叠的 id。
//!
//! 反思的取数与检查点更新不是原子的：取数后、检查点落回 Memory 之前到达的新条目仍在旧检查点之上，
//! 不会丢失，但可能在下次反思中再次被总结。

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::MemorySection;
use crate::core::{AgentContext, MemoryError, ModelContext};
use crate::llm::EmbeddingProvider;
use crate::memory::item::{to_columns, NewMemory};
use crate::memory::persistence::StoreSnapshot;
use crate::memory::store::{InMemoryVectorStore, MemoryFilter, SearchHit, VectorStore};
use crate::memory::Memory;
use crate::prompt::Prompt;

/// 从未反思过的检查点
pub const NEVER_REFLECTED: i64 = -1;

/// 插入回执：本批分配到的 id（连续）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertAck {
    pub ids: Vec<u64>,
}

/// 一次反思的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Reflection {
    pub summary: String,
    pub checkpoint: i64,
    /// 参与本次反思的短期记忆条数
    pub items: usize,
}

/// 共享记忆工厂
pub struct MemoryFactory {
    store: Mutex<Box<dyn VectorStore>>,
    top_k: usize,
    reflect_prompt: Arc<Prompt>,
    model: Arc<ModelContext>,
}

impl MemoryFactory {
    pub fn new(
        store: Box<dyn VectorStore>,
        top_k: usize,
        reflect_prompt: Arc<Prompt>,
        model: Arc<ModelContext>,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            top_k,
            reflect_prompt,
            model,
        }
    }

    /// 按 [memory] 配置构造内置向量库（可选嵌入、可选快照）
    pub async fn from_config(
        cfg: &MemorySection,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        reflect_prompt: Arc<Prompt>,
        model: Arc<ModelContext>,
    ) -> Result<Self, MemoryError> {
        let mut store = InMemoryVectorStore::new();
        if let Some(embedder) = embedder {
            store = store.with_embedder(embedder);
        }
        if let Some(path) = &cfg.persist_path {
            store = store.with_snapshot(StoreSnapshot::new(path)).await?;
        }
        Ok(Self::new(Box::new(store), cfg.top_k, reflect_prompt, model))
    }

    /// 为 agent 创建 Memory 门面
    pub fn create_memory(self: &Arc<Self>, agent: Arc<AgentContext>) -> Memory {
        Memory::new(agent, Arc::clone(self))
    }

    pub fn model(&self) -> &ModelContext {
        &self.model
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// 当前条目总数
    pub async fn len(&self) -> Result<u64, MemoryError> {
        self.store.lock().await.count().await
    }

    /// 插入协议：锁内读条目数作为起始 id，连续分配并写入
    pub async fn add_short_memory(&self, batch: Vec<NewMemory>) -> Result<InsertAck, MemoryError> {
        if batch.is_empty() {
            return Ok(InsertAck { ids: Vec::new() });
        }
        let mut store = self.store.lock().await;
        let start = store.count().await?;
        let (documents, records, ids) = to_columns(batch, start);
        store.insert(documents, records, ids.clone()).await?;
        drop(store);

        debug!(first = start, count = ids.len(), "short memory inserted");
        Ok(InsertAck { ids })
    }

    /// 查询协议：锁内对每条文本检索，限定为与 agent 相关的条目
    pub async fn search_short_memory_by_doc(
        &self,
        texts: &[String],
        agent_id: &str,
    ) -> Result<Vec<Vec<SearchHit>>, MemoryError> {
        let filter = MemoryFilter::for_agent(agent_id);
        let store = self.store.lock().await;
        store.query(texts, self.top_k, &filter).await
    }

    /// 反思协议：锁内取出检查点之后与 agent 相关的条目，释放锁后发送反思 Prompt。
    /// 新检查点为本批最大 id；本批为空时保持不变
    pub async fn reflect_memory(
        &self,
        agent: &AgentContext,
        checkpoint: i64,
        long_memory: Option<&str>,
    ) -> Result<Reflection, MemoryError> {
        let filter = MemoryFilter::for_agent(&agent.id).after(checkpoint);
        let fetched = {
            let store = self.store.lock().await;
            store.get(&filter).await?
        };

        let payload = json!({
            "long_memory": long_memory,
            "short_memory": fetched,
        });
        let summary = self
            .reflect_prompt
            .send(&payload, Some(agent), Some(&self.model))
            .await?;

        let new_checkpoint = fetched
            .iter()
            .map(|item| item.id as i64)
            .max()
            .map_or(checkpoint, |max| max.max(checkpoint));

        info!(
            agent = %agent.id,
            items = fetched.len(),
            from = checkpoint,
            to = new_checkpoint,
            "memory reflected"
        );
        Ok(Reflection {
            summary,
            checkpoint: new_checkpoint,
            items: fetched.len(),
        })
    }
}
