//! 向量库协作者
//!
//! VectorStore 是 MemoryFactory 背后的存储抽象：按 id 插入（文档, 元数据, id）、按文本相似度查询、
//! 按过滤条件取回。存储本身不是事务性的，调用方（MemoryFactory）负责用锁串行化所有访问，
//! 因此写接口取 `&mut self`。
//!
//! InMemoryVectorStore 为内置实现：配置了嵌入模型时用余弦相似度，否则用 jieba 分词后的
//! Jaccard 关键词相似度；可选 JSON 快照持久化。
//!
//! 快照是整库重写：每次插入都在 MemoryFactory 的锁内把全部条目序列化一遍，代价随条目数线性增长，
//! 期间所有 agent 的查询与反思都会等待。适合单次仿真规模（数千条）；更大规模应换用自带持久化的
//! VectorStore 实现。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use jieba_rs::Jieba;
use serde::Serialize;

use crate::core::MemoryError;
use crate::llm::EmbeddingProvider;
use crate::memory::persistence::StoreSnapshot;
use crate::memory::MemoryItem;

/// 查询 / 取回的过滤条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryFilter {
    /// source 或 target 等于该 agent
    pub agent: Option<String>,
    /// id 严格大于该值
    pub after_id: Option<i64>,
}

impl MemoryFilter {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent: Some(agent_id.into()),
            after_id: None,
        }
    }

    pub fn after(mut self, id: i64) -> Self {
        self.after_id = Some(id);
        self
    }

    pub fn matches(&self, item: &MemoryItem) -> bool {
        let agent_ok = self.agent.as_deref().map_or(true, |a| item.involves(a));
        let id_ok = self.after_id.map_or(true, |after| (item.id as i64) > after);
        agent_ok && id_ok
    }
}

/// 单条检索结果
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub item: MemoryItem,
    pub score: f32,
}

/// 向量库接口
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 当前条目数
    async fn count(&self) -> Result<u64, MemoryError>;

    /// 插入三列（长度必须一致）；返回插入条数
    async fn insert(
        &mut self,
        documents: Vec<String>,
        records: Vec<MemoryItem>,
        ids: Vec<u64>,
    ) -> Result<usize, MemoryError>;

    /// 每条查询文本返回至多 top_k 条，按相似度降序
    async fn query(
        &self,
        texts: &[String],
        top_k: usize,
        filter: &MemoryFilter,
    ) -> Result<Vec<Vec<SearchHit>>, MemoryError>;

    /// 取回所有满足过滤条件的条目，按 id 升序
    async fn get(&self, filter: &MemoryFilter) -> Result<Vec<MemoryItem>, MemoryError>;
}

static JIEBA: OnceLock<Jieba> = OnceLock::new();

/// 中英文混合关键词：CJK 文本走 jieba 搜索引擎模式，其余按空白切分；统一小写
fn keywords(text: &str) -> HashSet<String> {
    let has_cjk = text
        .chars()
        .any(|c| matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}'));
    let words: Vec<String> = if has_cjk {
        JIEBA
            .get_or_init(Jieba::new)
            .cut_for_search(text, true)
            .into_iter()
            .map(str::to_string)
            .collect()
    } else {
        text.split_whitespace().map(str::to_string).collect()
    };
    words
        .into_iter()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty() && (w.chars().count() > 1 || !w.is_ascii()))
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f32;
    shared / a.union(b).count() as f32
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

struct Entry {
    item: MemoryItem,
    keywords: HashSet<String>,
    embedding: Option<Vec<f32>>,
}

/// 内置向量库
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: Vec<Entry>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    snapshot: Option<StoreSnapshot>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// 打开快照：读回已有条目，之后每次插入都会重写快照
    pub async fn with_snapshot(mut self, snapshot: StoreSnapshot) -> Result<Self, MemoryError> {
        let items = snapshot.load().await?;
        tracing::info!(
            path = %snapshot.path().display(),
            items = items.len(),
            "memory snapshot loaded"
        );
        for item in items {
            let document = item.content.clone();
            let entry = self.make_entry(&document, item).await?;
            self.entries.push(entry);
        }
        self.snapshot = Some(snapshot);
        Ok(self)
    }

    async fn make_entry(&self, document: &str, item: MemoryItem) -> Result<Entry, MemoryError> {
        let embedding = match &self.embedder {
            Some(embedder) => Some(
                embedder
                    .embed(document)
                    .await
                    .map_err(|e| MemoryError::Store(format!("embedding failed: {e}")))?,
            ),
            None => None,
        };
        Ok(Entry {
            keywords: keywords(document),
            item,
            embedding,
        })
    }

    async fn score_all(
        &self,
        text: &str,
        filter: &MemoryFilter,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let query_embedding = match &self.embedder {
            Some(embedder) => Some(
                embedder
                    .embed(text)
                    .await
                    .map_err(|e| MemoryError::Store(format!("embedding failed: {e}")))?,
            ),
            None => None,
        };
        let query_keywords = keywords(text);

        Ok(self
            .entries
            .iter()
            .filter(|e| filter.matches(&e.item))
            .map(|e| {
                let score = match (&query_embedding, &e.embedding) {
                    (Some(q), Some(d)) => cosine_similarity(q, d),
                    _ => jaccard(&query_keywords, &e.keywords),
                };
                SearchHit {
                    item: e.item.clone(),
                    score,
                }
            })
            .collect())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn count(&self) -> Result<u64, MemoryError> {
        Ok(self.entries.len() as u64)
    }

    async fn insert(
        &mut self,
        documents: Vec<String>,
        records: Vec<MemoryItem>,
        ids: Vec<u64>,
    ) -> Result<usize, MemoryError> {
        if documents.len() != records.len() || records.len() != ids.len() {
            return Err(MemoryError::Store(format!(
                "column length mismatch: {} documents, {} records, {} ids",
                documents.len(),
                records.len(),
                ids.len()
            )));
        }
        let existing: HashSet<u64> = self.entries.iter().map(|e| e.item.id).collect();
        let mut incoming = HashSet::new();
        for (record, id) in records.iter().zip(&ids) {
            if record.id != *id {
                return Err(MemoryError::Store(format!(
                    "record id {} does not match id {id}",
                    record.id
                )));
            }
            if existing.contains(id) || !incoming.insert(*id) {
                return Err(MemoryError::Store(format!("duplicate id {id}")));
            }
        }

        let mut fresh = Vec::with_capacity(records.len());
        for (document, record) in documents.iter().zip(records) {
            fresh.push(self.make_entry(document, record).await?);
        }
        // 快照写成功后才并入内存，写失败时库保持原样、id 不被占用
        if let Some(snapshot) = &self.snapshot {
            let items: Vec<MemoryItem> = self
                .entries
                .iter()
                .chain(&fresh)
                .map(|e| e.item.clone())
                .collect();
            snapshot.save(&items).await?;
        }
        let added = fresh.len();
        self.entries.extend(fresh);
        Ok(added)
    }

    async fn query(
        &self,
        texts: &[String],
        top_k: usize,
        filter: &MemoryFilter,
    ) -> Result<Vec<Vec<SearchHit>>, MemoryError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            let mut hits = self.score_all(text, filter).await?;
            // 分数相同时新条目优先
            hits.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.item.id.cmp(&a.item.id))
            });
            hits.truncate(top_k);
            results.push(hits);
        }
        Ok(results)
    }

    async fn get(&self, filter: &MemoryFilter) -> Result<Vec<MemoryItem>, MemoryError> {
        let mut items: Vec<MemoryItem> = self
            .entries
            .iter()
            .filter(|e| filter.matches(&e.item))
            .map(|e| e.item.clone())
            .collect();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }
}
