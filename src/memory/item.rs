//! 记忆条目
//!
//! NewMemory 是尚未入库的事件；入库时由 MemoryFactory 在锁内分配 id，得到不可变的 MemoryItem。
//! MemoryItem 序列化后即向量库中的元数据记录，也是反思载荷 short_memory 的元素。

use serde::{Deserialize, Serialize};

/// 待入库的事件
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemory {
    pub ts: i64,
    pub source: String,
    pub target: String,
    pub action: String,
    pub content: String,
}

impl NewMemory {
    pub fn new(
        ts: i64,
        source: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            ts,
            source: source.into(),
            target: target.into(),
            action: action.into(),
            content: content.into(),
        }
    }

    /// 赋予 id，成为不可变条目
    pub fn with_id(self, id: u64) -> MemoryItem {
        MemoryItem {
            id,
            ts: self.ts,
            source: self.source,
            target: self.target,
            action: self.action,
            content: self.content,
        }
    }
}

/// 已入库的记忆条目（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: u64,
    pub ts: i64,
    pub source: String,
    pub target: String,
    pub action: String,
    pub content: String,
}

impl MemoryItem {
    /// 该条目是否与某个 agent 相关（作为 source 或 target）
    pub fn involves(&self, agent_id: &str) -> bool {
        self.source == agent_id || self.target == agent_id
    }
}

/// 把一批事件转为 (文档, 元数据, id) 三列，id 从 start_id 起连续分配
pub fn to_columns(
    batch: Vec<NewMemory>,
    start_id: u64,
) -> (Vec<String>, Vec<MemoryItem>, Vec<u64>) {
    let mut documents = Vec::with_capacity(batch.len());
    let mut records = Vec::with_capacity(batch.len());
    let mut ids = Vec::with_capacity(batch.len());
    for (id, event) in (start_id..).zip(batch) {
        let item = event.with_id(id);
        documents.push(item.content.clone());
        ids.push(id);
        records.push(item);
    }
    (documents, records, ids)
}
