//! 单个 agent 的记忆门面
//!
//! 只持有自己的检查点与长期记忆摘要；条目存取全部委托给共享的 MemoryFactory。
//! 反思由外部按需调用（例如每个仿真 tick 一次），这里不做任何调度。

use std::sync::Arc;

use crate::core::{AgentContext, MemoryError};
use crate::memory::factory::{InsertAck, MemoryFactory, Reflection, NEVER_REFLECTED};
use crate::memory::store::SearchHit;
use crate::memory::NewMemory;

pub struct Memory {
    agent: Arc<AgentContext>,
    factory: Arc<MemoryFactory>,
    last_id: i64,
    long_memory: Option<String>,
}

impl Memory {
    pub(crate) fn new(agent: Arc<AgentContext>, factory: Arc<MemoryFactory>) -> Self {
        Self {
            agent,
            factory,
            last_id: NEVER_REFLECTED,
            long_memory: None,
        }
    }

    pub fn agent(&self) -> &AgentContext {
        &self.agent
    }

    /// 记录一条事件；ts 缺省为当前仿真时刻
    pub async fn add_short_memory(
        &self,
        source: &str,
        target: &str,
        action: &str,
        content: &str,
        ts: Option<i64>,
    ) -> Result<InsertAck, MemoryError> {
        let ts = ts.unwrap_or_else(|| self.factory.model().now());
        let event = NewMemory::new(ts, source, target, action, content);
        self.factory.add_short_memory(vec![event]).await
    }

    /// 以文本检索与本 agent 相关的短期记忆，每条查询返回至多 top_k 条
    pub async fn search_short_memory_by_doc(
        &self,
        queries: &[String],
    ) -> Result<Vec<Vec<SearchHit>>, MemoryError> {
        self.factory
            .search_short_memory_by_doc(queries, &self.agent.id)
            .await
    }

    /// 反思：总结检查点之后的新条目与旧摘要，更新摘要与检查点。
    /// 失败时摘要与检查点保持不变
    pub async fn reflect_memory(&mut self) -> Result<Reflection, MemoryError> {
        let reflection = self
            .factory
            .reflect_memory(&self.agent, self.last_id, self.long_memory.as_deref())
            .await?;
        self.last_id = reflection.checkpoint;
        self.long_memory = Some(reflection.summary.clone());
        Ok(reflection)
    }

    /// 当前长期记忆摘要；首次反思前为 None
    pub fn get_long_memory(&self) -> Option<&str> {
        self.long_memory.as_deref()
    }

    /// 已并入摘要的最大条目 id；从未反思时为 -1
    pub fn last_checkpoint(&self) -> i64 {
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, ModelContext};
    use crate::llm::{LlmError, MockLlmClient};
    use crate::memory::InMemoryVectorStore;
    use crate::prompt::Prompt;

    fn setup(llm: MockLlmClient) -> (Arc<ManualClock>, Arc<MemoryFactory>) {
        let clock = Arc::new(ManualClock::new(0));
        let model = Arc::new(ModelContext::new(clock.clone()));
        let prompt = Arc::new(Prompt::new("reflect", "{{ extra }}", Arc::new(llm)));
        let factory = Arc::new(MemoryFactory::new(
            Box::new(InMemoryVectorStore::new()),
            5,
            prompt,
            model,
        ));
        (clock, factory)
    }

    #[tokio::test]
    async fn test_default_timestamp_is_sim_time() {
        let (clock, factory) = setup(MockLlmClient::new());
        let memory = factory.create_memory(Arc::new(AgentContext::new("a", "x")));
        clock.set(42);
        memory
            .add_short_memory("a", "b", "talk", "hello", None)
            .await
            .unwrap();
        memory
            .add_short_memory("a", "b", "talk", "later", Some(7))
            .await
            .unwrap();

        let hits = memory
            .search_short_memory_by_doc(&["hello".to_string()])
            .await
            .unwrap();
        let hello = hits[0].iter().find(|h| h.item.content == "hello").unwrap();
        assert_eq!(hello.item.ts, 42);
        let later = hits[0].iter().find(|h| h.item.content == "later").unwrap();
        assert_eq!(later.item.ts, 7);
    }

    #[tokio::test]
    async fn test_reflect_updates_summary_and_checkpoint_monotonically() {
        let (_, factory) = setup(MockLlmClient::scripted(vec![
            Ok("s1".to_string()),
            Ok("s2".to_string()),
            Err(LlmError::Transport("down".into())),
        ]));
        let mut alice = factory.create_memory(Arc::new(AgentContext::new("alice", "x")));
        let bob = factory.create_memory(Arc::new(AgentContext::new("bob", "y")));

        assert_eq!(alice.get_long_memory(), None);
        assert_eq!(alice.last_checkpoint(), -1);

        alice.add_short_memory("alice", "bob", "talk", "hi", None).await.unwrap();
        bob.add_short_memory("bob", "carol", "talk", "psst", None).await.unwrap();

        let r = alice.reflect_memory().await.unwrap();
        assert_eq!(r.checkpoint, 0);
        assert_eq!(alice.get_long_memory(), Some("s1"));

        // 没有新条目：检查点不变，但摘要照常刷新
        alice.reflect_memory().await.unwrap();
        assert_eq!(alice.last_checkpoint(), 0);
        assert_eq!(alice.get_long_memory(), Some("s2"));

        // 失败时保留原状态
        bob.add_short_memory("carol", "alice", "talk", "news", None).await.unwrap();
        assert!(alice.reflect_memory().await.is_err());
        assert_eq!(alice.last_checkpoint(), 0);
        assert_eq!(alice.get_long_memory(), Some("s2"));
    }
}
