//! 仿真上下文：Agent 描述、Model 上下文与仿真时钟
//!
//! 思维链与记忆只读取这些对象（描述、上下文、当前时刻），从不修改。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// 仿真时钟：返回当前仿真时刻（离散 tick）
pub trait SimClock: Send + Sync {
    fn now(&self) -> i64;
}

/// 手动推进的时钟，由仿真主循环每个 tick 调用 advance
#[derive(Debug, Default)]
pub struct ManualClock {
    tick: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            tick: AtomicI64::new(start),
        }
    }

    /// 推进一个 tick，返回推进后的时刻
    pub fn advance(&self) -> i64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set(&self, tick: i64) {
        self.tick.store(tick, Ordering::SeqCst);
    }
}

impl SimClock for ManualClock {
    fn now(&self) -> i64 {
        self.tick.load(Ordering::SeqCst)
    }
}

/// 单个 Agent 的只读描述
#[derive(Debug, Clone, Serialize)]
pub struct AgentContext {
    /// 组件 ID，同时作为记忆的 source / target
    pub id: String,
    pub description: String,
    pub context: Value,
}

impl AgentContext {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// 仿真模型的只读上下文与时钟
#[derive(Clone)]
pub struct ModelContext {
    pub context: Value,
    clock: Arc<dyn SimClock>,
}

impl ModelContext {
    pub fn new(clock: Arc<dyn SimClock>) -> Self {
        Self {
            context: Value::Null,
            clock,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// 当前仿真时刻（记忆默认时间戳）
    pub fn now(&self) -> i64 {
        self.clock.now()
    }
}

impl std::fmt::Debug for ModelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelContext")
            .field("context", &self.context)
            .field("now", &self.clock.now())
            .finish()
    }
}
