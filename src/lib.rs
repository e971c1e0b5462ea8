//! Hive - 多智能体仿真推理核心
//!
//! 模块划分：
//! - **chain**: 思维链（步骤 / 状态机 / 步骤级重试）与并发链池
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、Agent / Model 上下文与仿真时钟
//! - **llm**: 传输抽象与实现（OpenAI 兼容 / Mock）、嵌入
//! - **memory**: 共享向量库、单调 id、反思协议与每个 agent 的记忆门面
//! - **observability**: 日志初始化
//! - **prompt**: 模板渲染与发送
//! - **tools**: ToolStep 调用的工具回调

pub mod chain;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod prompt;
pub mod tools;

pub use chain::{Chain, ChainPool, ChainStatus};
pub use memory::{Memory, MemoryFactory};
