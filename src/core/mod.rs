//! 核心层：错误类型与仿真上下文（Agent / Model / 时钟）

pub mod context;
pub mod error;

pub use context::{AgentContext, ManualClock, ModelContext, SimClock};
pub use error::{ChainError, MemoryError, PromptError};
