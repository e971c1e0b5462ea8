//! 错误类型：思维链、记忆库、Prompt
//!
//! ChainError 为带标签的结果类型：调用方按变体区分「状态违规 / 抽取失败 / 传输失败 / 重试耗尽」，
//! 而不是捕获一个笼统的错误。

use thiserror::Error;

use crate::llm::LlmError;

/// 思维链与步骤执行中的错误
#[derive(Error, Debug)]
pub enum ChainError {
    /// 在非法生命周期状态下调用操作（如 finish 之前 get_output）
    #[error("Operation `{operation}` not allowed in state {state}")]
    StateViolation {
        operation: &'static str,
        state: String,
    },

    /// 响应中找不到期望内容（选项、分数、JSON）
    #[error("Extraction failed: {0}")]
    ExtractionFailure(String),

    /// 传输层（LLM 请求）失败
    #[error("Transport failed: {0}")]
    TransportFailure(#[from] LlmError),

    /// 工具回调失败
    #[error("Tool failed: {0}")]
    ToolFailure(String),

    /// 步骤执行中 panic（如工具回调 panic），由链池捕获
    #[error("Chain panicked: {0}")]
    Panicked(String),

    /// 单个步骤重试次数耗尽，整条链需经 set_input 重新提交
    #[error("Step `{step_id}` failed after {attempts} attempts: {last}")]
    RetryExhausted {
        step_id: String,
        attempts: usize,
        last: Box<ChainError>,
    },
}

impl ChainError {
    pub fn state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        Self::StateViolation {
            operation,
            state: state.to_string(),
        }
    }

    /// 单次尝试级别的失败（可在步骤内重试）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExtractionFailure(_) | Self::TransportFailure(_) | Self::ToolFailure(_)
        )
    }
}

/// 共享记忆库错误
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Vector store error: {0}")]
    Store(String),

    #[error("Reflection failed: {0}")]
    Reflection(#[from] LlmError),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Prompt 模板加载错误
#[derive(Error, Debug)]
pub enum PromptError {
    #[error("Prompt folder does not exist: {0}")]
    FolderMissing(String),

    #[error("Prompt template does not exist: {0}")]
    TemplateMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        assert!(ChainError::ExtractionFailure("x".into()).is_retryable());
        assert!(ChainError::TransportFailure(LlmError::Timeout).is_retryable());
        assert!(ChainError::ToolFailure("boom".into()).is_retryable());
        assert!(!ChainError::state("run", "init").is_retryable());
        assert!(!ChainError::Panicked("boom".into()).is_retryable());
    }

    #[test]
    fn test_retry_exhausted_message() {
        let err = ChainError::RetryExhausted {
            step_id: "vote".into(),
            attempts: 3,
            last: Box::new(ChainError::ExtractionFailure("No choice found".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("vote"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("No choice found"));
    }
}
