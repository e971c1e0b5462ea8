//! Mock LLM 客户端（用于测试与演示，无需 API）
//!
//! 三种应答来源，按优先级：预置脚本队列 → 自定义处理函数 → 回显最后一条 User 消息。
//! 同时记录调用次数与每次收到的 prompt，便于测试断言重试次数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

type Handler = dyn Fn(&str) -> Result<String, LlmError> + Send + Sync;

/// Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    handler: Option<Box<Handler>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    /// 回显模式
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回预置响应；脚本耗尽后回落到处理函数或回显
    pub fn scripted<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, LlmError>>,
    {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 每次以 prompt 文本调用处理函数
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::default()
        }
    }

    /// 固定返回同一响应
    pub fn always(response: impl Into<String>) -> Self {
        let response = response.into();
        Self::with_handler(move |_| Ok(response.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(last_user.to_string());

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(response) = scripted {
            return response;
        }

        match &self.handler {
            Some(handler) => handler(last_user),
            None => Ok(format!("Echo from Mock: {last_user}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_mode() {
        let llm = MockLlmClient::new();
        let out = llm.complete(&[Message::user("hello")]).await.unwrap();
        assert_eq!(out, "Echo from Mock: hello");
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_script_then_handler() {
        let mut llm = MockLlmClient::scripted(vec![
            Err(LlmError::RateLimited { retry_after_ms: 10 }),
            Ok("A".to_string()),
        ]);
        llm.handler = Some(Box::new(|_| Ok("fallback".to_string())));

        let msgs = [Message::user("q")];
        assert!(matches!(
            llm.complete(&msgs).await,
            Err(LlmError::RateLimited { .. })
        ));
        assert_eq!(llm.complete(&msgs).await.unwrap(), "A");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "fallback");
        assert_eq!(llm.calls(), 3);
        assert_eq!(llm.prompts(), vec!["q", "q", "q"]);
    }
}
