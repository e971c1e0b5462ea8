//! 步骤：pre_process → invoke → validate
//!
//! PromptStep 发送一次 Prompt 并用 Extractor 校验/抽取；ToolStep 用工具回调代替生成式请求。
//! 步骤输出统一为 `{"input": <本步输入>, <键>: <抽取值>}`，作为下一步的输入。

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::chain::extract::{
    ChoiceExtractor, Extractor, JsonExtractor, PlainExtractor, ScoreExtractor,
};
use crate::core::{AgentContext, ChainError, ModelContext};
use crate::prompt::Prompt;
use crate::tools::{Tool, ToolRegistry};

/// 思维链中的单个步骤
#[async_trait]
pub trait Step: Send + Sync {
    /// 步骤 ID（链内唯一）
    fn id(&self) -> &str;

    /// 预处理输入；默认原样返回
    fn pre_process(
        &self,
        input: Value,
        _agent: &AgentContext,
        _model: &ModelContext,
    ) -> Result<Value, ChainError> {
        Ok(input)
    }

    /// 发出恰好一次请求（或一次工具调用），返回原始响应
    async fn invoke(
        &self,
        input: &Value,
        agent: &AgentContext,
        model: &ModelContext,
    ) -> Result<String, ChainError>;

    /// 校验响应并抽取结构化输出
    fn validate(
        &self,
        input: &Value,
        response: &str,
        agent: &AgentContext,
        model: &ModelContext,
    ) -> Result<Value, ChainError>;
}

fn output(input: &Value, key: &str, value: Value) -> Value {
    let mut out = Map::new();
    out.insert("input".to_string(), input.clone());
    out.insert(key.to_string(), value);
    Value::Object(out)
}

/// 发送 Prompt 的步骤，抽取策略由 E 决定
pub struct PromptStep<E> {
    step_id: String,
    prompt: Arc<Prompt>,
    extractor: E,
}

pub type PlainStep = PromptStep<PlainExtractor>;
pub type ChoiceStep = PromptStep<ChoiceExtractor>;
pub type ScoreStep = PromptStep<ScoreExtractor>;
pub type JsonStep = PromptStep<JsonExtractor>;

impl<E: Extractor + Default> PromptStep<E> {
    pub fn new(step_id: impl Into<String>, prompt: Arc<Prompt>) -> Self {
        Self::with_extractor(step_id, prompt, E::default())
    }
}

impl<E: Extractor> PromptStep<E> {
    pub fn with_extractor(step_id: impl Into<String>, prompt: Arc<Prompt>, extractor: E) -> Self {
        Self {
            step_id: step_id.into(),
            prompt,
            extractor,
        }
    }
}

impl ChoiceStep {
    /// 替换默认的选项模式
    pub fn with_pattern(mut self, pattern: Regex) -> Self {
        self.extractor = ChoiceExtractor::new(pattern);
        self
    }
}

impl ScoreStep {
    /// 替换默认的数字模式
    pub fn with_pattern(mut self, pattern: Regex) -> Self {
        self.extractor = ScoreExtractor::new(pattern);
        self
    }
}

#[async_trait]
impl<E: Extractor> Step for PromptStep<E> {
    fn id(&self) -> &str {
        &self.step_id
    }

    async fn invoke(
        &self,
        input: &Value,
        agent: &AgentContext,
        model: &ModelContext,
    ) -> Result<String, ChainError> {
        Ok(self.prompt.send(input, Some(agent), Some(model)).await?)
    }

    fn validate(
        &self,
        input: &Value,
        response: &str,
        _agent: &AgentContext,
        _model: &ModelContext,
    ) -> Result<Value, ChainError> {
        let value = self.extractor.extract(response)?;
        Ok(output(input, self.extractor.key(), value))
    }
}

/// 调用工具回调的步骤
pub struct ToolStep {
    step_id: String,
    tool: Arc<dyn Tool>,
}

impl ToolStep {
    pub fn new(step_id: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        Self {
            step_id: step_id.into(),
            tool,
        }
    }

    /// 按名称从注册表取工具；找不到时报 ToolFailure
    pub fn from_registry(
        step_id: impl Into<String>,
        registry: &ToolRegistry,
        tool_name: &str,
    ) -> Result<Self, ChainError> {
        let tool = registry
            .get(tool_name)
            .ok_or_else(|| ChainError::ToolFailure(format!("Unknown tool: {tool_name}")))?;
        Ok(Self::new(step_id, tool))
    }
}

#[async_trait]
impl Step for ToolStep {
    fn id(&self) -> &str {
        &self.step_id
    }

    /// 写入 `arguments` 槽位：上一步 JsonStep 的 `json` 作为参数，否则为 null。
    /// 非对象输入包装为 `{"value": <输入>}`
    fn pre_process(
        &self,
        input: Value,
        _agent: &AgentContext,
        _model: &ModelContext,
    ) -> Result<Value, ChainError> {
        let mut obj = match input {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let arguments = obj.get("json").cloned().unwrap_or(Value::Null);
        obj.insert("arguments".to_string(), arguments);
        Ok(Value::Object(obj))
    }

    async fn invoke(
        &self,
        input: &Value,
        _agent: &AgentContext,
        _model: &ModelContext,
    ) -> Result<String, ChainError> {
        let args = input.get("arguments").cloned().unwrap_or(Value::Null);
        tracing::debug!(step = %self.step_id, tool = self.tool.name(), "calling tool");
        self.tool
            .execute(args)
            .await
            .map_err(ChainError::ToolFailure)
    }

    fn validate(
        &self,
        input: &Value,
        response: &str,
        _agent: &AgentContext,
        _model: &ModelContext,
    ) -> Result<Value, ChainError> {
        Ok(output(input, "last_response", json!(response)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::tools::FnTool;

    fn ctx() -> (AgentContext, ModelContext) {
        (
            AgentContext::new("a1", "voter"),
            ModelContext::new(Arc::new(ManualClock::new(0))),
        )
    }

    fn prompt(llm: MockLlmClient) -> Arc<Prompt> {
        Arc::new(Prompt::new("p", "{{ extra }}", Arc::new(llm)))
    }

    #[tokio::test]
    async fn test_plain_step_wraps_response() {
        let (agent, model) = ctx();
        let step = PlainStep::new("s1", prompt(MockLlmClient::always("hello")));
        let input = json!("q");
        let raw = step.invoke(&input, &agent, &model).await.unwrap();
        let out = step.validate(&input, &raw, &agent, &model).unwrap();
        assert_eq!(out, json!({"input": "q", "last_response": "hello"}));
    }

    #[tokio::test]
    async fn test_choice_step_output() {
        let (agent, model) = ctx();
        let step = ChoiceStep::new("vote", prompt(MockLlmClient::new()));
        let out = step
            .validate(&json!({"x": 1}), "I choose C.", &agent, &model)
            .unwrap();
        assert_eq!(out, json!({"input": {"x": 1}, "choice": "C"}));
    }

    #[tokio::test]
    async fn test_transport_error_maps_to_chain_error() {
        let (agent, model) = ctx();
        let llm = MockLlmClient::scripted(vec![Err(LlmError::Timeout)]);
        let step = ScoreStep::new("score", prompt(llm));
        let err = step.invoke(&json!(null), &agent, &model).await.unwrap_err();
        assert!(matches!(err, ChainError::TransportFailure(LlmError::Timeout)));
    }

    #[tokio::test]
    async fn test_tool_step_uses_json_as_arguments() {
        let (agent, model) = ctx();
        let tool = Arc::new(FnTool::new("echo_args", |args: Value| Ok(args.to_string())));
        let step = ToolStep::new("tool", tool);

        let input = step
            .pre_process(json!({"input": "q", "json": {"k": "v"}}), &agent, &model)
            .unwrap();
        assert_eq!(input["arguments"], json!({"k": "v"}));

        let raw = step.invoke(&input, &agent, &model).await.unwrap();
        assert_eq!(raw, r#"{"k":"v"}"#);
        let out = step.validate(&input, &raw, &agent, &model).unwrap();
        assert_eq!(out["last_response"], json!(r#"{"k":"v"}"#));
    }

    #[tokio::test]
    async fn test_tool_step_seeds_empty_arguments() {
        let (agent, model) = ctx();
        let tool = Arc::new(FnTool::new("fail", |_| Err("nope".to_string())));
        let step = ToolStep::new("tool", tool);

        let input = step.pre_process(json!("plain"), &agent, &model).unwrap();
        assert_eq!(input, json!({"value": "plain", "arguments": null}));
        let err = step.invoke(&input, &agent, &model).await.unwrap_err();
        assert!(matches!(err, ChainError::ToolFailure(_)));
    }

    #[tokio::test]
    async fn test_tool_step_from_registry() {
        let (agent, model) = ctx();
        let mut registry = ToolRegistry::new();
        registry.register(FnTool::new("count_keys", |args: Value| {
            Ok(args.as_object().map_or(0, |m| m.len()).to_string())
        }));

        let step = ToolStep::from_registry("count", &registry, "count_keys").unwrap();
        let input = step
            .pre_process(json!({"json": {"a": 1, "b": 2}}), &agent, &model)
            .unwrap();
        assert_eq!(step.invoke(&input, &agent, &model).await.unwrap(), "2");

        assert!(matches!(
            ToolStep::from_registry("x", &registry, "missing"),
            Err(ChainError::ToolFailure(_))
        ));
    }
}
