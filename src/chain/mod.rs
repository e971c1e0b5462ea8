//! 思维链：有序步骤流水线 + 生命周期状态机 + 步骤级重试
//!
//! 状态迁移：
//! - init --set_input--> ready --run--> running --成功--> finish
//! - finish --set_input--> ready
//! - running --某步骤重试耗尽--> ready（本次运行的历史丢弃，需重新 set_input）
//!
//! 重试只作用于单个步骤：生成式响应不确定，单步重试大概率成功；本次运行内已成功的步骤不会重跑。
//! 只有尝试级别的失败（抽取 / 传输 / 工具）会重试，其余错误直接中止本次运行。

pub mod extract;
pub mod pool;
pub mod step;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::{AgentContext, ChainError, ModelContext};

pub use extract::{ChoiceExtractor, Extractor, JsonExtractor, PlainExtractor, ScoreExtractor};
pub use pool::{ChainOutcome, ChainPool, PoolStatus};
pub use step::{ChoiceStep, JsonStep, PlainStep, PromptStep, ScoreStep, Step, ToolStep};

/// 每个步骤的默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// 链状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChainStatus {
    Init,
    Ready,
    Running,
    Finish,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Finish => "finish",
        };
        f.write_str(s)
    }
}

/// 一个已成功步骤的记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step_id: String,
    pub input: Value,
    pub output: Value,
}

/// 思维链
pub struct Chain {
    id: String,
    agent: Arc<AgentContext>,
    model: Arc<ModelContext>,
    steps: Vec<Arc<dyn Step>>,
    status: ChainStatus,
    max_attempts: usize,
    input_content: Option<Value>,
    step_history: Vec<StepRecord>,
    output_content: Option<Value>,
}

impl Chain {
    pub fn new(
        agent: Arc<AgentContext>,
        model: Arc<ModelContext>,
        steps: Vec<Arc<dyn Step>>,
    ) -> Self {
        Self {
            id: format!("{}_chain", agent.id),
            agent,
            model,
            steps,
            status: ChainStatus::Init,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            input_content: None,
            step_history: Vec::new(),
            output_content: None,
        }
    }

    /// 设置每个步骤的最大尝试次数（至少 1）
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> &AgentContext {
        &self.agent
    }

    pub fn status(&self) -> ChainStatus {
        self.status
    }

    /// 仅 init / finish 可调用：清空历史与输出，进入 ready
    pub fn set_input(&mut self, input: Value) -> Result<(), ChainError> {
        if !matches!(self.status, ChainStatus::Init | ChainStatus::Finish) {
            return Err(ChainError::state("set_input", self.status));
        }
        self.input_content = Some(input);
        self.step_history.clear();
        self.output_content = None;
        self.status = ChainStatus::Ready;
        Ok(())
    }

    /// 仅 ready 可调用：依次执行所有步骤
    pub async fn run(&mut self) -> Result<(), ChainError> {
        if self.status != ChainStatus::Ready {
            return Err(ChainError::state("run", self.status));
        }
        self.status = ChainStatus::Running;
        info!(chain = %self.id, steps = self.steps.len(), "chain started");

        let mut last = self.input_content.clone().unwrap_or(Value::Null);
        let steps = self.steps.clone();
        for step in &steps {
            match self.run_step(step.as_ref(), &last).await {
                Ok(record) => {
                    last = record.output.clone();
                    self.step_history.push(record);
                }
                Err(err) => {
                    self.step_history.clear();
                    self.status = ChainStatus::Ready;
                    warn!(chain = %self.id, error = %err, "chain aborted");
                    return Err(err);
                }
            }
        }

        self.output_content = Some(last);
        self.status = ChainStatus::Finish;
        info!(chain = %self.id, "chain finished");
        Ok(())
    }

    /// 单个步骤：最多 max_attempts 次 pre_process → invoke → validate，任一环节失败计为一次
    async fn run_step(&self, step: &dyn Step, last: &Value) -> Result<StepRecord, ChainError> {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            match self.attempt(step, last).await {
                Ok((input, output)) => {
                    debug!(chain = %self.id, step = step.id(), attempt, "step succeeded");
                    return Ok(StepRecord {
                        step_id: step.id().to_string(),
                        input,
                        output,
                    });
                }
                Err(err) if !err.is_retryable() => {
                    warn!(
                        chain = %self.id,
                        step = step.id(),
                        error = %err,
                        "step failed, not retrying"
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        chain = %self.id,
                        step = step.id(),
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "step attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(ChainError::RetryExhausted {
            step_id: step.id().to_string(),
            attempts: self.max_attempts,
            last: Box::new(
                last_err.unwrap_or_else(|| ChainError::ExtractionFailure("no attempt made".into())),
            ),
        })
    }

    async fn attempt(&self, step: &dyn Step, last: &Value) -> Result<(Value, Value), ChainError> {
        let input = step.pre_process(last.clone(), &self.agent, &self.model)?;
        let response = step.invoke(&input, &self.agent, &self.model).await?;
        let output = step.validate(&input, &response, &self.agent, &self.model)?;
        Ok((input, output))
    }

    /// 运行被中断（panic）后回到 ready：丢弃本次历史，保留输入
    pub(crate) fn reset_interrupted(&mut self) {
        self.step_history.clear();
        self.output_content = None;
        self.status = ChainStatus::Ready;
    }

    /// 仅 finish 可调用
    pub fn get_output(&self) -> Result<&Value, ChainError> {
        match (&self.status, &self.output_content) {
            (ChainStatus::Finish, Some(output)) => Ok(output),
            _ => Err(ChainError::state("get_output", self.status)),
        }
    }

    /// 仅 finish 可调用
    pub fn get_history(&self) -> Result<&[StepRecord], ChainError> {
        if self.status != ChainStatus::Finish {
            return Err(ChainError::state("get_history", self.status));
        }
        Ok(&self.step_history)
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::llm::{LlmClient, LlmError, MockLlmClient};
    use crate::prompt::Prompt;
    use serde_json::json;

    fn contexts() -> (Arc<AgentContext>, Arc<ModelContext>) {
        (
            Arc::new(AgentContext::new("agent_1", "a voter")),
            Arc::new(ModelContext::new(Arc::new(ManualClock::new(0)))),
        )
    }

    fn prompt(name: &str, template: &str, llm: Arc<dyn LlmClient>) -> Arc<Prompt> {
        Arc::new(Prompt::new(name, template, llm))
    }

    fn chain_with(steps: Vec<Arc<dyn Step>>) -> Chain {
        let (agent, model) = contexts();
        Chain::new(agent, model, steps)
    }

    #[test]
    fn test_state_guards_before_input() {
        let chain = chain_with(vec![]);
        assert_eq!(chain.status(), ChainStatus::Init);
        assert!(matches!(chain.get_output(), Err(ChainError::StateViolation { .. })));
        assert!(matches!(chain.get_history(), Err(ChainError::StateViolation { .. })));
    }

    #[tokio::test]
    async fn test_run_requires_ready() {
        let mut chain = chain_with(vec![]);
        let err = chain.run().await.unwrap_err();
        assert!(matches!(err, ChainError::StateViolation { operation: "run", .. }));

        chain.set_input(json!("x")).unwrap();
        assert!(matches!(
            chain.set_input(json!("y")),
            Err(ChainError::StateViolation { operation: "set_input", .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_chain_outputs_input() {
        let mut chain = chain_with(vec![]);
        chain.set_input(json!({"q": 1})).unwrap();
        chain.run().await.unwrap();
        assert_eq!(chain.status(), ChainStatus::Finish);
        assert_eq!(chain.get_output().unwrap(), &json!({"q": 1}));
        assert!(chain.get_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_steps_thread_output() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_handler(|p| {
            if p.starts_with("think") {
                Ok(r#"thoughts {"plan": "vote"}"#.to_string())
            } else {
                Ok("Final answer: A".to_string())
            }
        }));
        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(JsonStep::new("think", prompt("t", "think {{ extra }}", llm.clone()))),
            Arc::new(ChoiceStep::new(
                "decide",
                prompt("d", "decide {{ extra.json.plan }}", llm),
            )),
        ];
        let mut chain = chain_with(steps);
        chain.set_input(json!("who wins?")).unwrap();
        chain.run().await.unwrap();

        let history = chain.get_history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].step_id, "think");
        assert_eq!(history[0].output["json"], json!({"plan": "vote"}));
        assert_eq!(history[1].input, history[0].output);

        let output = chain.get_output().unwrap();
        assert_eq!(output["choice"], json!("A"));
        assert_eq!(output["input"]["json"]["plan"], json!("vote"));
    }

    #[tokio::test]
    async fn test_single_failing_step_exhausts_after_three_attempts() {
        let llm = Arc::new(MockLlmClient::always("nothing useful here"));
        let steps: Vec<Arc<dyn Step>> = vec![Arc::new(ScoreStep::new(
            "score",
            prompt("s", "{{ extra }}", llm.clone()),
        ))];
        let mut chain = chain_with(steps);
        chain.set_input(json!("rate it")).unwrap();

        let err = chain.run().await.unwrap_err();
        match err {
            ChainError::RetryExhausted { step_id, attempts, last } => {
                assert_eq!(step_id, "score");
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ChainError::ExtractionFailure(_)));
            }
            other => panic!("Expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(llm.calls(), 3);
        assert_eq!(chain.status(), ChainStatus::Ready);
        assert!(chain.get_history().is_err());
    }

    #[tokio::test]
    async fn test_second_step_failure_runs_first_once() {
        let first = Arc::new(MockLlmClient::always("ok"));
        let second = Arc::new(MockLlmClient::always("no digits"));
        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(PlainStep::new("first", prompt("f", "{{ extra }}", first.clone()))),
            Arc::new(ScoreStep::new("second", prompt("s", "{{ extra }}", second.clone()))),
        ];
        let mut chain = chain_with(steps);
        chain.set_input(json!("go")).unwrap();

        assert!(matches!(
            chain.run().await,
            Err(ChainError::RetryExhausted { ref step_id, .. }) if step_id == "second"
        ));
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 3);

        // 已回到 ready，可以直接再跑一次；前面成功的步骤会重新执行
        chain.run().await.unwrap_err();
        assert_eq!(first.calls(), 2);
        assert_eq!(second.calls(), 6);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried_like_extraction_errors() {
        let llm = Arc::new(MockLlmClient::scripted(vec![
            Err(LlmError::RateLimited { retry_after_ms: 0 }),
            Ok("no letter".to_string()),
            Ok("Pick B".to_string()),
        ]));
        let steps: Vec<Arc<dyn Step>> = vec![Arc::new(ChoiceStep::new(
            "vote",
            prompt("v", "{{ extra }}", llm.clone()),
        ))];
        let mut chain = chain_with(steps);
        chain.set_input(json!("q")).unwrap();
        chain.run().await.unwrap();

        assert_eq!(llm.calls(), 3);
        assert_eq!(chain.get_output().unwrap()["choice"], json!("B"));
    }

    #[tokio::test]
    async fn test_set_input_after_finish_clears_history() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::always("fine"));
        let steps: Vec<Arc<dyn Step>> =
            vec![Arc::new(PlainStep::new("s", prompt("p", "{{ extra }}", llm)))];
        let mut chain = chain_with(steps);
        chain.set_input(json!(1)).unwrap();
        chain.run().await.unwrap();
        assert_eq!(chain.get_history().unwrap().len(), 1);

        chain.set_input(json!(2)).unwrap();
        assert_eq!(chain.status(), ChainStatus::Ready);
        assert!(chain.get_output().is_err());
        chain.run().await.unwrap();
        assert_eq!(chain.get_history().unwrap().len(), 1);
        assert_eq!(chain.get_output().unwrap()["input"], json!(2));
    }

    #[tokio::test]
    async fn test_custom_attempt_bound() {
        let llm = Arc::new(MockLlmClient::always("?"));
        let steps: Vec<Arc<dyn Step>> = vec![Arc::new(JsonStep::new(
            "j",
            prompt("j", "{{ extra }}", llm.clone()),
        ))];
        let mut chain = chain_with(steps).with_max_attempts(5);
        chain.set_input(json!(null)).unwrap();
        assert!(chain.run().await.is_err());
        assert_eq!(llm.calls(), 5);
    }

    /// 内部再跑一条子链的步骤：子链放弃后直接上报
    struct GivingUpStep {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Step for GivingUpStep {
        fn id(&self) -> &str {
            "delegate"
        }

        async fn invoke(
            &self,
            _input: &Value,
            _agent: &AgentContext,
            _model: &ModelContext,
        ) -> Result<String, ChainError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(ChainError::RetryExhausted {
                step_id: "inner".to_string(),
                attempts: 3,
                last: Box::new(ChainError::ExtractionFailure("nothing".into())),
            })
        }

        fn validate(
            &self,
            _input: &Value,
            response: &str,
            _agent: &AgentContext,
            _model: &ModelContext,
        ) -> Result<Value, ChainError> {
            Ok(json!(response))
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let step = Arc::new(GivingUpStep {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let mut chain = chain_with(vec![step.clone() as Arc<dyn Step>]);
        chain.set_input(json!("go")).unwrap();

        let err = chain.run().await.unwrap_err();
        assert!(matches!(
            err,
            ChainError::RetryExhausted { ref step_id, .. } if step_id == "inner"
        ));
        assert_eq!(step.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(chain.status(), ChainStatus::Ready);
    }
}
