//! Prompt：模板渲染与发送
//!
//! 模板内的占位符为 `{{ path.to.value }}`，可用的根为 `agent`（description / context）、
//! `model`（context）与 `extra`（步骤输入或反思载荷）。字符串原样插入，其余值以 JSON 插入，
//! 找不到的路径渲染为空串。PromptFactory 从目录按文件名加载模板。

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::{Captures, Regex};
use serde_json::{json, Value};

use crate::core::{AgentContext, ModelContext, PromptError};
use crate::llm::{LlmClient, LlmError, Message};

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][\w.]*)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// 按点分路径在 JSON 中查找；数组下标也按数字段处理
fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(scope, |cur, key| match cur {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 单个模板 + 发送它的传输客户端
#[derive(Clone)]
pub struct Prompt {
    name: String,
    template: String,
    llm: Arc<dyn LlmClient>,
}

impl Prompt {
    pub fn new(
        name: impl Into<String>,
        template: impl Into<String>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            llm,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 渲染模板文本
    pub fn render(
        &self,
        extra: &Value,
        agent: Option<&AgentContext>,
        model: Option<&ModelContext>,
    ) -> String {
        let scope = json!({
            "agent": agent.map(|a| json!({
                "id": a.id,
                "description": a.description,
                "context": a.context,
            })).unwrap_or_else(|| json!({})),
            "model": model.map(|m| json!({
                "context": m.context,
                "now": m.now(),
            })).unwrap_or_else(|| json!({})),
            "extra": extra,
        });

        placeholder()
            .replace_all(&self.template, |caps: &Captures| {
                lookup(&scope, &caps[1]).map(render_value).unwrap_or_default()
            })
            .into_owned()
    }

    /// 渲染并发送一次请求
    pub async fn send(
        &self,
        extra: &Value,
        agent: Option<&AgentContext>,
        model: Option<&ModelContext>,
    ) -> Result<String, LlmError> {
        let text = self.render(extra, agent, model);
        tracing::debug!(prompt = %self.name, chars = text.len(), "sending prompt");
        self.llm.complete(&[Message::user(text)]).await
    }
}

impl std::fmt::Debug for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prompt").field("name", &self.name).finish()
    }
}

/// 从模板目录加载 Prompt，所有 Prompt 共用一个传输客户端
pub struct PromptFactory {
    folder: PathBuf,
    llm: Arc<dyn LlmClient>,
}

impl PromptFactory {
    /// 目录不存在时报错
    pub fn new(folder: impl AsRef<Path>, llm: Arc<dyn LlmClient>) -> Result<Self, PromptError> {
        let folder = folder.as_ref().to_path_buf();
        if !folder.is_dir() {
            return Err(PromptError::FolderMissing(folder.display().to_string()));
        }
        Ok(Self { folder, llm })
    }

    /// 按文件名读取模板；文件不存在时报错
    pub fn get_template(&self, name: &str) -> Result<Prompt, PromptError> {
        let path = self.folder.join(name);
        if !path.is_file() {
            return Err(PromptError::TemplateMissing(name.to_string()));
        }
        let template = std::fs::read_to_string(&path)?;
        Ok(Prompt::new(name, template, Arc::clone(&self.llm)))
    }

    /// 直接用字符串构造 Prompt（不经过文件）
    pub fn inline(&self, name: &str, template: &str) -> Prompt {
        Prompt::new(name, template, Arc::clone(&self.llm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_render_placeholders() {
        let llm = Arc::new(MockLlmClient::new());
        let prompt = Prompt::new(
            "vote",
            "You are {{ agent.description }}. Q: {{extra.question}} \
             t={{ model.now }} {{ extra.missing }}!",
            llm,
        );
        let agent = AgentContext::new("a1", "a farmer");
        let model = ModelContext::new(Arc::new(ManualClock::new(3)));
        let text = prompt.render(&json!({"question": "who?"}), Some(&agent), Some(&model));
        assert_eq!(text, "You are a farmer. Q: who? t=3 !");
    }

    #[test]
    fn test_render_non_string_as_json() {
        let prompt = Prompt::new("p", "{{ extra }}", Arc::new(MockLlmClient::new()));
        let text = prompt.render(&json!({"a": 1}), None, None);
        assert_eq!(text, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_send_goes_through_transport() {
        let llm = Arc::new(MockLlmClient::always("ok"));
        let prompt = Prompt::new("p", "hi {{ extra }}", llm.clone());
        let out = prompt.send(&json!("there"), None, None).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(llm.prompts(), vec!["hi there"]);
    }

    #[test]
    fn test_factory_missing_folder_and_template() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new());
        assert!(matches!(
            PromptFactory::new("/definitely/not/here", llm.clone()),
            Err(PromptError::FolderMissing(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reflect.txt"), "{{ extra.long_memory }}").unwrap();
        let factory = PromptFactory::new(dir.path(), llm).unwrap();
        assert!(factory.get_template("reflect.txt").is_ok());
        assert!(matches!(
            factory.get_template("nope.txt"),
            Err(PromptError::TemplateMissing(_))
        ));
    }
}
