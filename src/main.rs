//! Hive 演示入口
//!
//! 初始化日志与配置，构造传输、共享记忆与若干 agent；每个 tick 用链池并发跑一轮
//! 「思考 → 投票」思维链，把结果写入记忆并反思，最后打印每个 agent 的长期记忆。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use hive::chain::{Chain, ChainPool, ChoiceStep, JsonStep, Step};
use hive::config::{load_config, AppConfig, LlmSection};
use hive::core::{AgentContext, ManualClock, ModelContext};
use hive::llm::{create_embedder_from_config, LlmClient, MockLlmClient, OpenAiClient};
use hive::memory::{Memory, MemoryFactory};
use hive::prompt::{Prompt, PromptFactory};

const THINK_TEMPLATE: &str = "You are {{ agent.description }}. Day {{ model.now }}.\n\
Think about: {{ extra }}\n\
Reply with a JSON object {\"thought\": \"...\"}.";
const VOTE_TEMPLATE: &str = "You are {{ agent.description }}.\n\
Your thought: {{ extra.json.thought }}\n\
Choose A or B. Answer with a single letter.";
const REFLECT_TEMPLATE: &str = "You are {{ agent.description }}.\n\
Previous summary: {{ extra.long_memory }}\n\
New events: {{ extra.short_memory }}\n\
Write an updated summary.";

const TICKS: i64 = 2;

/// openai 后端且配置了 key（配置项优先，其次 OPENAI_API_KEY）时返回 key
fn openai_key(cfg: &LlmSection, env_key: Option<String>) -> Option<String> {
    if cfg.provider != "openai" {
        return None;
    }
    cfg.api_key.clone().or(env_key).filter(|k| !k.is_empty())
}

fn build_llm(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match openai_key(&cfg.llm, std::env::var("OPENAI_API_KEY").ok()) {
        Some(key) => {
            tracing::info!(model = %cfg.llm.model, "using OpenAI-compatible transport");
            let client =
                OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key))
                    .with_timeout(Duration::from_secs(cfg.llm.request_timeout_secs));
            return Arc::new(client);
        }
        None if cfg.llm.provider == "openai" => {
            tracing::warn!("provider is openai but no API key is set, falling back to mock");
        }
        None => {}
    }

    tracing::info!("using mock transport");
    Arc::new(MockLlmClient::with_handler(|prompt| {
        let reply = if prompt.contains("Reply with a JSON") {
            r#"{"thought": "the harvest matters most"}"#.to_string()
        } else if prompt.contains("Choose A or B") {
            "B".to_string()
        } else {
            format!("Summary of {} chars of events", prompt.len())
        };
        Ok(reply)
    }))
}

fn load_prompts(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
) -> anyhow::Result<(Prompt, Prompt, Prompt)> {
    match &cfg.memory.prompts_dir {
        Some(dir) => {
            let factory = PromptFactory::new(dir, llm).context("Failed to open prompts dir")?;
            Ok((
                factory.get_template("think.txt")?,
                factory.get_template("vote.txt")?,
                factory.get_template(&cfg.memory.reflect_template)?,
            ))
        }
        None => Ok((
            Prompt::new("think", THINK_TEMPLATE, Arc::clone(&llm)),
            Prompt::new("vote", VOTE_TEMPLATE, Arc::clone(&llm)),
            Prompt::new("reflect", REFLECT_TEMPLATE, llm),
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let llm = build_llm(&cfg);
    let (think, vote, reflect) = load_prompts(&cfg, Arc::clone(&llm))?;
    let steps: Vec<Arc<dyn Step>> = vec![
        Arc::new(JsonStep::new("think", Arc::new(think))),
        Arc::new(ChoiceStep::new("vote", Arc::new(vote))),
    ];

    let clock = Arc::new(ManualClock::new(0));
    let model = Arc::new(
        ModelContext::new(clock.clone()).with_context(json!({"scenario": "village election"})),
    );
    let embedder = create_embedder_from_config(
        cfg.llm.base_url.as_deref(),
        cfg.llm.embedding_model.as_deref(),
        cfg.llm.api_key.as_deref(),
    );
    let factory = Arc::new(
        MemoryFactory::from_config(&cfg.memory, embedder, Arc::new(reflect), Arc::clone(&model))
            .await
            .context("Failed to build memory factory")?,
    );

    let agents: Vec<Arc<AgentContext>> = ["farmer", "merchant", "blacksmith"]
        .iter()
        .enumerate()
        .map(|(i, role)| Arc::new(AgentContext::new(format!("agent_{i}"), format!("a {role}"))))
        .collect();
    let mut memories: Vec<Memory> = agents
        .iter()
        .map(|agent| factory.create_memory(Arc::clone(agent)))
        .collect();

    for _ in 0..TICKS {
        let now = clock.advance();

        let mut pool = ChainPool::from_config(&cfg.pool);
        let mut chains = Vec::with_capacity(agents.len());
        for agent in &agents {
            let mut chain = Chain::new(Arc::clone(agent), Arc::clone(&model), steps.clone())
                .with_max_attempts(cfg.chain.max_attempts);
            chain.set_input(json!(format!("Who should lead the village on day {now}?")))?;
            chains.push(chain);
        }
        pool.enqueue(chains);

        for outcome in pool.start().await? {
            let agent_id = outcome.chain.agent().id.clone();
            let content = match &outcome.result {
                Ok(()) => format!("voted {}", outcome.chain.get_output()?["choice"]),
                Err(e) => format!("could not decide: {e}"),
            };
            if let Some(memory) = memories.iter().find(|m| m.agent().id == agent_id) {
                memory
                    .add_short_memory(&agent_id, "village", "vote", &content, None)
                    .await?;
            }
        }

        for memory in memories.iter_mut() {
            let reflection = memory.reflect_memory().await?;
            tracing::info!(
                agent = %memory.agent().id,
                tick = now,
                checkpoint = reflection.checkpoint,
                "reflected"
            );
        }
    }

    let (prompt_tokens, completion_tokens, total_tokens) = llm.token_usage();
    tracing::info!(prompt_tokens, completion_tokens, total_tokens, "token usage");

    for memory in &memories {
        println!(
            "{} (checkpoint {}): {}",
            memory.agent().id,
            memory.last_checkpoint(),
            memory.get_long_memory().unwrap_or("(none)")
        );
    }
    Ok(())
}
