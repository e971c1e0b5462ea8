//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__POOL__WORKERS=4`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub chain: ChainSection,
    pub pool: PoolSection,
    pub memory: MemorySection,
}

/// [llm] 段：传输后端与嵌入模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：mock / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    /// 嵌入模型；未设置时记忆检索使用关键词相似度
    pub embedding_model: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
            embedding_model: None,
        }
    }
}

/// [chain] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainSection {
    /// 每个步骤的最大尝试次数
    pub max_attempts: usize,
}

impl Default for ChainSection {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// [pool] 段：并发 worker 数与条目间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub workers: usize,
    pub inter_item_delay_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: 8,
            inter_item_delay_ms: 5000,
        }
    }
}

/// [memory] 段：检索条数、快照路径、Prompt 模板目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub top_k: usize,
    /// 向量库 JSON 快照；未设置时只存在于内存
    pub persist_path: Option<PathBuf>,
    pub prompts_dir: Option<PathBuf>,
    /// prompts_dir 中的反思模板文件名
    pub reflect_template: String,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            top_k: 5,
            persist_path: None,
            prompts_dir: None,
            reflect_template: "reflect.txt".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
