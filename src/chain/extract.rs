//! 响应抽取策略
//!
//! 生成式输出是半结构化的，抽取只能尽力而为：每种步骤变体对应一个 Extractor，
//! 返回 (输出键, 抽取值)，抽不到时报 ExtractionFailure，由链内重试兜底。

use regex::Regex;
use serde_json::Value;

use crate::core::ChainError;

/// 抽取策略
pub trait Extractor: Send + Sync {
    /// 输出对象中存放抽取结果的键（如 choice / score / json）
    fn key(&self) -> &'static str;

    fn extract(&self, response: &str) -> Result<Value, ChainError>;
}

/// 不做抽取：原样返回响应
#[derive(Debug, Clone, Default)]
pub struct PlainExtractor;

impl Extractor for PlainExtractor {
    fn key(&self) -> &'static str {
        "last_response"
    }

    fn extract(&self, response: &str) -> Result<Value, ChainError> {
        Ok(Value::String(response.to_string()))
    }
}

/// 选项抽取：默认匹配独立的大写字母（"The answer is B." 取 B 而非 T）。
/// 默认模式下跳过代词 "I"，除非它是唯一的候选（"I choose C." 取 C）
#[derive(Debug, Clone)]
pub struct ChoiceExtractor {
    pattern: Regex,
    skip_pronoun: bool,
}

impl ChoiceExtractor {
    /// 自定义模式：取第一个匹配
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            skip_pronoun: false,
        }
    }
}

impl Default for ChoiceExtractor {
    fn default() -> Self {
        Self {
            pattern: Regex::new(r"\b[A-Z]\b").expect("choice pattern is valid"),
            skip_pronoun: true,
        }
    }
}

impl Extractor for ChoiceExtractor {
    fn key(&self) -> &'static str {
        "choice"
    }

    fn extract(&self, response: &str) -> Result<Value, ChainError> {
        let mut candidates = self.pattern.find_iter(response).map(|m| m.as_str());
        let first = candidates
            .next()
            .ok_or_else(|| ChainError::ExtractionFailure("No choice found".to_string()))?;
        let choice = if self.skip_pronoun && first == "I" {
            candidates.find(|c| *c != "I").unwrap_or(first)
        } else {
            first
        };
        Ok(Value::String(choice.to_string()))
    }
}

/// 分数抽取：第一个（可带符号、可带小数的）数字
#[derive(Debug, Clone)]
pub struct ScoreExtractor {
    pattern: Regex,
}

impl ScoreExtractor {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }
}

impl Default for ScoreExtractor {
    fn default() -> Self {
        Self::new(Regex::new(r"-?\d+(\.\d+)?").expect("score pattern is valid"))
    }
}

impl Extractor for ScoreExtractor {
    fn key(&self) -> &'static str {
        "score"
    }

    fn extract(&self, response: &str) -> Result<Value, ChainError> {
        let found = self
            .pattern
            .find(response)
            .ok_or_else(|| ChainError::ExtractionFailure("No score found".to_string()))?;
        let score: f64 = found.as_str().parse().map_err(|e| {
            ChainError::ExtractionFailure(format!("Bad score `{}`: {e}", found.as_str()))
        })?;
        serde_json::Number::from_f64(score)
            .map(Value::Number)
            .ok_or_else(|| ChainError::ExtractionFailure(format!("Non-finite score {score}")))
    }
}

/// JSON 抽取：从左到右第一个括号平衡且能解析的 `{...}` 对象。
/// 落单的 `{`（如 "Thinking {about it... {\"a\": 1}"）会被跳过
#[derive(Debug, Clone, Default)]
pub struct JsonExtractor;

impl Extractor for JsonExtractor {
    fn key(&self) -> &'static str {
        "json"
    }

    fn extract(&self, response: &str) -> Result<Value, ChainError> {
        let mut last_err = None;
        for (start, _) in response.match_indices('{') {
            let Some(raw) = balanced_object_at(response, start) else {
                continue;
            };
            match serde_json::from_str(raw) {
                Ok(value) => return Ok(value),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => ChainError::ExtractionFailure(format!("Malformed Json: {e}")),
            None => ChainError::ExtractionFailure("No Json found".to_string()),
        })
    }
}

/// 从 start 处的 `{` 起找到与之配对的 `}`；忽略字符串字面量中的括号
fn balanced_object_at(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
