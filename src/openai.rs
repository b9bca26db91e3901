//! Chat-completions client for OpenAI-compatible endpoints (OpenAI itself,
//! OpenRouter, local gateways).

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::llm::{extract_json, JsonCompletion, LlmClient, TextCompletion, Usage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const JSON_SYSTEM_PROMPT: &str = "Ты эксперт по технической документации. Твоя задача - заполнить JSON шаблон данными из технического задания. Отвечай только валидным JSON без дополнительных комментариев.";
const TEXT_SYSTEM_PROMPT: &str = "Ты эксперт по технической документации. Отвечай строго в формате, указанном в запросе.";

/// Rough chars-per-token ratio used only for the oversized prompt warning.
const CHARS_PER_TOKEN: usize = 4;
const LARGE_PROMPT_TOKENS: usize = 100_000;

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Validation("LLM_API_KEY is not set".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Provider(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn send_once(&self, system: &str, prompt: &str) -> std::result::Result<Reply, Failure> {
        let prompt_chars = prompt.chars().count();
        let estimated_tokens = prompt_chars / CHARS_PER_TOKEN;
        if estimated_tokens > LARGE_PROMPT_TOKENS {
            warn!("Very large prompt (~{} tokens), the provider may reject it", estimated_tokens);
        }

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![Message::system(system), Message::user(prompt)],
        };

        info!("Sending request: model={}, prompt={} chars", self.model, prompt_chars);
        let started = Instant::now();

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Failure::Fatal(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("API error ({}): {}", status, body);
            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                Failure::RateLimited(message)
            } else {
                Failure::Fatal(message)
            });
        }

        let response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Failure::Fatal(format!("Failed to parse response: {}", e)))?;

        let usage = response.usage.unwrap_or_default();
        info!(
            "Response in {:.2}s: {} tokens (prompt: {}, completion: {})",
            started.elapsed().as_secs_f64(),
            usage.total_tokens,
            usage.prompt_tokens,
            usage.completion_tokens
        );

        let choice = response.choices.into_iter().next();
        let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
        let content = choice.and_then(|c| c.message.content).unwrap_or_default();

        if content.trim().is_empty() {
            let reason = match finish_reason.as_deref() {
                Some("length") => "the answer hit the token limit".to_string(),
                Some(other) => format!("finish_reason={}", other),
                None => "no choices returned".to_string(),
            };
            return Err(Failure::Fatal(format!("Empty answer from model: {}", reason)));
        }

        debug!("Answer size: {} chars", content.chars().count());
        Ok(Reply { content, usage })
    }

    /// Send with the rate-limit retry policy: only HTTP 429 is retried,
    /// waiting (attempt + 1) * 2 seconds.
    async fn send_with_retry(&self, system: &str, prompt: &str) -> Result<Reply> {
        let mut attempt = 0;
        loop {
            match self.send_once(system, prompt).await {
                Ok(reply) => return Ok(reply),
                Err(Failure::RateLimited(message)) if attempt < self.max_retries => {
                    let wait = retry_delay(attempt);
                    warn!("{}; retrying in {}s", message, wait.as_secs());
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(Failure::RateLimited(message)) | Err(Failure::Fatal(message)) => {
                    return Err(Error::Provider(message));
                }
            }
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt + 1) * 2)
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    /// Rate limits and answers without a JSON object share one attempt budget.
    async fn complete_json(&self, prompt: &str) -> Result<JsonCompletion> {
        let mut attempt = 0;
        loop {
            match self.send_once(JSON_SYSTEM_PROMPT, prompt).await {
                Ok(reply) => {
                    if let Some(json) = extract_json(&reply.content) {
                        return Ok(JsonCompletion {
                            json,
                            usage: reply.usage,
                        });
                    }
                    if attempt >= self.max_retries {
                        return Err(Error::Provider(format!(
                            "No valid JSON object in model answer after {} attempts",
                            attempt + 1
                        )));
                    }
                    warn!("No JSON object in answer (attempt {}), asking again", attempt + 1);
                }
                Err(Failure::RateLimited(message)) if attempt < self.max_retries => {
                    let wait = retry_delay(attempt);
                    warn!("{}; retrying in {}s", message, wait.as_secs());
                    tokio::time::sleep(wait).await;
                }
                Err(Failure::RateLimited(message)) | Err(Failure::Fatal(message)) => {
                    return Err(Error::Provider(message));
                }
            }
            attempt += 1;
        }
    }

    async fn complete_text(&self, prompt: &str) -> Result<TextCompletion> {
        let reply = self.send_with_retry(TEXT_SYSTEM_PROMPT, prompt).await?;
        Ok(TextCompletion {
            text: reply.content,
            usage: reply.usage,
        })
    }
}

struct Reply {
    content: String,
    usage: Usage,
}

enum Failure {
    RateLimited(String),
    Fatal(String),
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
}

impl<'a> Message<'a> {
    fn system(content: &'a str) -> Self {
        Self {
            role: Role::System,
            content,
        }
    }

    fn user(content: &'a str) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}
