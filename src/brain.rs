use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

use crate::config::ModelConfig;
use crate::error::AgentError;
use crate::types::ChatMessage;

/// The reasoning step: a list of messages in, raw reply text out.
///
/// Implementations report transport trouble as [`AgentError::Network`] or
/// [`AgentError::Timeout`] (retried by the orchestrator) and everything else
/// as [`AgentError::Model`].
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, AgentError>;
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(config: &ModelConfig) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AgentError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ReasoningModel for OpenAiClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, AgentError> {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": temperature,
                "max_tokens": max_tokens,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(transport_error)?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("unknown API error");
            tracing::warn!(%status, message, "model API error");
            let text = format!("API error ({status}): {message}");
            return Err(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                AgentError::Network(text)
            } else {
                AgentError::Model(text)
            });
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::Model(format!("no content in model response: {body}")))?;

        tracing::debug!(model = %self.model, chars = content.len(), "model replied");
        Ok(content.to_string())
    }
}

fn transport_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout(format!("model request: {e}"))
    } else if e.is_decode() {
        AgentError::Model(format!("unreadable model response: {e}"))
    } else {
        AgentError::Network(e.to_string())
    }
}

/// System prompt for one task.
pub fn system_prompt(task: &str) -> String {
    format!(
        r#"You are an autonomous web browser agent. You control a real browser one step at a time.

Your task is:
{task}

Each turn you receive an observation of the current page: its URL, its title and a numbered list of interactive elements like `[12] BUTTON "Search"`.

Available tools:
- navigate(url): open a URL
- click_element(element_id): click an element
- type_text(element_id, text, press_enter=false): replace the element's value with text, optionally pressing Enter
- select_option(element_id, value): choose an option in a dropdown
- scroll_page(direction): "up" or "down"
- take_screenshot(): save a screenshot of the page
- wait(seconds): let the page settle (0.5 to 30 seconds)
- go_back(): return to the previous page
- query_dom(query): search the current observation for keywords
- store_context(key, value) or store_context(field1=value1, field2=value2, ...): remember data for the final report
- done(summary): finish the task and report what was achieved

Rules:
1. Element ids are ONLY valid for the CURRENT observation. They change after every step.
2. If a step fails with "Invalid element id", use the ids from the newest observation.
3. Do not repeat a failed action on the same element. Try a different approach.
4. Call done as soon as the task is accomplished, or when it clearly cannot be.

Output ONLY one JSON object. No markdown, no explanation outside the JSON.
Format: {{"thought": "<short reasoning>", "tool": "<tool_name>", "args": {{<parameters>}}}}
Example: {{"thought": "The search box is element 3", "tool": "type_text", "args": {{"element_id": 3, "text": "rust async", "press_enter": true}}}}"#
    )
}
