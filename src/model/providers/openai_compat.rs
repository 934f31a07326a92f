use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::core::tool::ToolDescriptor;
use crate::model::shared::clean_answer;
use crate::model::traits::DeltaSink;
use crate::model::{ChatMessage, ModelClient, ModelError, ModelReply, Role, StreamDelta};
use crate::tools::types::ToolCall;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Chat-completions client for any OpenAI-compatible endpoint (Groq, OpenAI,
/// vLLM, Ollama, ...), using streamed responses and native tool calling.
pub struct OpenAiCompatClient {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ModelError> {
        Self::with_timeout(config, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(config: &ProviderConfig, timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Request(e.to_string()))?;
        Ok(Self {
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            max_tokens: DEFAULT_MAX_TOKENS,
            client,
        })
    }

    fn build_request(&self, messages: &[ChatMessage], tools: &[ToolDescriptor]) -> OpenAiChatRequest {
        let openai_tools: Option<Vec<OpenAiTool>> = if tools.is_empty() {
            None
        } else {
            Some(
                tools
                    .iter()
                    .map(|d| OpenAiTool {
                        type_: "function".to_string(),
                        function: OpenAiFunction {
                            name: d.name.clone(),
                            description: d.description.clone(),
                            parameters: d.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };
        let has_tools = openai_tools.is_some();

        OpenAiChatRequest {
            model: self.model.clone(),
            messages: messages.iter().map(OpenAiRequestMessage::from).collect(),
            temperature: 0.1,
            max_tokens: self.max_tokens,
            stream: true,
            tools: openai_tools,
            tool_choice: has_tools.then(|| "auto".to_string()),
            // One tool per iteration.
            parallel_tool_calls: has_tools.then_some(false),
        }
    }

    async fn run_chat_streaming(
        &self,
        body: &OpenAiChatRequest,
        on_delta: DeltaSink<'_>,
    ) -> Result<StreamedMessage, ModelError> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        let status = response.status();
        tracing::debug!(model = %self.model, %status, "chat completion response");

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ModelError::Auth(format!(
                "provider auth failed ({status}). Check API key and account access."
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::Request(format!("provider error {status}: {text}")));
        }

        let mut message = StreamedMessage::default();
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut done = false;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| ModelError::Request(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline_idx) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline_idx).collect();
                if message.process_line(line.trim_end_matches(['\n', '\r']), on_delta)? {
                    done = true;
                    break;
                }
            }
            if done {
                break;
            }
        }

        if !done && !buffer.trim().is_empty() {
            message.process_line(buffer.trim_end_matches('\r'), on_delta)?;
        }
        Ok(message)
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
        on_delta: DeltaSink<'_>,
    ) -> Result<ModelReply, ModelError> {
        let body = self.build_request(messages, tools);
        let message = self.run_chat_streaming(&body, on_delta).await?;
        message.into_reply()
    }
}

/// Accumulated state of one streamed assistant message.
#[derive(Debug, Default)]
struct StreamedMessage {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCallAccumulator>,
    saw_content_delta: bool,
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    function_name: String,
    arguments: String,
}

impl StreamedMessage {
    /// Feed one SSE line. Returns true on the `[DONE]` sentinel.
    fn process_line(&mut self, line: &str, on_delta: DeltaSink<'_>) -> Result<bool, ModelError> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') || trimmed.starts_with("event:") {
            return Ok(false);
        }
        let payload = trimmed
            .strip_prefix("data:")
            .map(str::trim)
            .unwrap_or(trimmed);
        if payload == "[DONE]" {
            return Ok(true);
        }

        let chunk: OpenAiStreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(error) => {
                tracing::debug!("skipping unparseable stream line: {error}");
                return Ok(false);
            }
        };
        if let Some(error) = chunk.error {
            return Err(ModelError::Request(error.message));
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    self.saw_content_delta = true;
                    self.content.push_str(&text);
                    on_delta(StreamDelta::Content(text)).map_err(ModelError::Request)?;
                }
                if let Some(text) = delta.reasoning_content.filter(|t| !t.is_empty()) {
                    self.reasoning.push_str(&text);
                    on_delta(StreamDelta::Reasoning(text)).map_err(ModelError::Request)?;
                }
                for call in delta.tool_calls.unwrap_or_default() {
                    let idx = call.index.unwrap_or(0);
                    if self.tool_calls.len() <= idx {
                        self.tool_calls
                            .resize_with(idx + 1, ToolCallAccumulator::default);
                    }
                    let entry = &mut self.tool_calls[idx];
                    if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                        entry.id = id;
                    }
                    if let Some(function) = call.function {
                        if let Some(name) = function.name {
                            entry.function_name.push_str(&name);
                        }
                        if let Some(arguments) = function.arguments {
                            entry.arguments.push_str(&arguments);
                        }
                    }
                }
            }

            // Some servers ignore `stream` and send one complete message.
            if let Some(message) = choice.message {
                if !self.saw_content_delta {
                    if let Some(text) = message.content.filter(|t| !t.is_empty()) {
                        self.content.push_str(&text);
                        on_delta(StreamDelta::Content(text)).map_err(ModelError::Request)?;
                    }
                }
                for call in message.tool_calls.unwrap_or_default() {
                    self.tool_calls.push(ToolCallAccumulator {
                        id: call.id.unwrap_or_default(),
                        function_name: call.function.name,
                        arguments: call.function.arguments,
                    });
                }
            }
        }
        Ok(false)
    }

    fn into_reply(self) -> Result<ModelReply, ModelError> {
        let mut calls = self
            .tool_calls
            .into_iter()
            .filter(|call| !call.function_name.trim().is_empty());

        if let Some(first) = calls.next() {
            let ignored = calls.count();
            if ignored > 0 {
                tracing::debug!(ignored, "model requested several tools; keeping the first");
            }
            let arguments = if first.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                // Unparseable arguments are passed through as a string so the
                // dispatcher reports them back to the model as invalid.
                serde_json::from_str(&first.arguments)
                    .unwrap_or(serde_json::Value::String(first.arguments))
            };
            let id = if first.id.is_empty() {
                format!("call_{}", Uuid::new_v4().simple())
            } else {
                first.id
            };
            return Ok(ModelReply::ToolCall(ToolCall {
                id,
                name: first.function_name.trim().to_string(),
                arguments,
            }));
        }

        let raw = if self.content.trim().is_empty() {
            self.reasoning
        } else {
            self.content
        };
        let text = clean_answer(&raw);
        if text.is_empty() {
            return Err(ModelError::InvalidResponse(
                "model returned neither text nor a tool call".to_string(),
            ));
        }
        Ok(ModelReply::Text(text))
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiRequestMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    type_: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OpenAiRequestMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for OpenAiRequestMessage {
    fn from(message: &ChatMessage) -> Self {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let tool_calls = message.tool_call.as_ref().map(|call| {
            vec![OpenAiToolCall {
                id: Some(call.id.clone()),
                tool_type: "function".to_string(),
                function: OpenAiFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                },
            }]
        });
        // Assistant tool-call messages carry `null` content.
        let content = if tool_calls.is_some() && message.content.is_empty() {
            None
        } else {
            Some(message.content.clone())
        };
        Self {
            role,
            content,
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    error: Option<OpenAiStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: Option<OpenAiStreamDelta>,
    #[serde(default)]
    message: Option<OpenAiResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionCallDelta>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiFunctionCallDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    tool_type: String,
    function: OpenAiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}
