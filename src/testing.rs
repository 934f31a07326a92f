//! Scripted model client for driving the agent loop without a provider.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::tool::ToolDescriptor;
use crate::model::traits::DeltaSink;
use crate::model::{ChatMessage, ModelClient, ModelError, ModelReply, StreamDelta};
use crate::tools::ToolCall;

/// Replays a fixed list of replies, one per `complete` call.
///
/// Text replies are also streamed through the delta callback. Once the script
/// runs out the model either repeats its configured tool call forever or
/// reports an invalid response.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
    repeat: Option<(String, serde_json::Value)>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = ModelReply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    /// A model that requests the same tool on every call.
    pub fn repeating_tool(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            repeat: Some((name.to_string(), arguments)),
            ..Self::default()
        }
    }

    pub fn failing(error: ModelError) -> Self {
        Self {
            script: Mutex::new(VecDeque::from([Err(error)])),
            ..Self::default()
        }
    }

    /// Sleep this long inside every `complete` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn then(self, reply: Result<ModelReply, ModelError>) -> Self {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .push_back(reply);
        self
    }

    /// Number of `complete` calls that started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message lists seen by each call, in order.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().expect("requests mutex poisoned").clone()
    }
}

/// Tool-call reply with a fixed id.
pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ModelReply {
    ModelReply::ToolCall(ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    })
}

pub fn text(answer: &str) -> ModelReply {
    ModelReply::Text(answer.to_string())
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_id(&self) -> String {
        "scripted".to_string()
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDescriptor],
        on_delta: DeltaSink<'_>,
    ) -> Result<ModelReply, ModelError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .expect("requests mutex poisoned")
            .push(messages.to_vec());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().expect("script mutex poisoned").pop_front();
        let reply = match (next, &self.repeat) {
            (Some(reply), _) => reply?,
            (None, Some((name, arguments))) => tool_call(&format!("call_{n}"), name, arguments.clone()),
            (None, None) => {
                return Err(ModelError::InvalidResponse("script exhausted".to_string()));
            }
        };

        if let ModelReply::Text(answer) = &reply {
            on_delta(StreamDelta::Content(answer.clone())).map_err(ModelError::Request)?;
        }
        Ok(reply)
    }
}
