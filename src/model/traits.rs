//! Traits for model clients.

use async_trait::async_trait;

use crate::core::tool::ToolDescriptor;
use crate::model::types::{ChatMessage, ModelError, ModelReply, StreamDelta};

/// Callback for streamed text. Returning an error aborts the request.
pub type DeltaSink<'a> = &'a mut (dyn FnMut(StreamDelta) -> Result<(), String> + Send);

/// Core trait for agent model clients.
///
/// `complete` is the only suspension point of the agent loop that talks to a
/// provider. Failures surface as [`ModelError`] and are never retried here.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model_id(&self) -> String;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
        on_delta: DeltaSink<'_>,
    ) -> Result<ModelReply, ModelError>;
}
