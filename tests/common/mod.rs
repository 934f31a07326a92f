//! Common utilities for runtime integration tests.

use httpmock::prelude::*;
use pdd_runtime::config::{ProviderConfig, RuntimeConfig};

/// Wrap JSON chunks as an OpenAI-style SSE body terminated by `[DONE]`.
pub fn sse_body(chunks: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Register a chat-completions endpoint that always streams `body`.
pub async fn mock_completions(server: &MockServer, body: String) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        })
        .await
}

pub fn provider(server: &MockServer) -> ProviderConfig {
    ProviderConfig {
        api_key: "integration-key".to_string(),
        model: "mock-model".to_string(),
        base_url: server.base_url(),
    }
}

pub fn config(base: &std::path::Path) -> RuntimeConfig {
    RuntimeConfig {
        workspace_dir: base.to_path_buf(),
        command_timeout_secs: 20,
        lock_wait_secs: 10,
        ..RuntimeConfig::default()
    }
}
