//! Event stream for one agent invocation, and the `invoke` entry point.
//!
//! Every event is wrapped in an [`EventEnvelope`] carrying a per-conversation
//! sequence number. A stream always ends with exactly one of `final_answer`,
//! `error` or `cancelled`.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::{FutureExt, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConfigError, RuntimeConfig};
use crate::model::shared::agent_system_prompt;
use crate::model::{ChatMessage, ModelClient, Role};
use crate::runtime::agent::{AgentError, AgentLoop, AgentTurn};
use crate::runtime::lock::WorkspaceLock;
use crate::runtime::workspace::WorkspaceManager;
use crate::tools::cmd::CommandRunner;
use crate::tools::git::GitAdapter;
use crate::tools::{DispatchSettings, ToolCall, ToolDispatcher, ToolResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    PartialAnswer {
        delta: String,
    },
    ToolCallStarted {
        call: ToolCall,
        iteration: usize,
    },
    ToolResult {
        result: ToolResult,
        iteration: usize,
    },
    FinalAnswer {
        text: String,
        iterations: usize,
    },
    Error {
        kind: String,
        message: String,
    },
    Cancelled {
        iterations: usize,
    },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::FinalAnswer { .. } | AgentEvent::Error { .. } | AgentEvent::Cancelled { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub conversation_id: String,
    pub created_at: String,
    #[serde(flatten)]
    pub event: AgentEvent,
}

/// Sending half of an invocation's event stream.
pub struct EventEmitter {
    conversation_id: String,
    seq: AtomicU64,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl EventEmitter {
    pub fn new(conversation_id: impl Into<String>, tx: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            seq: AtomicU64::new(0),
            tx,
        }
    }

    pub fn emit(&self, event: AgentEvent) {
        let envelope = EventEnvelope {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            conversation_id: self.conversation_id.clone(),
            created_at: Utc::now().to_rfc3339(),
            event,
        };
        if self.tx.send(envelope).is_err() {
            tracing::debug!(
                conversation = %self.conversation_id,
                "event stream receiver dropped"
            );
        }
    }
}

/// Receiving half returned by [`AgentRuntime::invoke`].
pub struct AgentStream {
    conversation_id: String,
    rx: mpsc::UnboundedReceiver<EventEnvelope>,
    handle: JoinHandle<AgentTurn>,
}

impl AgentStream {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Wait for the turn to reach a terminal state and return it.
    pub async fn join(self) -> Result<AgentTurn, AgentError> {
        self.handle
            .await
            .map_err(|e| AgentError::Internal(format!("agent task failed: {e}")))
    }
}

impl Stream for AgentStream {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Wires workspaces, the lock, tools and the model into one entry point.
#[derive(Clone)]
pub struct AgentRuntime {
    workspaces: Arc<WorkspaceManager>,
    agent: Arc<AgentLoop>,
}

impl AgentRuntime {
    pub fn new(workspaces: Arc<WorkspaceManager>, agent: Arc<AgentLoop>) -> Self {
        Self { workspaces, agent }
    }

    pub fn from_config(config: &RuntimeConfig, model: Arc<dyn ModelClient>) -> Result<Self, ConfigError> {
        let workspaces = Arc::new(WorkspaceManager::new(config.workspace_dir.clone()));
        let lock = Arc::new(WorkspaceLock::with_lock_files(config.workspace_dir.clone()));
        let runner = CommandRunner::new(
            config.command_policy()?,
            config.container.clone(),
            config.max_output_bytes,
        );
        let git = GitAdapter::new(config.command_timeout(), config.max_output_bytes);
        let dispatcher = Arc::new(ToolDispatcher::new(
            runner,
            git,
            lock,
            DispatchSettings::from_config(config),
        ));
        let agent = Arc::new(AgentLoop::new(model, dispatcher, config.max_iterations));
        Ok(Self::new(workspaces, agent))
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        self.agent.dispatcher()
    }

    /// Start one agent turn in the background and return its event stream.
    ///
    /// The workspace system prompt is prepended unless `history` already
    /// starts with a system message.
    pub fn invoke(
        &self,
        workspace_slug: &str,
        history: Vec<ChatMessage>,
        new_user_message: impl Into<String>,
        cancel: CancellationToken,
    ) -> AgentStream {
        let conversation_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventEmitter::new(conversation_id.clone(), tx);

        let workspaces = Arc::clone(&self.workspaces);
        let agent = Arc::clone(&self.agent);
        let slug = workspace_slug.to_string();
        let user_message = new_user_message.into();
        let id = conversation_id.clone();

        let handle = tokio::spawn(async move {
            let mut messages = Vec::with_capacity(history.len() + 2);
            if history.first().map(|m| m.role) != Some(Role::System) {
                messages.push(ChatMessage::system(agent_system_prompt(&slug)));
            }
            messages.extend(history);
            messages.push(ChatMessage::user(user_message));
            let mut turn = AgentTurn::new(id, messages);

            let workspace = match workspaces.resolve(&slug) {
                Ok(workspace) => workspace,
                Err(error) => {
                    let error = AgentError::from(error);
                    turn.fail(&error);
                    events.emit(AgentEvent::Error {
                        kind: error.kind().to_string(),
                        message: error.to_string(),
                    });
                    return turn;
                }
            };

            let fallback = turn.clone();
            match AssertUnwindSafe(agent.run(&workspace, turn, &events, &cancel))
                .catch_unwind()
                .await
            {
                Ok(turn) => turn,
                Err(_) => {
                    let error = AgentError::Internal("agent loop panicked".to_string());
                    let mut turn = fallback;
                    turn.fail(&error);
                    events.emit(AgentEvent::Error {
                        kind: error.kind().to_string(),
                        message: error.to_string(),
                    });
                    turn
                }
            }
        });

        AgentStream {
            conversation_id,
            rx,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn envelope_flattens_event() {
        let envelope = EventEnvelope {
            seq: 3,
            conversation_id: "c".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            event: AgentEvent::FinalAnswer {
                text: "ok".into(),
                iterations: 2,
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "final_answer");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["iterations"], 2);

        let parsed: EventEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[tokio::test]
    async fn emitter_numbers_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new("c", tx);
        emitter.emit(AgentEvent::PartialAnswer { delta: "a".into() });
        emitter.emit(AgentEvent::Cancelled { iterations: 0 });
        drop(emitter);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.seq, second.seq), (0, 1));
        assert!(!first.event.is_terminal());
        assert!(second.event.is_terminal());
        assert!(rx.recv().await.is_none());
    }
}
