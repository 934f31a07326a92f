//! Agent control loop.
//!
//! A turn is an explicit state machine: it starts `Running` and moves exactly
//! once to `Finished`, `Failed` or `Cancelled`. Each iteration asks the model
//! for either a final answer or one tool call; tool calls are dispatched one
//! at a time and their results appended to the conversation in issue order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{ChatMessage, ModelClient, ModelError, ModelReply, StreamDelta};
use crate::runtime::events::{AgentEvent, EventEmitter};
use crate::runtime::workspace::{Workspace, WorkspaceError};
use crate::tools::{ToolDispatcher, ToolResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TurnStatus::Running)
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(#[from] ModelError),
    #[error("iteration limit of {limit} exceeded")]
    IterationLimitExceeded { limit: usize },
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Stable identifier used in `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Provider(_) => "provider_error",
            AgentError::IterationLimitExceeded { .. } => "iteration_limit_exceeded",
            AgentError::Workspace(_) => "workspace_error",
            AgentError::Internal(_) => "internal",
        }
    }
}

/// One conversation turn as driven by [`AgentLoop`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTurn {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
    /// Number of tool calls executed so far.
    pub iteration: usize,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentTurn {
    pub fn new(conversation_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages,
            iteration: 0,
            status: TurnStatus::Running,
            answer: None,
            error_kind: None,
            error: None,
        }
    }

    /// Holder id used for the workspace lock.
    pub fn holder_id(&self) -> String {
        format!("agent:{}", self.conversation_id)
    }

    fn finish(&mut self, answer: String) -> bool {
        if !self.transition(TurnStatus::Finished) {
            return false;
        }
        self.messages.push(ChatMessage::assistant(answer.clone()));
        self.answer = Some(answer);
        true
    }

    pub(crate) fn fail(&mut self, error: &AgentError) -> bool {
        if !self.transition(TurnStatus::Failed) {
            return false;
        }
        self.error_kind = Some(error.kind().to_string());
        self.error = Some(error.to_string());
        true
    }

    fn cancel(&mut self) -> bool {
        self.transition(TurnStatus::Cancelled)
    }

    fn transition(&mut self, next: TurnStatus) -> bool {
        if self.status.is_terminal() {
            tracing::warn!(
                conversation = %self.conversation_id,
                from = ?self.status,
                to = ?next,
                "ignoring transition out of terminal state"
            );
            return false;
        }
        self.status = next;
        true
    }
}

// ---------------------------------------------------------------------------
// AgentLoop
// ---------------------------------------------------------------------------

pub struct AgentLoop {
    model: Arc<dyn ModelClient>,
    dispatcher: Arc<ToolDispatcher>,
    max_iterations: usize,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        dispatcher: Arc<ToolDispatcher>,
        max_iterations: usize,
    ) -> Self {
        Self {
            model,
            dispatcher,
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Drive `turn` to a terminal state, emitting exactly one terminal event.
    ///
    /// Cancellation is observed before each model call, while waiting on the
    /// model and while a tool call waits for the workspace lock. A tool whose
    /// handler has started always runs to completion (bounded by its own
    /// timeout) and its result is recorded before the loop looks at the token
    /// again. A tool result reporting an unusable workspace ends the turn as
    /// failed.
    pub async fn run(
        &self,
        workspace: &Workspace,
        mut turn: AgentTurn,
        events: &EventEmitter,
        cancel: &CancellationToken,
    ) -> AgentTurn {
        let tools = self.dispatcher.descriptors();
        let holder_id = turn.holder_id();

        tracing::info!(
            conversation = %turn.conversation_id,
            slug = %workspace.slug,
            model = %self.model.model_id(),
            "agent turn started"
        );

        while !turn.status.is_terminal() {
            if cancel.is_cancelled() {
                self.cancelled(&mut turn, events);
                break;
            }
            if turn.iteration >= self.max_iterations {
                let error = AgentError::IterationLimitExceeded {
                    limit: self.max_iterations,
                };
                self.failed(&mut turn, events, error);
                break;
            }

            let mut on_delta = |delta: StreamDelta| -> Result<(), String> {
                if let StreamDelta::Content(delta) = delta {
                    events.emit(AgentEvent::PartialAnswer { delta });
                }
                Ok(())
            };

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                reply = self.model.complete(&turn.messages, &tools, &mut on_delta) => Some(reply),
            };

            match reply {
                None => self.cancelled(&mut turn, events),
                Some(Err(error)) => self.failed(&mut turn, events, AgentError::Provider(error)),
                Some(Ok(ModelReply::Text(text))) => {
                    if turn.finish(text.clone()) {
                        tracing::info!(
                            conversation = %turn.conversation_id,
                            iterations = turn.iteration,
                            "agent turn finished"
                        );
                        events.emit(AgentEvent::FinalAnswer {
                            text,
                            iterations: turn.iteration,
                        });
                    }
                }
                Some(Ok(ModelReply::ToolCall(call))) => {
                    let iteration = turn.iteration + 1;
                    events.emit(AgentEvent::ToolCallStarted {
                        call: call.clone(),
                        iteration,
                    });

                    let result = self
                        .dispatcher
                        .dispatch_with_cancel(workspace, &holder_id, &call, Some(cancel))
                        .await;
                    let fatal = result
                        .error_kind
                        .filter(|kind| kind.is_fatal())
                        .map(|_| tool_error_message(&result));

                    turn.messages.push(ChatMessage::assistant_tool_call(call));
                    turn.messages
                        .push(ChatMessage::tool(result.id.clone(), result.to_model_content()));
                    turn.iteration = iteration;
                    events.emit(AgentEvent::ToolResult { result, iteration });

                    if let Some(reason) = fatal {
                        let error = WorkspaceError::Unavailable {
                            slug: workspace.slug.clone(),
                            reason,
                        };
                        self.failed(&mut turn, events, AgentError::Workspace(error));
                    }
                }
            }
        }
        turn
    }

    fn cancelled(&self, turn: &mut AgentTurn, events: &EventEmitter) {
        if turn.cancel() {
            tracing::info!(
                conversation = %turn.conversation_id,
                iterations = turn.iteration,
                "agent turn cancelled"
            );
            events.emit(AgentEvent::Cancelled {
                iterations: turn.iteration,
            });
        }
    }

    fn failed(&self, turn: &mut AgentTurn, events: &EventEmitter, error: AgentError) {
        if turn.fail(&error) {
            tracing::warn!(
                conversation = %turn.conversation_id,
                kind = error.kind(),
                "agent turn failed: {error}"
            );
            events.emit(AgentEvent::Error {
                kind: error.kind().to_string(),
                message: error.to_string(),
            });
        }
    }
}

fn tool_error_message(result: &ToolResult) -> String {
    result.output["error"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| result.output.to_string())
}
