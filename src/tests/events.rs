//! Agent loop scenarios observed through the `invoke` event stream.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::model::{ChatMessage, ModelError, Role};
    use crate::runtime::{AgentEvent, AgentLoop, AgentRuntime, EventEnvelope, TurnStatus};
    use crate::testing::{text, tool_call, ScriptedModel};
    use crate::tests::{event_types, resolve, runtime, runtime_with, test_config};
    use crate::tools::ToolErrorKind;

    async fn drain(stream: &mut crate::runtime::AgentStream) -> Vec<EventEnvelope> {
        stream.by_ref().collect().await
    }

    #[tokio::test]
    async fn text_answer_streams_then_finishes() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new([text("Nothing to do.")]));
        let runtime = runtime(base.path(), model.clone());

        let mut stream = runtime.invoke("demo", Vec::new(), "hello", CancellationToken::new());
        let events = drain(&mut stream).await;
        let turn = stream.join().await.unwrap();

        assert_eq!(event_types(&events), vec!["partial_answer", "final_answer"]);
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(events.iter().all(|e| e.conversation_id == turn.conversation_id));
        assert_eq!(turn.status, TurnStatus::Finished);
        assert_eq!(turn.answer.as_deref(), Some("Nothing to do."));

        let request = &model.requests()[0];
        assert_eq!(request[0].role, Role::System);
        assert!(request[0].content.contains("`demo`"));
        assert_eq!(request.last().unwrap(), &ChatMessage::user("hello"));
    }

    #[tokio::test]
    async fn existing_system_prompt_is_kept() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new([text("ok")]));
        let runtime = runtime(base.path(), model.clone());
        let history = vec![
            ChatMessage::system("custom rules"),
            ChatMessage::user("earlier"),
            ChatMessage::assistant("earlier answer"),
        ];

        let stream = runtime.invoke("demo", history, "next", CancellationToken::new());
        stream.join().await.unwrap();

        let request = &model.requests()[0];
        let systems = request.iter().filter(|m| m.role == Role::System).count();
        assert_eq!(systems, 1);
        assert_eq!(request[0].content, "custom rules");
        assert_eq!(request.len(), 4);
    }

    #[tokio::test]
    async fn tool_results_arrive_in_issue_order() {
        let base = tempfile::tempdir().unwrap();
        let script: Vec<_> = (0..4)
            .map(|i| {
                tool_call(
                    &format!("w{i}"),
                    "write_file",
                    json!({ "path": format!("f{i}.txt"), "content": format!("{i}\n") }),
                )
            })
            .chain([text("wrote four files")])
            .collect();
        let model = Arc::new(ScriptedModel::new(script));
        let runtime = runtime(base.path(), model.clone());

        let mut stream = runtime.invoke("demo", Vec::new(), "write", CancellationToken::new());
        let events = drain(&mut stream).await;
        let turn = stream.join().await.unwrap();

        let mut expected = Vec::new();
        for _ in 0..4 {
            expected.push("tool_call_started");
            expected.push("tool_result");
        }
        expected.extend(["partial_answer", "final_answer"]);
        assert_eq!(event_types(&events), expected);

        let results: Vec<(String, usize)> = events
            .iter()
            .filter_map(|e| match &e.event {
                AgentEvent::ToolResult { result, iteration } => {
                    assert!(result.ok, "{result:?}");
                    Some((result.id.clone(), *iteration))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            results,
            vec![
                ("w0".to_string(), 1),
                ("w1".to_string(), 2),
                ("w2".to_string(), 3),
                ("w3".to_string(), 4)
            ]
        );
        assert_eq!(turn.iteration, 4);

        // Each tool message answers the call right before it.
        let tool_ids: Vec<_> = turn
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        assert_eq!(tool_ids, vec!["w0", "w1", "w2", "w3"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_conversations_each_see_their_own_order() {
        let base = tempfile::tempdir().unwrap();
        let script = |prefix: &str| {
            let calls: Vec<_> = (0..3)
                .map(|i| {
                    tool_call(
                        &format!("{prefix}{i}"),
                        "write_file",
                        json!({ "path": format!("{prefix}/{i}.txt"), "content": "x" }),
                    )
                })
                .chain([text("done")])
                .collect();
            Arc::new(ScriptedModel::new(calls))
        };
        let runtime_a = runtime(base.path(), script("a"));
        // Same workspace table and lock, different model.
        let runtime_b = AgentRuntime::new(
            runtime_a.workspaces().clone(),
            Arc::new(AgentLoop::new(script("b"), runtime_a.dispatcher().clone(), 10)),
        );

        let mut a = runtime_a.invoke("shared", Vec::new(), "go", CancellationToken::new());
        let mut b = runtime_b.invoke("shared", Vec::new(), "go", CancellationToken::new());
        let (events_a, events_b) = tokio::join!(drain(&mut a), drain(&mut b));

        for (prefix, events) in [("a", &events_a), ("b", &events_b)] {
            let ids: Vec<_> = events
                .iter()
                .filter_map(|e| match &e.event {
                    AgentEvent::ToolResult { result, .. } => Some(result.id.clone()),
                    _ => None,
                })
                .collect();
            assert_eq!(ids, (0..3).map(|i| format!("{prefix}{i}")).collect::<Vec<_>>());
        }
        assert!(base.path().join("shared/a/2.txt").exists());
        assert!(base.path().join("shared/b/2.txt").exists());
    }

    #[tokio::test]
    async fn iteration_cap_fails_after_exact_executions() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::repeating_tool(
            "run_command",
            json!({ "command": "echo", "args": ["tick"] }),
        ));
        let mut config = test_config(base.path());
        config.max_iterations = 3;
        let runtime = runtime_with(&config, model.clone());

        let mut stream = runtime.invoke("demo", Vec::new(), "loop", CancellationToken::new());
        let events = drain(&mut stream).await;
        let turn = stream.join().await.unwrap();

        let executions = events
            .iter()
            .filter(|e| matches!(e.event, AgentEvent::ToolResult { .. }))
            .count();
        assert_eq!(executions, 3);
        assert_eq!(model.calls(), 3);
        assert_eq!(turn.status, TurnStatus::Failed);
        assert_eq!(turn.error_kind.as_deref(), Some("iteration_limit_exceeded"));
        match &events.last().unwrap().event {
            AgentEvent::Error { kind, .. } => assert_eq!(kind, "iteration_limit_exceeded"),
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_errors_go_back_to_the_model() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new([
            tool_call("c1", "delete_everything", json!({})),
            tool_call("c2", "read_file", json!({ "path": "../../etc/passwd" })),
            text("gave up"),
        ]));
        let runtime = runtime(base.path(), model.clone());

        let stream = runtime.invoke("demo", Vec::new(), "try", CancellationToken::new());
        let turn = stream.join().await.unwrap();

        assert_eq!(turn.status, TurnStatus::Finished);
        assert_eq!(turn.iteration, 2);

        let last_request = model.requests().pop().unwrap();
        let tool_messages: Vec<_> = last_request
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| serde_json::from_str::<serde_json::Value>(&m.content).unwrap())
            .collect();
        assert_eq!(tool_messages.len(), 2);
        assert_eq!(
            tool_messages[0]["error_kind"],
            json!(ToolErrorKind::ToolNotFound)
        );
        assert_eq!(tool_messages[1]["error_kind"], json!("path_escape"));
    }

    #[tokio::test]
    async fn provider_error_fails_the_turn() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::failing(ModelError::Auth("bad key".into())));
        let runtime = runtime(base.path(), model);

        let mut stream = runtime.invoke("demo", Vec::new(), "hi", CancellationToken::new());
        let events = drain(&mut stream).await;
        let turn = stream.join().await.unwrap();

        assert_eq!(turn.status, TurnStatus::Failed);
        assert_eq!(events.len(), 1);
        match &events[0].event {
            AgentEvent::Error { kind, message } => {
                assert_eq!(kind, "provider_error");
                assert!(message.contains("bad key"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_model_call() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new([text("late")]).with_delay(Duration::from_secs(30)));
        let runtime = runtime(base.path(), model);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let mut stream = runtime.invoke("demo", Vec::new(), "slow", cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let events = drain(&mut stream).await;
        let turn = stream.join().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(event_types(&events), vec!["cancelled"]);
        assert_eq!(turn.status, TurnStatus::Cancelled);
        assert!(runtime.dispatcher().lock().holder("demo").is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_never_calls_model() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new([text("unused")]));
        let runtime = runtime(base.path(), model.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let turn = runtime
            .invoke("demo", Vec::new(), "stop", cancel)
            .join()
            .await
            .unwrap();
        assert_eq!(turn.status, TurnStatus::Cancelled);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_slug_is_reported_as_failure() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new([text("unused")]));
        let runtime = runtime(base.path(), model.clone());

        let mut stream = runtime.invoke("///", Vec::new(), "hi", CancellationToken::new());
        let events = drain(&mut stream).await;
        let turn = stream.join().await.unwrap();

        assert_eq!(turn.status, TurnStatus::Failed);
        assert_eq!(turn.error_kind.as_deref(), Some("workspace_error"));
        assert_eq!(event_types(&events), vec!["error"]);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn cancel_during_tool_waits_for_result() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new([
            tool_call("s", "run_command", json!({ "command": "sleep", "args": ["2"] })),
            text("unused"),
        ]));
        let runtime = runtime(base.path(), model.clone());
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let mut stream = runtime.invoke("demo", Vec::new(), "wait", cancel.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();

        let events = drain(&mut stream).await;
        let turn = stream.join().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(
            event_types(&events),
            vec!["tool_call_started", "tool_result", "cancelled"]
        );
        match &events[1].event {
            AgentEvent::ToolResult { result, .. } => {
                assert!(result.ok, "{result:?}");
                assert_eq!(result.output["timed_out"], json!(false));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(turn.status, TurnStatus::Cancelled);
        assert_eq!(turn.iteration, 1);
        assert_eq!(model.calls(), 1);
        assert!(runtime.dispatcher().lock().holder("demo").is_none());
    }

    #[tokio::test]
    async fn cancel_while_tool_waits_for_lock() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new([
            tool_call("w", "write_file", json!({ "path": "late.txt", "content": "x" })),
            text("unused"),
        ]));
        let runtime = runtime(base.path(), model.clone());
        resolve(&runtime, "demo");
        let held = runtime
            .dispatcher()
            .lock()
            .acquire_guard("demo", "operator", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let mut stream = runtime.invoke("demo", Vec::new(), "write", cancel.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let events = drain(&mut stream).await;
        let turn = stream.join().await.unwrap();
        drop(held);

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            event_types(&events),
            vec!["tool_call_started", "tool_result", "cancelled"]
        );
        match &events[1].event {
            AgentEvent::ToolResult { result, .. } => {
                assert_eq!(result.error_kind, Some(ToolErrorKind::Cancelled));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(turn.status, TurnStatus::Cancelled);
        assert!(!base.path().join("demo/late.txt").exists());
    }

    #[tokio::test]
    async fn removed_workspace_root_fails_the_turn() {
        let base = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::repeating_tool(
            "read_file",
            json!({ "path": "notes.txt" }),
        ));
        let mut config = test_config(base.path());
        config.max_iterations = 5;
        let runtime = runtime_with(&config, model.clone());
        let workspace = resolve(&runtime, "demo");
        std::fs::remove_dir_all(&workspace.root_path).unwrap();

        let mut stream = runtime.invoke("demo", Vec::new(), "read", CancellationToken::new());
        let events = drain(&mut stream).await;
        let turn = stream.join().await.unwrap();

        assert_eq!(model.calls(), 1);
        assert_eq!(
            event_types(&events),
            vec!["tool_call_started", "tool_result", "error"]
        );
        assert_eq!(turn.status, TurnStatus::Failed);
        assert_eq!(turn.error_kind.as_deref(), Some("workspace_error"));
        assert_eq!(turn.iteration, 1);
        match &events[2].event {
            AgentEvent::Error { kind, message } => {
                assert_eq!(kind, "workspace_error");
                assert!(message.contains("demo"), "{message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
