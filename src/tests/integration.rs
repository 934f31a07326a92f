//! Dispatcher scenarios against real workspaces, processes and git.

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::runtime::lock::LOCK_FILE_NAME;
    use crate::tests::{call, git_available, resolve, tool_runtime};
    use crate::tools::ToolErrorKind;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_writer_waits_for_running_command() {
        let base = tempfile::tempdir().unwrap();
        let runtime = tool_runtime(base.path());
        let workspace = resolve(&runtime, "demo");

        let dispatcher = runtime.dispatcher().clone();
        let ws_a = workspace.clone();
        let a = tokio::spawn(async move {
            let result = dispatcher
                .dispatch(
                    &ws_a,
                    "agent:a",
                    &call("a1", "run_command", json!({ "command": "sleep", "args": ["2"] })),
                )
                .await;
            (result, Instant::now())
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        let started = Instant::now();
        let b = runtime
            .dispatcher()
            .dispatch(
                &workspace,
                "agent:b",
                &call("b1", "write_file", json!({ "path": "notes.txt", "content": "from b\n" })),
            )
            .await;
        let b_done = Instant::now();
        let (a, a_done) = a.await.unwrap();

        assert!(a.ok, "{a:?}");
        assert!(b.ok, "{b:?}");
        assert!(a_done <= b_done);
        assert!(
            started.elapsed() >= Duration::from_millis(1200),
            "writer did not wait: {:?}",
            started.elapsed()
        );
        assert_eq!(
            std::fs::read_to_string(workspace.root_path.join("notes.txt")).unwrap(),
            "from b\n"
        );
        assert!(runtime.dispatcher().lock().holder("demo").is_none());
        assert!(!workspace.root_path.join(LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn different_workspaces_do_not_block() {
        let base = tempfile::tempdir().unwrap();
        let runtime = tool_runtime(base.path());
        let one = resolve(&runtime, "one");
        let two = resolve(&runtime, "two");

        let guard = runtime
            .dispatcher()
            .lock()
            .acquire_guard("one", "operator", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        let result = runtime
            .dispatcher()
            .dispatch(&two, "agent:x", &call("c1", "make_dir", json!({ "path": "src" })))
            .await;
        assert!(result.ok, "{result:?}");
        drop(guard);

        let result = runtime
            .dispatcher()
            .dispatch(&one, "agent:x", &call("c2", "file_exists", json!({ "path": "src" })))
            .await;
        assert_eq!(result.output["exists"], json!(false));
    }

    #[tokio::test]
    async fn rm_is_not_allowed_and_nothing_runs() {
        let base = tempfile::tempdir().unwrap();
        let runtime = tool_runtime(base.path());
        let workspace = resolve(&runtime, "demo");
        std::fs::write(workspace.root_path.join("keep.txt"), "x").unwrap();

        let result = runtime
            .dispatcher()
            .dispatch(
                &workspace,
                "agent:a",
                &call("c1", "run_command", json!({ "command": "rm", "args": ["keep.txt"] })),
            )
            .await;

        assert!(!result.ok);
        assert_eq!(result.error_kind, Some(ToolErrorKind::CommandNotAllowed));
        assert!(workspace.root_path.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn patch_conflict_leaves_file_unchanged() {
        let base = tempfile::tempdir().unwrap();
        let runtime = tool_runtime(base.path());
        let workspace = resolve(&runtime, "demo");
        let original = "line one\nline two\nline three\nline four\nline five\nline six\nline seven\n";
        std::fs::write(workspace.root_path.join("app.txt"), original).unwrap();

        let diff = "--- a/app.txt\n+++ b/app.txt\n\
@@ -1,3 +1,3 @@\n line one\n-line two\n+line 2\n line three\n\
@@ -5,3 +5,3 @@\n line five\n-line six\n+line 6\n line sevem\n";
        let result = runtime
            .dispatcher()
            .dispatch(&workspace, "agent:a", &call("p1", "apply_patch", json!({ "diff": diff })))
            .await;

        assert!(!result.ok);
        assert_eq!(result.error_kind, Some(ToolErrorKind::PatchConflict));
        assert_eq!(
            std::fs::read_to_string(workspace.root_path.join("app.txt")).unwrap(),
            original
        );
        let leftovers: Vec<_> = std::fs::read_dir(&workspace.root_path)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".pdd-patch-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn timed_out_command_is_data() {
        let base = tempfile::tempdir().unwrap();
        let runtime = tool_runtime(base.path());
        let workspace = resolve(&runtime, "demo");

        let started = Instant::now();
        let result = runtime
            .dispatcher()
            .dispatch(
                &workspace,
                "agent:a",
                &call(
                    "c1",
                    "run_command",
                    json!({ "command": "sleep", "args": ["10"], "timeout_ms": 300 }),
                ),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.ok);
        assert_eq!(result.error_kind, Some(ToolErrorKind::SubprocessTimeout));
        assert_eq!(result.output["timed_out"], json!(true));
    }

    #[tokio::test]
    async fn escapes_are_rejected_for_every_path_tool() {
        let base = tempfile::tempdir().unwrap();
        let runtime = tool_runtime(base.path());
        let workspace = resolve(&runtime, "demo");

        let calls = [
            call("1", "read_file", json!({ "path": "../outside.txt" })),
            call("2", "write_file", json!({ "path": "/etc/passwd", "content": "x" })),
            call("3", "list_files", json!({ "path": "../" })),
            call("4", "make_dir", json!({ "path": "a/../../b" })),
            call("5", "run_command", json!({ "command": "ls", "cwd": "../.." })),
        ];
        for call in &calls {
            let result = runtime.dispatcher().dispatch(&workspace, "agent:a", call).await;
            assert_eq!(result.error_kind, Some(ToolErrorKind::PathEscape), "{call:?}");
        }
        assert!(!base.path().join("b").exists());
    }

    #[tokio::test]
    async fn git_flow_through_dispatcher() {
        if !git_available() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let runtime = tool_runtime(base.path());
        let workspace = resolve(&runtime, "demo");
        let dispatcher = runtime.dispatcher();

        let status = dispatcher
            .dispatch(&workspace, "agent:a", &call("s0", "git_diff", json!({})))
            .await;
        assert_eq!(status.error_kind, Some(ToolErrorKind::GitNotInitialized));

        let init = dispatcher
            .dispatch(&workspace, "agent:a", &call("i", "git_init", json!({})))
            .await;
        assert!(init.ok, "{init:?}");

        dispatcher
            .dispatch(
                &workspace,
                "agent:a",
                &call("w", "write_file", json!({ "path": "main.py", "content": "print(1)\n" })),
            )
            .await;

        let status = dispatcher
            .dispatch(&workspace, "agent:a", &call("s1", "git_status", json!({})))
            .await;
        assert_eq!(status.output["clean"], json!(false));

        let commit = dispatcher
            .dispatch(
                &workspace,
                "agent:a",
                &call("c", "git_commit", json!({ "message": "add main" })),
            )
            .await;
        assert!(commit.ok, "{commit:?}");
        assert_eq!(commit.output["hash"].as_str().map(str::len), Some(40));

        let again = dispatcher
            .dispatch(
                &workspace,
                "agent:a",
                &call("c2", "git_commit", json!({ "message": "again" })),
            )
            .await;
        assert_eq!(again.error_kind, Some(ToolErrorKind::NothingToCommit));
    }
}
