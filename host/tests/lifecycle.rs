//! Lifecycle manager and tool registry driven through an in-memory launcher

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{eventually, host, host_with, server, tool, tool_with_schema, FakeLauncher};
use mcp_host::mcp::{ServerState, DISCOVERY_RETRY_DELAY, FORWARDED_ENV_VARS};
use mcp_host::{HostError, McpHost, SecurityConfig, ServerConfig, SettingsSink, ToolOutcome};

async fn tool_ids_for(host: &McpHost, server: &str) -> BTreeSet<String> {
    host.tools()
        .await
        .into_iter()
        .filter(|t| t.source_server.as_deref() == Some(server))
        .map(|t| t.id)
        .collect()
}

fn ids(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn start_disabled_server_errors_and_stays_stopped() {
    let launcher = FakeLauncher::new();
    let host = host(vec![server("time").with_enabled(false)], launcher.clone());

    let err = host.manager().start_server("time").await.unwrap_err();
    assert!(matches!(err, HostError::ServerDisabled(_)));

    let status = host.manager().get_server_status("time").unwrap();
    assert_eq!(status.state, ServerState::Stopped);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_registers_exactly_the_discovered_tools() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("time", vec![tool("time", "now"), tool("time", "convert")]);
    let host = host(vec![server("time")], launcher.clone());

    let status = host.manager().start_server("time").await.unwrap();
    assert_eq!(status.state, ServerState::Running);
    assert!(status.start_time.is_some());
    assert_eq!(status.discovered_tools.len(), 2);
    assert_eq!(
        host.manager().get_server_status("time").unwrap().state,
        ServerState::Running
    );
    assert_eq!(tool_ids_for(&host, "time").await, ids(&["time:convert", "time:now"]));

    // A restart with a different capability set leaves nothing stale behind
    launcher.set_tools("time", vec![tool("time", "now_v2")]);
    host.manager().restart_server("time").await.unwrap();
    assert_eq!(tool_ids_for(&host, "time").await, ids(&["time:now_v2"]));

    // Built-ins are untouched
    assert!(host.registry().get_tool("echoFile").await.is_some());
}

#[tokio::test]
async fn remove_running_server_terminates_process() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("files", vec![tool("files", "read")]);
    let host = host(vec![server("files")], launcher.clone());

    host.manager().start_server("files").await.unwrap();
    host.manager().remove_server("files").await.unwrap();

    assert!(launcher.was_killed("files"));
    assert!(launcher.session("files").closed.load(Ordering::SeqCst));
    assert!(host.manager().get_server_config("files").is_none());
    assert!(host.manager().get_server_status("files").is_none());
    assert!(tool_ids_for(&host, "files").await.is_empty());
    assert_eq!(host.manager().get_server_statistics().total, 0);
}

#[tokio::test(start_paused = true)]
async fn discovery_retries_until_third_attempt() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("flaky", vec![tool("flaky", "ping")]);
    launcher.fail_discovery("flaky", 2);
    let host = host(vec![server("flaky")], launcher.clone());

    let status = host.manager().start_server("flaky").await.unwrap();
    assert_eq!(status.discovered_tools.len(), 1);

    let attempts = launcher.session("flaky").list_attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 3);
    for pair in attempts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= DISCOVERY_RETRY_DELAY, "gap {:?}", gap);
        assert!(gap < DISCOVERY_RETRY_DELAY + Duration::from_millis(50), "gap {:?}", gap);
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_discovery_keeps_server_running_without_tools() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("flaky", vec![tool("flaky", "ping")]);
    launcher.fail_discovery("flaky", 10);
    let host = host(vec![server("flaky")], launcher.clone());

    let status = host.manager().start_server("flaky").await.unwrap();
    assert_eq!(status.state, ServerState::Running);
    assert!(status.discovered_tools.is_empty());
    assert_eq!(launcher.session("flaky").list_attempts.lock().unwrap().len(), 3);
    assert!(tool_ids_for(&host, "flaky").await.is_empty());
}

#[tokio::test]
async fn same_tool_name_on_two_servers_does_not_collide() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("time", vec![tool("time", "list")]);
    launcher.set_tools("files", vec![tool("files", "list")]);
    let host = host(vec![server("time"), server("files")], launcher.clone());

    let failures = host.manager().start_all_enabled_servers().await;
    assert!(failures.is_empty());

    let all: BTreeSet<String> = host.tools().await.into_iter().map(|t| t.id).collect();
    assert!(all.contains("time:list"));
    assert!(all.contains("files:list"));

    let outcome = host.call_tool("files:list", json!({ "dir": "docs" }), None).await;
    let ToolOutcome::Success { data } = outcome else {
        panic!("expected success, got {:?}", outcome);
    };
    let text = data["content"][0]["text"].as_str().unwrap();
    assert!(text.starts_with("files/list"), "{}", text);

    let outcome = host.call_tool("time:list", json!({}), None).await;
    assert!(outcome.is_success());
}

#[tokio::test]
async fn echo_file_with_missing_argument_returns_error_envelope() {
    let host = host(vec![], FakeLauncher::new());

    let outcome = host.call_tool("echoFile", json!({}), None).await;
    match outcome {
        ToolOutcome::Error { error } => assert!(error.contains("path"), "{}", error),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn echo_file_reads_through_registry() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notes.md");
    std::fs::write(&file, "# notes").unwrap();
    let host = host(vec![], FakeLauncher::new());

    let outcome = host
        .call_tool("echoFile", json!({ "path": file.display().to_string() }), None)
        .await;
    let ToolOutcome::Success { data } = outcome else {
        panic!("expected success, got {:?}", outcome);
    };
    assert_eq!(data["content"], "# notes");
}

#[tokio::test]
async fn unknown_tool_returns_error_envelope() {
    let host = host(vec![], FakeLauncher::new());
    let outcome = host.call_tool("nope:missing", json!({}), None).await;
    assert_eq!(
        outcome,
        ToolOutcome::Error {
            error: "Unknown tool: nope:missing".to_string()
        }
    );
}

#[tokio::test]
async fn external_call_checks_required_arguments() {
    let launcher = FakeLauncher::new();
    launcher.set_tools(
        "time",
        vec![tool_with_schema(
            "time",
            "convert",
            json!({
                "type": "object",
                "properties": { "timezone": { "type": "string" } },
                "required": ["timezone"]
            }),
        )],
    );
    let host = host(vec![server("time")], launcher);
    host.manager().start_server("time").await.unwrap();

    let outcome = host.call_tool("time:convert", json!({}), None).await;
    match outcome {
        ToolOutcome::Error { error } => assert!(error.contains("timezone"), "{}", error),
        other => panic!("expected error, got {:?}", other),
    }

    let outcome = host
        .call_tool("time:convert", json!({ "timezone": "Europe/Paris" }), None)
        .await;
    assert!(outcome.is_success());

    let outcome = host
        .call_tool("time:convert", json!({ "timezone": "UTC; rm -rf /" }), None)
        .await;
    assert!(!outcome.is_success());
}

#[tokio::test]
async fn rate_limit_rejects_call_over_the_minute_budget() {
    let security = SecurityConfig {
        max_calls_per_minute: 2,
        ..Default::default()
    };
    let host = host_with(vec![], security, FakeLauncher::new());

    assert!(host.call_tool("currentTime", json!({}), None).await.is_success());
    assert!(host.call_tool("currentTime", json!({}), None).await.is_success());
    match host.call_tool("currentTime", json!({}), None).await {
        ToolOutcome::Error { error } => assert!(error.contains("Rate limit"), "{}", error),
        other => panic!("expected rate limit error, got {:?}", other),
    }
    assert_eq!(host.security().violations().len(), 1);
}

#[tokio::test]
async fn unexpected_exit_moves_server_to_stopped_and_drops_tools() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("time", vec![tool("time", "now")]);
    let host = host(vec![server("time")], launcher.clone());
    host.manager().start_server("time").await.unwrap();

    launcher.exit("time", Some(1));

    let manager = host.manager().clone();
    eventually(|| manager.get_server_status("time").unwrap().state == ServerState::Stopped).await;
    for _ in 0..200 {
        if tool_ids_for(&host, "time").await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(tool_ids_for(&host, "time").await.is_empty());

    // The server can be started again
    host.manager().start_server("time").await.unwrap();
    assert_eq!(tool_ids_for(&host, "time").await, ids(&["time:now"]));
}

#[tokio::test]
async fn disabling_running_server_stops_it_in_background() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("time", vec![tool("time", "now")]);
    let host = host(vec![server("time")], launcher.clone());
    host.manager().start_server("time").await.unwrap();

    let handle = host
        .manager()
        .set_server_enabled("time", false)
        .unwrap();
    handle.await.unwrap();

    assert!(launcher.was_killed("time"));
    assert_eq!(
        host.manager().get_server_status("time").unwrap().state,
        ServerState::Stopped
    );
    assert!(!host.manager().get_server_config("time").unwrap().enabled);
    assert!(tool_ids_for(&host, "time").await.is_empty());

    // Re-enabling starts it again
    let handle = host
        .manager()
        .set_server_enabled("time", true)
        .unwrap();
    handle.await.unwrap();
    assert_eq!(
        host.manager().get_server_status("time").unwrap().state,
        ServerState::Running
    );
}

#[tokio::test]
async fn spawn_failure_sets_error_with_hint() {
    let launcher = FakeLauncher::new();
    launcher.fail_spawn("time", std::io::ErrorKind::NotFound);
    let host = host(vec![server("time")], launcher);

    let err = host.manager().start_server("time").await.unwrap_err();
    assert!(err.to_string().contains("Hint"), "{}", err);

    let status = host.manager().get_server_status("time").unwrap();
    assert_eq!(status.state, ServerState::Error);
    assert!(status.last_error.unwrap().contains("npx"));
    assert_eq!(host.manager().get_server_statistics().error, 1);

    // error -> starting is the only way out
    let err = host.manager().start_server("time").await.unwrap_err();
    assert!(matches!(err, HostError::Spawn { .. }));
}

#[tokio::test]
async fn placeholder_command_is_rejected() {
    let mut security = SecurityConfig::default();
    security.allowed_commands.push("echo".to_string());
    let host = host_with(
        vec![ServerConfig::new("fake", "echo").with_args(["hello"])],
        security,
        FakeLauncher::new(),
    );

    let err = host.manager().start_server("fake").await.unwrap_err();
    assert!(matches!(err, HostError::PlaceholderCommand { .. }));
    assert_eq!(
        host.manager().get_server_status("fake").unwrap().state,
        ServerState::Error
    );
}

#[tokio::test]
async fn spawned_process_only_sees_forwarded_environment() {
    let launcher = FakeLauncher::new();
    let host = host(vec![server("time")], launcher.clone());
    host.manager().start_server("time").await.unwrap();

    let specs = launcher.specs.lock().unwrap();
    let spec = specs.last().unwrap();
    assert_eq!(spec.command, "npx");
    for (key, _) in &spec.env {
        assert!(FORWARDED_ENV_VARS.contains(&key.as_str()), "leaked {}", key);
    }
}

#[tokio::test]
async fn destructive_tool_waits_for_confirmation() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("files", vec![tool("files", "delete_file")]);
    let security = SecurityConfig {
        require_confirmation: true,
        ..Default::default()
    };
    let host = host_with(vec![server("files")], security, launcher);
    host.manager().start_server("files").await.unwrap();

    let broker = host.confirmations().clone();
    let mut requests = broker.subscribe();

    let registry = host.registry().clone();
    let denied = tokio::spawn(async move {
        registry
            .call_tool("files:delete_file", json!({ "path": "a.txt" }), None)
            .await
    });
    let request = requests.recv().await.unwrap();
    assert_eq!(request.tool_id, "files:delete_file");
    broker.resolve(request.call_id, false);
    assert!(!denied.await.unwrap().is_success());

    let registry = host.registry().clone();
    let approved = tokio::spawn(async move {
        registry
            .call_tool("files:delete_file", json!({ "path": "a.txt" }), None)
            .await
    });
    let request = requests.recv().await.unwrap();
    broker.resolve(request.call_id, true);
    assert!(approved.await.unwrap().is_success());
}

#[derive(Default)]
struct RecordingSink {
    snapshots: Mutex<Vec<Vec<String>>>,
}

impl SettingsSink for RecordingSink {
    fn on_settings_change(&self, configs: &[ServerConfig]) {
        self.snapshots
            .lock()
            .unwrap()
            .push(configs.iter().map(|c| c.name.clone()).collect());
    }
}

#[tokio::test]
async fn settings_sink_sees_every_mutation_but_not_bulk_load() {
    let host = host(vec![server("time")], FakeLauncher::new());
    let sink = Arc::new(RecordingSink::default());
    host.manager().set_settings_sink(sink.clone());

    host.manager()
        .load_server_configurations(vec![server("time"), server("files")])
        .await;
    assert!(sink.snapshots.lock().unwrap().is_empty());

    host.manager().add_server(server("git")).unwrap();
    host.manager().remove_server("time").await.unwrap();
    host.manager()
        .update_server("files", server("docs"))
        .await
        .unwrap();

    let snapshots = sink.snapshots.lock().unwrap().clone();
    assert_eq!(
        snapshots,
        vec![
            vec!["files".to_string(), "git".to_string(), "time".to_string()],
            vec!["files".to_string(), "git".to_string()],
            vec!["docs".to_string(), "git".to_string()],
        ]
    );
    assert!(host.manager().get_server_status("docs").is_some());
    assert!(host.manager().get_server_status("files").is_none());
}

#[tokio::test(start_paused = true)]
async fn remove_during_launch_stops_the_server_once_started() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("slow", vec![tool("slow", "ping")]);
    launcher.slow_launch(Duration::from_millis(300));
    let host = host(vec![server("slow")], launcher.clone());

    let manager = host.manager().clone();
    let start = tokio::spawn(async move { manager.start_server("slow").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        host.manager().get_server_status("slow").unwrap().state,
        ServerState::Starting
    );

    host.manager().remove_server("slow").await.unwrap();
    assert_eq!(start.await.unwrap().unwrap().state, ServerState::Running);

    assert!(launcher.was_killed("slow"));
    assert!(host.manager().get_server_config("slow").is_none());
    assert!(host.manager().get_server_status("slow").is_none());
    assert!(tool_ids_for(&host, "slow").await.is_empty());
    let stats = host.manager().get_server_statistics();
    assert_eq!((stats.total, stats.running), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn disabling_during_launch_stops_the_server_once_started() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("slow", vec![tool("slow", "ping")]);
    launcher.slow_launch(Duration::from_millis(300));
    let host = host(vec![server("slow")], launcher.clone());

    let manager = host.manager().clone();
    let start = tokio::spawn(async move { manager.start_server("slow").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handle = host.manager().set_server_enabled("slow", false).unwrap();
    handle.await.unwrap();
    start.await.unwrap().unwrap();

    assert!(launcher.was_killed("slow"));
    assert_eq!(
        host.manager().get_server_status("slow").unwrap().state,
        ServerState::Stopped
    );
    assert!(tool_ids_for(&host, "slow").await.is_empty());
}

#[tokio::test]
async fn start_all_keeps_going_after_a_failing_server() {
    let launcher = FakeLauncher::new();
    launcher.fail_spawn("broken", std::io::ErrorKind::NotFound);
    launcher.set_tools("time", vec![tool("time", "now")]);
    let host = host(vec![server("broken"), server("time")], launcher.clone());

    let failures = host.manager().start_all_enabled_servers().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "broken");
    assert!(failures[0].1.is_command_not_found());

    assert_eq!(
        host.manager().get_server_status("broken").unwrap().state,
        ServerState::Error
    );
    assert_eq!(
        host.manager().get_server_status("time").unwrap().state,
        ServerState::Running
    );
    assert_eq!(tool_ids_for(&host, "time").await, ids(&["time:now"]));
}

#[tokio::test]
async fn stop_all_stops_every_server_when_one_fails_to_close() {
    let launcher = FakeLauncher::new();
    launcher.fail_close("alpha");
    launcher.set_tools("alpha", vec![tool("alpha", "a")]);
    launcher.set_tools("beta", vec![tool("beta", "b")]);
    let host = host(vec![server("alpha"), server("beta")], launcher.clone());
    assert!(host.manager().start_all_enabled_servers().await.is_empty());

    let failures = host.manager().stop_all_servers().await;
    assert!(failures.is_empty(), "unexpected failures: {:?}", failures);

    for name in ["alpha", "beta"] {
        assert!(launcher.was_killed(name), "{} was not killed", name);
        assert_eq!(
            host.manager().get_server_status(name).unwrap().state,
            ServerState::Stopped
        );
    }
    assert!(host.tools().await.iter().all(|t| t.source_server.is_none()));
}

#[tokio::test]
async fn updating_a_running_server_restarts_it_with_the_new_config() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("time", vec![tool("time", "now")]);
    let host = host(vec![server("time")], launcher.clone());
    host.manager().start_server("time").await.unwrap();
    let first = launcher.session("time");

    let updated = server("time").with_args(vec!["-y".to_string(), "@example/time-server@2".to_string()]);
    host.manager().update_server("time", updated).await.unwrap();

    assert!(first.closed.load(Ordering::SeqCst));
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    let last_args = launcher.specs.lock().unwrap().last().unwrap().args.clone();
    assert_eq!(last_args, vec!["-y", "@example/time-server@2"]);
    assert_eq!(
        host.manager().get_server_status("time").unwrap().state,
        ServerState::Running
    );
    assert_eq!(tool_ids_for(&host, "time").await, ids(&["time:now"]));

    // Disabling through an update stops it without relaunching
    host.manager()
        .update_server("time", server("time").with_enabled(false))
        .await
        .unwrap();
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert!(launcher.was_killed("time"));
    assert_eq!(
        host.manager().get_server_status("time").unwrap().state,
        ServerState::Stopped
    );
    assert!(tool_ids_for(&host, "time").await.is_empty());
}

#[tokio::test]
async fn exit_of_a_replaced_process_is_ignored() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("time", vec![tool("time", "now")]);
    let host = host(vec![server("time")], launcher.clone());
    host.manager().start_server("time").await.unwrap();
    host.manager().restart_server("time").await.unwrap();

    let ids_seen = launcher.launch_ids("time");
    assert_eq!(ids_seen.len(), 2);
    launcher.exit_launch("time", ids_seen[0], Some(0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!launcher.was_killed("time"));
    assert!(host.client().is_connected("time").await);
    assert_eq!(
        host.manager().get_server_status("time").unwrap().state,
        ServerState::Running
    );
    assert_eq!(tool_ids_for(&host, "time").await, ids(&["time:now"]));

    // The current process exiting still counts
    launcher.exit("time", Some(1));
    let manager = host.manager().clone();
    eventually(|| manager.get_server_status("time").unwrap().state == ServerState::Stopped).await;
}

#[tokio::test(start_paused = true)]
async fn tools_cannot_be_invoked_while_server_is_starting() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("time", vec![tool("time", "now")]);
    launcher.fail_discovery("time", 2);
    let host = host(vec![server("time")], launcher.clone());

    let manager = host.manager().clone();
    let start = tokio::spawn(async move { manager.start_server("time").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(host.client().is_connected("time").await);
    let err = host
        .client()
        .invoke("time", "now", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HostError::NotRunning {
            state: ServerState::Starting,
            ..
        }
    ));

    start.await.unwrap().unwrap();
    host.client()
        .invoke("time", "now", json!({}), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn reloading_configurations_stops_connected_servers() {
    let launcher = FakeLauncher::new();
    launcher.set_tools("time", vec![tool("time", "now")]);
    let host = host(vec![server("time")], launcher.clone());
    host.manager().start_server("time").await.unwrap();

    let rejected = host
        .manager()
        .load_server_configurations(vec![server("files")])
        .await;
    assert!(rejected.is_empty());

    assert!(launcher.was_killed("time"));
    assert!(!host.client().is_connected("time").await);
    assert!(host.manager().get_server_status("time").is_none());
    assert!(tool_ids_for(&host, "time").await.is_empty());
    assert_eq!(
        host.manager().get_server_status("files").unwrap().state,
        ServerState::Stopped
    );
}
