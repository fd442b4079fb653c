//! End-to-end runner tests against the mock agent binary.

use std::path::PathBuf;
use std::time::Duration;

use coderelay::agent::{AgentKind, AgentManager, ChatTurn};

fn mock_agent() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock_agent"))
}

#[tokio::test]
async fn codex_prompt_round_trips_through_jsonl() {
    let manager = AgentManager::new(AgentKind::Codex, Some(mock_agent()));
    let output = manager
        .run_prompt("hello world", "gpt-5-codex", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(output, "echo: hello world");
}

#[tokio::test]
async fn gemini_prompt_round_trips_through_json() {
    let manager = AgentManager::new(AgentKind::Gemini, Some(mock_agent()));
    let output = manager
        .run_prompt("hello world", "gemini-2.5-flash", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(output, "echo: hello world");
}

#[tokio::test]
async fn history_is_flattened_into_the_prompt() {
    let manager = AgentManager::new(AgentKind::Codex, Some(mock_agent()));
    let turns = vec![
        ChatTurn {
            role: "system".into(),
            content: "be brief".into(),
        },
        ChatTurn {
            role: "user".into(),
            content: "hi".into(),
        },
    ];
    let output = manager
        .run_with_history(&turns, "gpt-5-codex", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(output.contains("system: be brief"));
    assert!(output.contains("user: hi"));
    assert!(output.ends_with("assistant:"));
}

#[tokio::test]
async fn spawn_stream_delivers_lines_then_a_clean_end() {
    use coderelay::agent::StreamEvent;

    let manager = AgentManager::new(AgentKind::Codex, Some(mock_agent()));
    let (_id, mut events) = manager
        .spawn_stream("hello world", "gpt-5-codex")
        .await
        .unwrap();

    let mut lines = Vec::new();
    let mut exit_code = None;
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(line) => lines.push(line),
            StreamEvent::End { exit_code: code } => {
                exit_code = code;
                break;
            }
            StreamEvent::Error(err) => panic!("stream error: {err}"),
        }
    }
    assert_eq!(exit_code, Some(0));
    assert!(lines.iter().any(|line| line.contains("agent_message")));
}

#[tokio::test]
async fn kill_process_stops_a_tracked_child_once() {
    // The cloudflared mock never exits on its own, so the child is still
    // alive when the kill lands.
    let manager = AgentManager::new(
        AgentKind::Codex,
        Some(PathBuf::from(env!("CARGO_BIN_EXE_mock_cloudflared"))),
    );
    let (id, _events) = manager.spawn_stream("hello", "gpt-5-codex").await.unwrap();

    assert!(manager.kill_process(&id).await);
    // The id was deregistered by the kill; a second attempt is a no-op.
    assert!(!manager.kill_process(&id).await);
    assert!(!manager.kill_process("proc_unknown").await);
}

#[tokio::test]
async fn kill_all_sweeps_every_tracked_child() {
    let manager = AgentManager::new(
        AgentKind::Codex,
        Some(PathBuf::from(env!("CARGO_BIN_EXE_mock_cloudflared"))),
    );
    let (_a, _events_a) = manager.spawn_stream("one", "gpt-5-codex").await.unwrap();
    let (_b, _events_b) = manager.spawn_stream("two", "gpt-5-codex").await.unwrap();

    assert_eq!(manager.kill_all_processes().await, 2);
    // Nothing left to sweep.
    assert_eq!(manager.kill_all_processes().await, 0);
}

#[tokio::test]
async fn status_extracts_the_semver_from_version_output() {
    let manager = AgentManager::new(AgentKind::Codex, Some(mock_agent()));
    let status = manager.status(true).await;
    assert!(status.installed);
    assert_eq!(status.version.as_deref(), Some("9.9.9"));
}

#[tokio::test]
async fn router_streams_history_through_the_resolved_backend() {
    use coderelay::agent::StreamEvent;
    use coderelay::router::ModelRouter;
    use std::sync::Arc;

    let code = Arc::new(AgentManager::new(AgentKind::Codex, Some(mock_agent())));
    let chat = Arc::new(AgentManager::new(AgentKind::Gemini, Some(mock_agent())));
    let router = ModelRouter::new(code, chat);

    let turns = vec![ChatTurn {
        role: "user".into(),
        content: "hi".into(),
    }];
    let mut stream = router
        .run_with_history_stream("gpt-5-codex", &turns)
        .await
        .unwrap();
    assert!(stream.id.starts_with("proc_"));

    let mut saw_data = false;
    while let Some(event) = stream.events.recv().await {
        match event {
            StreamEvent::Data(_) => saw_data = true,
            StreamEvent::End { exit_code } => {
                assert_eq!(exit_code, Some(0));
                break;
            }
            StreamEvent::Error(err) => panic!("stream error: {err}"),
        }
    }
    assert!(saw_data);
}
