//! Stand-in for the codex/gemini CLIs in integration tests.
//!
//! Speaks just enough of each CLI's surface to exercise the runner:
//! `--version`, codex-style `exec --json` emitting agent_message JSONL, and
//! gemini-style `--output-format json`. `MOCK_AGENT_DELAY_MS` stalls the
//! reply so timeout handling can be tested, `MOCK_AGENT_FAIL` forces a
//! nonzero exit with a stderr diagnostic, and `MOCK_AGENT_STDERR_KB` floods
//! stderr with progress chatter before answering.

use std::time::Duration;

use serde_json::json;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--version") {
        println!("mock-agent 9.9.9");
        return;
    }

    if let Ok(delay) = std::env::var("MOCK_AGENT_DELAY_MS") {
        if let Ok(ms) = delay.parse::<u64>() {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    if std::env::var("MOCK_AGENT_FAIL").is_ok() {
        eprintln!("mock agent: forced failure");
        std::process::exit(1);
    }

    if let Ok(kb) = std::env::var("MOCK_AGENT_STDERR_KB") {
        if let Ok(kb) = kb.parse::<usize>() {
            let line = "x".repeat(1023);
            for _ in 0..kb {
                eprintln!("{line}");
            }
        }
    }

    if args.first().map(String::as_str) == Some("exec") {
        // Codex shape: JSONL stream ending in an agent_message item.
        let prompt = args.last().cloned().unwrap_or_default();
        println!("{}", json!({ "item": { "type": "session_started" } }));
        println!(
            "{}",
            json!({ "item": { "type": "agent_message", "text": format!("echo: {prompt}") } })
        );
        return;
    }

    // Gemini shape: one JSON object with a "response" field.
    let prompt = args
        .iter()
        .position(|arg| arg == "--prompt")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_default();
    println!("{}", json!({ "response": format!("echo: {prompt}") }));
}
