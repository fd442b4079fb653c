//! Stand-in for cloudflared in tunnel integration tests.
//!
//! Mirrors the real binary's startup chatter on stderr: quick mode prints a
//! trycloudflare URL banner, token mode prints the registered-connection
//! marker. The process then idles until killed, like a live tunnel.
//! `MOCK_CLOUDFLARED_SILENT` suppresses the banner to exercise the startup
//! timeout path, `MOCK_CLOUDFLARED_EXIT` quits before printing anything
//! (the relay-died-early path), and `MOCK_CLOUDFLARED_DELAY_MS` postpones
//! the banner to stretch out the startup window.

use std::time::Duration;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--version") {
        println!("cloudflared version 2025.1.0 (mock)");
        return;
    }

    if std::env::var("MOCK_CLOUDFLARED_EXIT").is_ok() {
        return;
    }

    if let Ok(delay) = std::env::var("MOCK_CLOUDFLARED_DELAY_MS") {
        if let Ok(ms) = delay.parse::<u64>() {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    if std::env::var("MOCK_CLOUDFLARED_SILENT").is_err() {
        eprintln!("2025-08-25T00:00:00Z INF Thank you for trying Cloudflare Tunnel.");
        if args.iter().any(|arg| arg == "--token" || arg == "run") {
            eprintln!("2025-08-25T00:00:01Z INF Registered tunnel connection connIndex=0");
        } else {
            eprintln!("2025-08-25T00:00:01Z INF +--------------------------------------+");
            eprintln!(
                "2025-08-25T00:00:01Z INF |  https://mock-relay-test.trycloudflare.com  |"
            );
            eprintln!("2025-08-25T00:00:01Z INF +--------------------------------------+");
        }
    }

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
