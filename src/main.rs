use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use coderelay::agent::{AgentKind, AgentManager};
use coderelay::router::ModelRouter;
use coderelay::server::{self, AppState};
use coderelay::store::Store;
use coderelay::tunnel::{TunnelManager, TunnelMode};

#[derive(Debug, Parser)]
#[command(author, version, about = "OpenAI-compatible gateway over local CLI agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP gateway.
    Serve(ServeArgs),
    /// Print agent and tunnel status as JSON and exit.
    Status(StatusArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Port to bind the gateway to.
    #[arg(long, env = "RELAY_PORT", default_value_t = 8080)]
    port: u16,

    /// SQLite database path for responses, API keys and usage logs.
    #[arg(long, env = "RELAY_DB_PATH", default_value = "coderelay.db")]
    db_path: String,

    /// Master key that authorizes every endpoint. Omit to run the gateway
    /// open, for local use only.
    #[arg(long, env = "RELAY_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    #[command(flatten)]
    bins: BinOverrides,

    /// Start the cloudflared tunnel as soon as the gateway is listening.
    #[arg(long)]
    tunnel: bool,

    /// Long-lived tunnel credential for a pre-registered hostname.
    #[arg(
        long,
        env = "TUNNEL_TOKEN",
        hide_env_values = true,
        requires = "tunnel_hostname"
    )]
    tunnel_token: Option<String>,

    /// Hostname the token-mode tunnel is registered for.
    #[arg(long, env = "TUNNEL_HOSTNAME", requires = "tunnel_token")]
    tunnel_hostname: Option<String>,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[command(flatten)]
    bins: BinOverrides,
}

#[derive(Debug, Parser)]
struct BinOverrides {
    /// Explicit path to the codex executable.
    #[arg(long, env = "CODEX_BIN")]
    codex_bin: Option<PathBuf>,

    /// Explicit path to the gemini executable.
    #[arg(long, env = "GEMINI_BIN")]
    gemini_bin: Option<PathBuf>,

    /// Explicit path to the cloudflared executable.
    #[arg(long, env = "CLOUDFLARED_BIN")]
    cloudflared_bin: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => run_serve(args).await?,
        Command::Status(args) => run_status(args).await,
    }

    Ok(())
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let codex = Arc::new(AgentManager::new(AgentKind::Codex, args.bins.codex_bin));
    let gemini = Arc::new(AgentManager::new(AgentKind::Gemini, args.bins.gemini_bin));
    let router = ModelRouter::new(codex, gemini);

    let store = Store::open(&args.db_path).await?;

    let mode = match (args.tunnel_token, args.tunnel_hostname) {
        (Some(token), Some(hostname)) => TunnelMode::Token { token, hostname },
        _ => TunnelMode::Quick,
    };
    let tunnel = Arc::new(TunnelManager::new(
        args.port,
        mode,
        args.bins.cloudflared_bin,
    ));

    if args.tunnel {
        let status = tunnel.start().await;
        match status.url {
            Some(url) => println!("tunnel: {url}"),
            None => eprintln!(
                "tunnel failed to start: {}",
                status.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    let state = Arc::new(AppState {
        router,
        store,
        tunnel: tunnel.clone(),
        master_key: args.master_key,
        port: args.port,
        db_path: args.db_path,
    });

    let result = server::serve(state).await;

    // The tunnel child does not outlive the gateway.
    tunnel.stop().await;

    result.map_err(Into::into)
}

async fn run_status(args: StatusArgs) {
    let codex = AgentManager::new(AgentKind::Codex, args.bins.codex_bin);
    let gemini = AgentManager::new(AgentKind::Gemini, args.bins.gemini_bin);
    let tunnel = TunnelManager::new(8080, TunnelMode::Quick, args.bins.cloudflared_bin);

    let report = serde_json::json!({
        "codex": codex.status(true).await,
        "gemini": gemini.status(true).await,
        "cloudflared": { "installed": tunnel.is_installed().await },
    });
    match serde_json::to_string_pretty(&report) {
        Ok(pretty) => println!("{pretty}"),
        Err(_) => println!("{report}"),
    }
}
