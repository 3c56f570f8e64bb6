use anyhow::Result;
use clap::Parser;
use tracing_subscriber::prelude::*;

use web_terminal::cli::{Cli, ClientArgs, Commands, ServerArgs};
use web_terminal::config::{load_client_config, load_server_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => run_server(args, cli.debug).await,
        Commands::Client(args) => run_client(args, cli.debug).await,
    }
}

fn init_logging(default_directive: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

async fn run_server(args: ServerArgs, debug: bool) -> Result<()> {
    init_logging(if debug {
        "web_terminal=debug,session_driver=debug,tower_http=debug,info"
    } else {
        "web_terminal=info,tower_http=info,warn"
    });

    let config = load_server_config(args.config.as_deref(), &args.overrides())?;
    web_terminal::server::serve(config).await
}

#[cfg(unix)]
async fn run_client(args: ClientArgs, debug: bool) -> Result<()> {
    use web_terminal::client::SessionEnd;

    // Anything louder garbles the raw-mode terminal
    init_logging(if debug { "web_terminal=debug,warn" } else { "warn" });

    let config = load_client_config(args.config.as_deref(), &args.overrides()?)?;
    match web_terminal::client::run(config).await {
        Ok(SessionEnd::Exited { code, message }) => {
            if !message.is_empty() {
                println!("{message}");
            }
            std::process::exit(code);
        }
        Ok(SessionEnd::Disconnected | SessionEnd::Detached) => Ok(()),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

#[cfg(not(unix))]
async fn run_client(_args: ClientArgs, _debug: bool) -> Result<()> {
    anyhow::bail!("the terminal client needs a unix terminal")
}
