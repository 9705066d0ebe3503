use chatstream_core::{
    config::Config,
    model::Conversation,
    ChatClient,
};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::io::{self, Write};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "chatstream CLI smoke tool", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask one question and print deltas live
    Ask {
        #[arg(long, help = "Override the configured model")]
        model: Option<String>,
        #[arg(long, help = "Optional system prompt sent ahead of the question")]
        system: Option<String>,
        question: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Ask {
            model,
            system,
            question,
        } => {
            if model.is_some() {
                cfg.model = model;
            }
            let client = ChatClient::from_config(&cfg)?;
            let mut print = |delta: &str| {
                print!("{delta}");
                io::stdout().flush().ok();
            };
            let cancel = interrupted(tokio::signal::ctrl_c());
            let result = match system {
                Some(prompt) => {
                    let mut conv = Conversation::with_system(prompt);
                    tokio::select! {
                        _ = cancel => Err(chatstream_core::ChatStreamError::Cancelled),
                        r = client.ask_in(&mut conv, &question, Some(&mut print)) => r,
                    }
                }
                None => client.ask_until(&question, Some(&mut print), cancel).await,
            };
            println!();
            result?;
        }
    }

    Ok(())
}

/// Resolves when the signal arrives. If the handler could not be
/// installed it never resolves, so the request is not cancelled.
async fn interrupted<F, E>(signal: F)
where
    F: Future<Output = Result<(), E>>,
{
    if signal.await.is_err() {
        std::future::pending::<()>().await;
    }
}
