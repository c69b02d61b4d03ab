//! voice-chatbot-rs: terminal voice chatbot for local Ollama models.

mod config;
mod context;
mod conversation;
mod llm;
mod session;
mod speech;

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_MODEL: &str = "llama3";

#[derive(Parser, Debug)]
#[command(name = "voice-chatbot-rs", about = "Chat with the bot!")]
struct Args {
    /// Name of the model to use
    #[arg(short = 'm', long = "model_name", default_value = DEFAULT_MODEL)]
    model_name: String,

    /// Context filepath to use
    #[arg(short = 'c', long = "context_filename", default_value = "")]
    context_filename: String,

    /// Path to config.yaml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so they stay out of the transcript
    let filter = if args.verbose {
        EnvFilter::new("debug,reqwest=info,hyper=info,hyper_util=info")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = config::Config::load(args.config.as_deref());
    info!("voice-chatbot-rs starting (model: {})", args.model_name);

    let outcome = session::run(&args.model_name, &args.context_filename, &config).await?;
    info!(
        "Session ended after {} turns (old context deleted: {})",
        outcome.turns, outcome.replaced.deleted_old
    );

    Ok(())
}
