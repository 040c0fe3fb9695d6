//! livefeed: command-line front end for the live telemetry layer.

use clap::Parser;

use livefeed_runtime::FeedConfig;

mod cli;
mod cmd_countdown;
mod cmd_replay;
mod cmd_watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // Logs go to stderr; stdout carries the JSON output.
    let filter = std::env::var("LIVEFEED_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => FeedConfig::load(path)?,
        None => FeedConfig::default(),
    };

    match args.command {
        cli::Command::Watch(opts) => {
            if let Some(url) = &opts.url {
                config.url.clone_from(url);
                config.validate()?;
            }
            let exit_code = cmd_watch::cmd_watch(&config, opts).await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
        cli::Command::Replay(opts) => {
            cmd_replay::cmd_replay(&config, opts).await?;
        }
        cli::Command::Countdown(opts) => {
            cmd_countdown::cmd_countdown(&config, opts).await?;
        }
    }

    Ok(())
}
