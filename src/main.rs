use anyhow::Result;
use clap::Parser;
use query_pilot::cli::CliState;
use query_pilot::config::AppConfig;
use std::env;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(
    name = "query-pilot",
    version,
    about = "Ask questions about your data in plain language"
)]
struct Args {
    /// Configuration file (defaults to the standard search locations)
    #[arg(short, long, env = "QUERY_PILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Answer a single question and exit
    #[arg(short, long)]
    ask: Option<String>,

    /// Scope learned corrections to this user
    #[arg(short, long, env = "QUERY_PILOT_USER")]
    user: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load_from_file(path)?,
        None => AppConfig::load()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    // Initialize logging based on config
    let default_directive = format!("query_pilot={}", config.logging.level.to_lowercase());
    let env_override = env::var("RUST_LOG").unwrap_or_default();
    let combined_filter = if env_override.trim().is_empty() {
        default_directive
    } else if env_override.contains("query_pilot") {
        env_override
    } else {
        format!("{},{}", env_override, default_directive)
    };

    tracing_subscriber::fmt()
        .with_env_filter(combined_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut cli = CliState::new_with_config(config)?.for_user(args.user);

    match args.ask {
        Some(question) => {
            let mut stdout = tokio::io::stdout();
            cli.ask(&question, &mut stdout).await?;
            stdout.flush().await?;
        }
        None => cli.run_repl().await?,
    }
    Ok(())
}
