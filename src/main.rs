use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use pdd_runtime::model::OpenAiCompatClient;
use pdd_runtime::{AgentRuntime, AppError, ProviderConfig, RuntimeConfig, TurnStatus};

/// Used when `RUST_LOG` is unset. The library logs under `pdd_runtime`.
const DEFAULT_LOG_FILTER: &str = "pdd_runtime=debug,pdd=debug,info";

/// Run one agent turn inside a workspace and print its events as JSON lines.
#[derive(Debug, Parser)]
#[command(name = "pdd", version, about)]
struct Cli {
    /// Workspace slug; the directory is created under the workspace base dir.
    #[arg(short, long)]
    workspace: String,

    /// Run commands inside a container instead of on the host.
    #[arg(long)]
    container: bool,

    #[arg(long)]
    max_iterations: Option<usize>,

    /// Task for the agent.
    message: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.parse().expect("valid env filter")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(TurnStatus::Finished) => ExitCode::SUCCESS,
        Ok(TurnStatus::Cancelled) => ExitCode::from(130),
        Ok(_) => ExitCode::FAILURE,
        Err(error) => {
            tracing::error!("{error}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<TurnStatus, AppError> {
    let mut config = RuntimeConfig::from_env()?;
    if cli.container {
        config.use_container = true;
    }
    if let Some(max) = cli.max_iterations {
        config.max_iterations = max;
    }

    let provider = ProviderConfig::from_env()?;
    let model = Arc::new(OpenAiCompatClient::new(&provider)?);
    let runtime = AgentRuntime::from_config(&config, model)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    let mut stream = runtime.invoke(&cli.workspace, Vec::new(), cli.message, cancel);
    let mut stdout = std::io::stdout().lock();
    while let Some(envelope) = stream.next().await {
        let line = serde_json::to_string(&envelope)
            .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
    }
    drop(stdout);

    let turn = stream.join().await?;
    Ok(turn.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_enables_library_debug_logs() {
        let library_target = std::any::type_name::<pdd_runtime::RuntimeConfig>()
            .split("::")
            .next()
            .unwrap_or_default();
        assert!(DEFAULT_LOG_FILTER
            .split(',')
            .any(|directive| directive == format!("{library_target}=debug")));
        assert!(DEFAULT_LOG_FILTER
            .parse::<tracing_subscriber::EnvFilter>()
            .is_ok());
    }

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::parse_from(["pdd", "-w", "demo", "--max-iterations", "3", "fix it"]);
        assert_eq!(cli.workspace, "demo");
        assert_eq!(cli.max_iterations, Some(3));
        assert!(!cli.container);
        assert_eq!(cli.message, "fix it");
    }
}
