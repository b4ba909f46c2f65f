//! CLIP entry point.
//!
//! Wires the config into the proxy and serves MCP on stdin/stdout. All
//! logging goes to stderr, since stdout carries the protocol.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 fatal runtime
//! error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clip_policy::PolicyResolver;
use clip_proxy::{CallPipeline, ProxyServer, UpstreamRegistry};
use clip_shaping::{EscalationTracker, OpenAiClient, PiiMasker, ResponseCache, Summarizer};
use clip_types::config::StageTimeouts;
use clip_types::traits::ChatCompletionClient;
use clip_types::{config_loader, ClipError};

/// How often expired cache entries and stale escalation records are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Response-shaping MCP proxy")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long, default_value = "clip.config.json")]
    config: PathBuf,
    /// Write an example configuration file and exit.
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.init {
        return write_example(&args.config);
    }

    let config = match config_loader::load(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("clip: {e}");
            return ExitCode::from(1);
        }
    };

    let level = config
        .logging
        .as_ref()
        .and_then(|l| l.level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: Arc<clip_types::config::ClipConfig>) -> Result<(), ClipError> {
    let timeouts = StageTimeouts::from_config(config.timeouts.as_ref());
    let resolver = Arc::new(PolicyResolver::new(Arc::clone(&config)));

    let registry = Arc::new(UpstreamRegistry::new(Arc::clone(&resolver), timeouts));
    registry.connect_all(&config.upstreams).await;
    let live = registry.live_upstreams().await;
    info!(upstreams = live.len(), "proxy ready, serving MCP on stdio");

    let summarizer_client: Arc<dyn ChatCompletionClient> =
        Arc::new(OpenAiClient::new(&config.compression.llm, timeouts.summarizer)?);
    let masker_client: Option<Arc<dyn ChatCompletionClient>> = config
        .masking
        .as_ref()
        .and_then(|m| m.llm.as_ref())
        .map(|llm| OpenAiClient::new(llm, timeouts.masker))
        .transpose()?
        .map(|client| Arc::new(client) as Arc<dyn ChatCompletionClient>);

    let cache: ResponseCache<clip_types::ToolCallResult> = ResponseCache::new();
    let escalation = Arc::new(EscalationTracker::new(resolver.retry_escalation()));
    let pipeline = CallPipeline::new(
        Arc::clone(&registry),
        Arc::clone(&resolver),
        cache.clone(),
        Arc::new(PiiMasker::with_fallback(masker_client)),
        Arc::new(Summarizer::new(summarizer_client)),
        Arc::clone(&escalation),
    );

    // Background sweep keeps memory bounded; correctness comes from the
    // lazy eviction on read.
    {
        let cache = cache.clone();
        let escalation = Arc::clone(&escalation);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                cache.sweep().await;
                escalation.prune().await;
            }
        });
    }

    let server = ProxyServer::new(Arc::clone(&registry), pipeline);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        outcome = server.run(stdin, stdout) => {
            registry.shutdown().await;
            outcome
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, closing upstream sessions");
            registry.shutdown().await;
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                // Fall back to SIGINT only.
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn write_example(path: &PathBuf) -> ExitCode {
    if path.exists() {
        eprintln!("clip: refusing to overwrite existing {}", path.display());
        return ExitCode::from(1);
    }
    match std::fs::write(path, config_loader::example()) {
        Ok(()) => {
            eprintln!("clip: wrote example config to {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("clip: failed to write {}: {e}", path.display());
            ExitCode::from(1)
        }
    }
}
