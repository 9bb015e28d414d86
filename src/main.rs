use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use relay::config::{LoopVariant, RelayConfig};
use relay::crypto::AesGcmCipher;
use relay::pipeline::spawn_scheduler;
use relay::relay::{Relay, default_senders};
use relay::shutdown::install_signal_handler;
use relay::store::LibSqlBackend;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initialize tracing. With a log directory, output goes to a daily-rolling
/// file; the returned guard must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let log_dir = std::env::var("RELAY_LOG_DIR").ok().map(PathBuf::from);
    let _log_guard = init_tracing(log_dir.as_deref());

    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    let Some(key) = config.encryption_key.as_ref() else {
        eprintln!("Error: RELAY_ENCRYPTION_KEY not set");
        eprintln!("  export RELAY_ENCRYPTION_KEY=$(openssl rand -base64 32)");
        std::process::exit(1);
    };
    let cipher = Arc::new(AesGcmCipher::from_base64(key).context("invalid RELAY_ENCRYPTION_KEY")?);

    eprintln!("📨 Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Loop: {} (startup {}s, every {}s)",
        match config.scheduler.variant {
            LoopVariant::Pipeline => "process/retry/archive",
            LoopVariant::ProcessOnly => "process only",
        },
        config.scheduler.startup_delay.as_secs(),
        config.scheduler.throttle.as_secs(),
    );

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let relay = Relay::build(
        backend,
        cipher,
        default_senders(),
        config.pipeline.clone(),
        config.scheduler.clone(),
    );

    let providers = relay.providers.find_all().await?;
    if providers.is_empty() {
        tracing::warn!("No providers configured; every dispatch will fail until one is added");
    } else {
        eprintln!("   Providers: {}", providers.len());
    }

    let cancel = install_signal_handler();
    let handle = spawn_scheduler(Arc::clone(&relay.scheduler), cancel);

    let sweeps = handle.await.context("scheduler task panicked")?;
    tracing::info!(sweeps, "Relay stopped");
    Ok(())
}
