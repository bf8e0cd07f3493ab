// Passby simulation host: two stations meet over an in-memory link and swap blocks.

mod config;
mod link;

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("passby-sim {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load(config_path.as_deref())?;
    info!(?cfg, "config loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::SimConfig) -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut link = link::Link::new(&cfg, tx)?;
    let ggid = link.discover()?;
    info!(ggid = %ggid, "session started");

    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.frame_period_ms));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut completed = 0usize;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            res = &mut shutdown => {
                res?;
                warn!(frames = link.frames(), "interrupted");
                break;
            }
        }
        if !link.is_executing() {
            break;
        }
        if link.frames() >= cfg.max_frames {
            warn!(frames = link.frames(), "frame limit reached");
            break;
        }
        let frame = link.step();
        if frame.parent_done || frame.child_done {
            debug!(frame = link.frames(), parent = frame.parent_done, child = frame.child_done, "completion frame");
        }
        while let Ok((role, done)) = rx.try_recv() {
            completed += 1;
            info!(%role, ggid = %done.ggid, received = done.received.len(), "exchange complete");
        }
    }

    info!(
        parent = %link.parent().current_ggid(),
        child = %link.child().current_ggid(),
        "closing link"
    );
    link.disconnect();
    info!(frames = link.frames(), completed, "done");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
