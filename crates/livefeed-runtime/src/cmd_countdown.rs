//! `livefeed countdown`: tick a verification-code window until it expires.

use std::sync::Arc;

use livefeed_core::{ExpiryWindow, format_mm_ss};
use livefeed_runtime::{Clock, ExpiryWindowTimer, FeedConfig, SystemClock};

use crate::cli::CountdownOpts;

/// Entry point for `livefeed countdown`.
pub async fn cmd_countdown(config: &FeedConfig, opts: CountdownOpts) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let window = resolve_window(&opts, clock.now_ms())?;

    let timer = ExpiryWindowTimer::new(Arc::clone(&clock)).with_cadence(config.countdown_cadence());
    let mut remaining = timer.watch();
    let (expired_tx, mut expired_rx) = tokio::sync::oneshot::channel();
    let start = timer.start_window(window, move || {
        let _ = expired_tx.send(());
    });
    println!("{}", format_mm_ss(start));

    loop {
        tokio::select! {
            _ = &mut expired_rx => break,
            changed = remaining.changed() => {
                if changed.is_err() {
                    break;
                }
                let secs = *remaining.borrow_and_update();
                if secs > 0 {
                    println!("{}", format_mm_ss(secs));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                timer.stop();
                tracing::info!("countdown: stopped");
                return Ok(());
            }
        }
    }

    println!("{}", format_mm_ss(0));
    tracing::info!("countdown: expired");
    Ok(())
}

fn resolve_window(opts: &CountdownOpts, now_ms: i64) -> anyhow::Result<ExpiryWindow> {
    let created_at = opts.created_at.unwrap_or(now_ms);
    let expires_at = match (opts.expires_at, opts.ttl_secs) {
        (Some(expires_at), _) => expires_at,
        (None, Some(ttl)) => {
            let ttl_ms = i64::try_from(ttl.saturating_mul(1_000)).unwrap_or(i64::MAX);
            now_ms.saturating_add(ttl_ms)
        }
        (None, None) => anyhow::bail!("either --expires-at or --ttl-secs is required"),
    };
    if expires_at < created_at {
        anyhow::bail!("--expires-at ({expires_at}) is before the window start ({created_at})");
    }
    Ok(ExpiryWindow::new(created_at, expires_at))
}
