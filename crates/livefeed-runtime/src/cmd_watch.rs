//! `livefeed watch`: stream one topic and print snapshots as JSON lines.

use std::io::Write;

use serde::Serialize;

use livefeed_core::{Identity, Snapshot, StreamFailure};
use livefeed_runtime::{FeedConfig, FeedEvent, LiveFeed};

use crate::cli::WatchOpts;

/// Exit code when the stream fails terminally.
pub const EXIT_UNAVAILABLE: i32 = 2;

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Line<'a> {
    Snapshot { key: String, snapshot: &'a Snapshot },
    Unavailable { key: String, failure: &'a StreamFailure },
    Closed { key: String },
}

/// Entry point for `livefeed watch`. Returns the process exit code.
pub async fn cmd_watch(config: &FeedConfig, opts: WatchOpts) -> anyhow::Result<i32> {
    let feed = LiveFeed::connect(config);
    let identity = Identity::new(opts.identity.token, opts.identity.account);
    feed.set_identity(Some(identity));

    let mut subscription = feed.subscribe(opts.topic)?;
    let key = subscription.key().to_string();
    tracing::info!(key = %key, url = %config.url, "watch: subscribed");

    let mut printed = 0usize;
    let stdout = std::io::stdout();
    loop {
        let event = tokio::select! {
            event = subscription.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("watch: interrupted");
                break;
            }
        };
        let Some(event) = event else { break };

        let line = match &event {
            FeedEvent::Snapshot(snapshot) => Line::Snapshot {
                key: key.clone(),
                snapshot,
            },
            FeedEvent::Unavailable(failure) => Line::Unavailable {
                key: key.clone(),
                failure,
            },
            FeedEvent::Closed => Line::Closed { key: key.clone() },
        };
        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, &line)?;
        writeln!(out)?;
        out.flush()?;

        match event {
            FeedEvent::Snapshot(_) => {
                printed += 1;
                if opts.max_updates.is_some_and(|max| printed >= max) {
                    break;
                }
            }
            FeedEvent::Unavailable(failure) => {
                tracing::error!(key = %key, %failure, "watch: stream unavailable");
                return Ok(EXIT_UNAVAILABLE);
            }
            FeedEvent::Closed => break,
        }
    }

    subscription.dispose();
    Ok(0)
}
