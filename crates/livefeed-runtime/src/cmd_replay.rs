//! `livefeed replay`: run recorded frames through the dispatcher offline.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use livefeed_core::{ConnectionState, Identity, Snapshot, StreamKey};
use livefeed_runtime::{DispatchOutcome, EventDispatcher, FeedConfig, LiveFeed, MemoryTransport};

use crate::cli::ReplayOpts;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub unchanged: usize,
    pub dropped: usize,
}

/// Entry point for `livefeed replay`.
pub async fn cmd_replay(config: &FeedConfig, opts: ReplayOpts) -> anyhow::Result<()> {
    let input = read_input(&opts.file)?;

    let transport = MemoryTransport::new();
    let feed = LiveFeed::new(Arc::new(transport), config.retry.clone());
    feed.set_identity(Some(Identity::new("replay", opts.account)));
    let subscription = feed.subscribe(opts.topic)?;
    let ready = subscription.wait_ready().await;
    if ready.state != ConnectionState::Open {
        anyhow::bail!("replay stream did not open: {}", ready.state);
    }

    let (snapshot, stats) = replay(feed.dispatcher(), subscription.key(), &input, opts.verbose);
    tracing::info!(
        applied = stats.applied,
        unchanged = stats.unchanged,
        dropped = stats.dropped,
        "replay: done"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    subscription.dispose();
    Ok(())
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    let mut input = String::new();
    if path.as_os_str() == "-" {
        std::io::stdin()
            .read_to_string(&mut input)
            .context("failed to read frames from stdin")?;
    } else {
        input = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    }
    Ok(input)
}

/// Dispatch every non-blank line of `input` on `key` and return the final snapshot.
pub fn replay(dispatcher: &EventDispatcher, key: &StreamKey, input: &str, verbose: bool) -> (Snapshot, ReplayStats) {
    let mut stats = ReplayStats::default();
    for (index, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let outcome = dispatcher.on_frame(key, line);
        match outcome {
            DispatchOutcome::Applied => stats.applied += 1,
            DispatchOutcome::Unchanged => stats.unchanged += 1,
            DispatchOutcome::Dropped(_) => stats.dropped += 1,
        }
        if verbose {
            eprintln!("line {}: {outcome:?}", index + 1);
        }
    }
    let snapshot = dispatcher.snapshot(key).unwrap_or_else(|| Snapshot::empty(&key.topic));
    (snapshot, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use livefeed_core::{RetryPolicy, Topic};

    #[tokio::test(start_paused = true)]
    async fn replay_merges_and_counts() {
        let feed = LiveFeed::new(Arc::new(MemoryTransport::new()), RetryPolicy::default());
        feed.set_identity(Some(Identity::new("replay", "acct1")));
        let subscription = feed.subscribe(Topic::Account).unwrap();
        subscription.wait_ready().await;

        let input = r#"
{"type":"account","payload":{"margin":10,"equity":"100.5"}}
{"type":"heartbeat"}
{"type":"unknown_xyz"}
{"type":"account","payload":{"margin":30}}
"#;
        let (snapshot, stats) = replay(feed.dispatcher(), subscription.key(), input, false);
        assert_eq!(
            stats,
            ReplayStats {
                applied: 2,
                unchanged: 1,
                dropped: 1
            }
        );
        let account = snapshot.as_account().unwrap();
        assert_eq!(account.margin, Some(30.0));
        assert_eq!(account.equity, Some(100.5));
    }
}
