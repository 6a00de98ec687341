//! Source plugin that emits a fixed number of numbered events.
//!
//! The first plugin configuration may set `count` (default 3) and
//! `interval_ms` (default 10).

use std::time::Duration;

use botkube_plugin_sdk::{Metadata, PluginResult, Source, SourceEvent, StreamInput};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TickerConfig {
    count: u64,
    interval_ms: u64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            count: 3,
            interval_ms: 10,
        }
    }
}

struct Ticker;

#[async_trait::async_trait]
impl Source for Ticker {
    async fn stream(&self, input: StreamInput) -> PluginResult<mpsc::Receiver<SourceEvent>> {
        let config: TickerConfig = match input.configs.into_iter().next() {
            Some(raw) => serde_json::from_value(raw)?,
            None => TickerConfig::default(),
        };

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
            for tick in 1..=config.count {
                ticks.tick().await;
                debug!(tick, "emitting event");
                let event = SourceEvent {
                    payload: serde_json::json!({ "tick": tick }),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn metadata(&self) -> PluginResult<Metadata> {
        Ok(Metadata {
            description: "Emits numbered ticks".to_owned(),
            version: concat!("v", env!("CARGO_PKG_VERSION")).to_owned(),
            ..Metadata::default()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    botkube_plugin_sdk::init_logging();
    botkube_plugin_sdk::serve_source(Ticker).await?;
    Ok(())
}
