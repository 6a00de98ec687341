//! Source event dispatch.
//!
//! Every enabled source gets one stream, opened with the configurations of
//! all bindings that enable it. When the health monitor relaunches a source
//! its key arrives on the scheduler channel and the stream is reopened
//! against the new instance.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use botkube_config::Config;
use botkube_plugins::{PluginKey, PluginManager, Source, StreamInput};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Plugin configurations per enabled source, in binding order.
pub(crate) fn source_configs(
    config: &Config,
) -> Result<HashMap<PluginKey, Vec<serde_json::Value>>> {
    let mut configs: HashMap<PluginKey, Vec<serde_json::Value>> = HashMap::new();
    for bindings in config.sources.values() {
        for (raw, binding) in bindings.iter().filter(|(_, b)| b.enabled) {
            let key = PluginKey::parse(raw)?;
            let value = serde_json::to_value(&binding.config)
                .with_context(|| format!("converting configuration of source '{raw}'"))?;
            configs.entry(key).or_default().push(value);
        }
    }
    Ok(configs)
}

/// Forwards source events and resubscribes relaunched sources.
pub(crate) struct SourceDispatcher {
    manager: Arc<PluginManager>,
    configs: HashMap<PluginKey, Vec<serde_json::Value>>,
    streams: HashMap<PluginKey, CancellationToken>,
    tasks: TaskTracker,
}

impl SourceDispatcher {
    pub(crate) fn new(
        manager: Arc<PluginManager>,
        configs: HashMap<PluginKey, Vec<serde_json::Value>>,
    ) -> Self {
        Self {
            manager,
            configs,
            streams: HashMap::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Open every stream, then reopen streams of relaunched sources until
    /// `cancel` fires.
    pub(crate) async fn run(
        mut self,
        mut relaunched: mpsc::Receiver<PluginKey>,
        cancel: CancellationToken,
    ) {
        for key in self.manager.source_keys() {
            self.subscribe(key, &cancel);
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(key) = relaunched.recv() => {
                    info!(plugin = %key, "source relaunched, reopening stream");
                    self.subscribe(key, &cancel);
                },
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
    }

    fn subscribe(&mut self, key: PluginKey, cancel: &CancellationToken) {
        if let Some(previous) = self.streams.remove(&key) {
            previous.cancel();
        }

        let source = match self.manager.get_source(&key.to_string()) {
            Ok(source) => source,
            Err(e) => {
                warn!(plugin = %key, error = %e, "source not available");
                return;
            },
        };
        let input = StreamInput {
            configs: self.configs.get(&key).cloned().unwrap_or_default(),
        };

        let token = cancel.child_token();
        self.streams.insert(key.clone(), token.clone());
        self.tasks.spawn(forward_events(key, source, input, token));
    }
}

async fn forward_events(
    key: PluginKey,
    source: Arc<dyn Source>,
    input: StreamInput,
    cancel: CancellationToken,
) {
    let mut events = match source.stream(input).await {
        Ok(events) => events,
        Err(e) => {
            warn!(plugin = %key, error = %e, "failed to open source stream");
            return;
        },
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => info!(plugin = %key, payload = %event.payload, "source event"),
                None => {
                    debug!(plugin = %key, "source stream ended");
                    break;
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configs_are_collected_per_enabled_source() {
        let config: Config = toml::from_str(
            r#"
[sources.cluster-a."botkube/ticker"]
enabled = true
config = { count = 1 }

[sources.cluster-b."botkube/ticker"]
enabled = true
config = { count = 2 }

[sources.cluster-b."botkube/kubernetes"]
enabled = false
"#,
        )
        .unwrap();

        let configs = source_configs(&config).unwrap();
        assert_eq!(configs.len(), 1);
        let ticker = &configs[&PluginKey::new("botkube", "ticker")];
        assert_eq!(
            ticker,
            &vec![
                serde_json::json!({ "count": 1 }),
                serde_json::json!({ "count": 2 }),
            ]
        );
    }

    #[test]
    fn malformed_source_key_is_rejected() {
        let config: Config = toml::from_str(
            r#"
[sources.cluster."ticker"]
enabled = true
"#,
        )
        .unwrap();

        assert!(source_configs(&config).is_err());
    }
}
