//! Executor plugin that echoes commands back.
//!
//! Two commands are special: `env NAME` answers with the value of `NAME` in
//! the plugin environment, and `crash` exits the process with status 1.

use botkube_plugin_sdk::{ExecuteInput, ExecuteOutput, Executor, Metadata, PluginResult};
use tracing::{info, warn};

struct Echo;

#[async_trait::async_trait]
impl Executor for Echo {
    async fn execute(&self, input: ExecuteInput) -> PluginResult<ExecuteOutput> {
        let command = input.command.trim();
        if command == "crash" {
            warn!("crash requested");
            std::process::exit(1);
        }
        if let Some(name) = command.strip_prefix("env ") {
            return Ok(ExecuteOutput {
                data: std::env::var(name.trim()).unwrap_or_default(),
            });
        }
        Ok(ExecuteOutput {
            data: command.to_owned(),
        })
    }

    async fn metadata(&self) -> PluginResult<Metadata> {
        Ok(Metadata {
            description: "Echoes commands back".to_owned(),
            version: concat!("v", env!("CARGO_PKG_VERSION")).to_owned(),
            ..Metadata::default()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    botkube_plugin_sdk::init_logging();
    info!("echo executor starting");
    botkube_plugin_sdk::serve_executor(Echo).await?;
    Ok(())
}
