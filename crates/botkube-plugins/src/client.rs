//! Typed plugin clients and the kind registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PluginResult;
use crate::key::PluginKind;

/// What a plugin reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Plugin version.
    #[serde(default)]
    pub version: String,
    /// JSON schema of the plugin configuration.
    #[serde(default)]
    pub json_schema: serde_json::Value,
    /// Native tools the plugin expects in its dependency directory.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Input of an executor call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    /// The command as typed by the user, without the plugin prefix.
    pub command: String,
    /// Plugin configurations of every binding that routes to this plugin.
    #[serde(default)]
    pub configs: Vec<serde_json::Value>,
}

/// Output of an executor call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOutput {
    /// Rendered response.
    pub data: String,
}

/// Input of a source stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInput {
    /// Plugin configurations of every binding that routes to this plugin.
    #[serde(default)]
    pub configs: Vec<serde_json::Value>,
}

/// One event emitted by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    /// Event payload.
    pub payload: serde_json::Value,
}

/// A plugin that handles commands.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a command.
    async fn execute(&self, input: ExecuteInput) -> PluginResult<ExecuteOutput>;

    /// Describe the plugin.
    async fn metadata(&self) -> PluginResult<Metadata>;
}

/// A plugin that emits events.
#[async_trait]
pub trait Source: Send + Sync {
    /// Start streaming events. The channel closes when the stream ends.
    async fn stream(&self, input: StreamInput) -> PluginResult<mpsc::Receiver<SourceEvent>>;

    /// Describe the plugin.
    async fn metadata(&self) -> PluginResult<Metadata>;
}

/// The client a launched plugin hands out, tagged by kind.
#[derive(Clone)]
pub enum DispensedClient {
    /// An executor client.
    Executor(Arc<dyn Executor>),
    /// A source client.
    Source(Arc<dyn Source>),
}

impl DispensedClient {
    /// Kind of the dispensed client.
    #[must_use]
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Executor(_) => PluginKind::Executor,
            Self::Source(_) => PluginKind::Source,
        }
    }
}

impl std::fmt::Debug for DispensedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DispensedClient").field(&self.kind()).finish()
    }
}

/// Maps a plugin kind to its typed client.
///
/// Implemented for `dyn Executor` and `dyn Source`; this is the registry the
/// runtime uses to assert that a plugin dispensed the interface its
/// configuration asked for.
#[async_trait]
pub trait PluginClient: Send + Sync + 'static {
    /// The kind this client serves.
    const KIND: PluginKind;

    /// Extract the typed client, handing the value back on a kind mismatch.
    ///
    /// # Errors
    ///
    /// Returns the original client if it is of another kind.
    fn from_dispensed(client: DispensedClient) -> Result<Arc<Self>, DispensedClient>;

    /// Fetch the plugin's metadata.
    async fn describe(&self) -> PluginResult<Metadata>;
}

#[async_trait]
impl PluginClient for dyn Executor {
    const KIND: PluginKind = PluginKind::Executor;

    fn from_dispensed(client: DispensedClient) -> Result<Arc<Self>, DispensedClient> {
        match client {
            DispensedClient::Executor(executor) => Ok(executor),
            other @ DispensedClient::Source(_) => Err(other),
        }
    }

    async fn describe(&self) -> PluginResult<Metadata> {
        self.metadata().await
    }
}

#[async_trait]
impl PluginClient for dyn Source {
    const KIND: PluginKind = PluginKind::Source;

    fn from_dispensed(client: DispensedClient) -> Result<Arc<Self>, DispensedClient> {
        match client {
            DispensedClient::Source(source) => Ok(source),
            other @ DispensedClient::Executor(_) => Err(other),
        }
    }

    async fn describe(&self) -> PluginResult<Metadata> {
        self.metadata().await
    }
}
