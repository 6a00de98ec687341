//! Serve botkube plugins.
//!
//! A plugin binary implements [`Executor`] or [`Source`] and hands it to
//! [`serve_executor`] or [`serve_source`]. The server checks that the agent
//! started the process, prints the handshake line on stdout and then answers
//! JSON-lines requests until the agent closes stdin.
//!
//! Stdout belongs to the protocol. Plugins log to stderr, which the agent
//! forwards into its own log; [`init_logging`] sets that up.
//!
//! ```rust,no_run
//! use botkube_plugin_sdk::{ExecuteInput, ExecuteOutput, Executor, Metadata, PluginResult};
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl Executor for Hello {
//!     async fn execute(&self, input: ExecuteInput) -> PluginResult<ExecuteOutput> {
//!         Ok(ExecuteOutput { data: format!("hello, {}", input.command) })
//!     }
//!
//!     async fn metadata(&self) -> PluginResult<Metadata> {
//!         Ok(Metadata { version: "v0.1.0".into(), ..Metadata::default() })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), botkube_plugin_sdk::ServeError> {
//!     botkube_plugin_sdk::init_logging();
//!     botkube_plugin_sdk::serve_executor(Hello).await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::sync::Arc;

use botkube_plugins::protocol::{
    APP_PROTOCOL_VERSION, Frame, Handshake, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
    PROTOCOL_VERSION_KEY, Request, method,
};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub use botkube_plugins::{
    DispensedClient, ExecuteInput, ExecuteOutput, Executor, Metadata, PluginError, PluginResult,
    Source, SourceEvent, StreamInput,
};

/// Frames queued for stdout before request handlers wait.
const FRAME_BUFFER: usize = 64;

/// Variable controlling the plugin's log level.
pub const LOG_LEVEL_ENV: &str = "BOTKUBE_PLUGIN_LOG_LEVEL";

/// Errors that stop a plugin server.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The process was not started by the agent.
    #[error("this binary is a botkube plugin and must be started by the botkube agent")]
    NotLaunchedByAgent,

    /// The agent speaks another protocol version.
    #[error("agent requested protocol version {requested}, plugin speaks {APP_PROTOCOL_VERSION}")]
    UnsupportedProtocol {
        /// Version the agent asked for.
        requested: String,
    },

    /// Reading or writing the stdio pipes failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for the plugin server.
pub type ServeResult<T> = Result<T, ServeError>;

/// Log to stderr at the level named by `BOTKUBE_PLUGIN_LOG_LEVEL` (default
/// `info`). Failures are ignored; the plugin works without logs.
pub fn init_logging() {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_owned());
    let mut config = botkube_telemetry::LogConfig::new(level)
        .with_format(botkube_telemetry::LogFormat::Compact)
        .without_timestamps();
    config.ansi = false;
    let _ = botkube_telemetry::setup_logging(&config);
}

/// Serve `executor` on stdin/stdout.
///
/// # Errors
///
/// See [`serve`].
pub async fn serve_executor(executor: impl Executor + 'static) -> ServeResult<()> {
    serve(DispensedClient::Executor(Arc::new(executor))).await
}

/// Serve `source` on stdin/stdout.
///
/// # Errors
///
/// See [`serve`].
pub async fn serve_source(source: impl Source + 'static) -> ServeResult<()> {
    serve(DispensedClient::Source(Arc::new(source))).await
}

/// Serve `client` on stdin/stdout after checking the agent's environment.
///
/// # Errors
///
/// Returns [`ServeError::NotLaunchedByAgent`] when the magic cookie is
/// missing, [`ServeError::UnsupportedProtocol`] on a version mismatch, or an
/// I/O error if stdout breaks.
pub async fn serve(client: DispensedClient) -> ServeResult<()> {
    check_environment(|key| std::env::var(key).ok())?;
    serve_with(client, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

fn check_environment(var: impl Fn(&str) -> Option<String>) -> ServeResult<()> {
    if var(MAGIC_COOKIE_KEY).as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err(ServeError::NotLaunchedByAgent);
    }
    if let Some(requested) = var(PROTOCOL_VERSION_KEY)
        && requested.trim() != APP_PROTOCOL_VERSION.to_string()
    {
        return Err(ServeError::UnsupportedProtocol { requested });
    }
    Ok(())
}

/// Serve `client` on arbitrary pipes: print the handshake on `writer`, then
/// answer requests read from `reader` until it reaches EOF.
///
/// Requests are handled concurrently; replies may arrive out of order.
///
/// # Errors
///
/// Returns an error if either pipe fails.
pub async fn serve_with<R, W>(client: DispensedClient, reader: R, mut writer: W) -> ServeResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let handshake = Handshake::for_kind(client.kind());
    writer.write_all(format!("{handshake}\n").as_bytes()).await?;
    writer.flush().await?;
    debug!(%handshake, "handshake sent");

    let (frames, queued) = mpsc::channel(FRAME_BUFFER);
    let writer_task = tokio::spawn(write_frames(writer, queued));
    let mut handlers = JoinSet::new();

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                handlers.spawn(handle(client.clone(), request, frames.clone()));
            },
            Err(e) => warn!(error = %e, "discarding malformed request"),
        }
        while handlers.try_join_next().is_some() {}
    }

    debug!("agent closed the connection");
    handlers.shutdown().await;
    drop(frames);
    writer_task.await.map_err(|e| ServeError::Io(std::io::Error::other(e)))?
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::Receiver<Frame>) -> ServeResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle(client: DispensedClient, request: Request, frames: mpsc::Sender<Frame>) {
    let Request {
        id,
        method: name,
        params,
    } = request;
    debug!(id, method = %name, "request received");

    let outcome = match (name.as_str(), &client) {
        (method::METADATA, DispensedClient::Executor(executor)) => {
            encode(executor.metadata().await)
        },
        (method::METADATA, DispensedClient::Source(source)) => encode(source.metadata().await),
        (method::EXECUTE, DispensedClient::Executor(executor)) => {
            match serde_json::from_value::<ExecuteInput>(params) {
                Ok(input) => encode(executor.execute(input).await),
                Err(e) => Err(format!("invalid execute params: {e}")),
            }
        },
        (method::STREAM, DispensedClient::Source(source)) => {
            match serde_json::from_value::<StreamInput>(params) {
                Ok(input) => match source.stream(input).await {
                    Ok(mut events) => {
                        while let Some(event) = events.recv().await {
                            if frames.send(Frame::event(id, event.payload)).await.is_err() {
                                return;
                            }
                        }
                        Ok(Value::Null)
                    },
                    Err(e) => Err(e.to_string()),
                },
                Err(e) => Err(format!("invalid stream params: {e}")),
            }
        },
        (other, client) => Err(format!(
            "method '{other}' is not served by a {} plugin",
            client.kind()
        )),
    };

    let frame = match outcome {
        Ok(value) => Frame::result(id, value),
        Err(message) => Frame::error(id, message),
    };
    let _ = frames.send(frame).await;
}

fn encode<T: Serialize>(result: PluginResult<T>) -> Result<Value, String> {
    let value = result.map_err(|e| e.to_string())?;
    serde_json::to_value(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use botkube_plugins::rpc::{RpcConnection, RpcExecutor, RpcSource};
    use tokio::io::{BufReader, duplex};

    use super::*;

    struct Upper;

    #[async_trait::async_trait]
    impl Executor for Upper {
        async fn execute(&self, input: ExecuteInput) -> PluginResult<ExecuteOutput> {
            Ok(ExecuteOutput {
                data: input.command.to_uppercase(),
            })
        }

        async fn metadata(&self) -> PluginResult<Metadata> {
            Ok(Metadata {
                version: "v1.2.3".into(),
                ..Metadata::default()
            })
        }
    }

    struct Counter;

    #[async_trait::async_trait]
    impl Source for Counter {
        async fn stream(&self, _input: StreamInput) -> PluginResult<mpsc::Receiver<SourceEvent>> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                for n in 1..=3 {
                    let _ = tx
                        .send(SourceEvent {
                            payload: serde_json::json!(n),
                        })
                        .await;
                }
            });
            Ok(rx)
        }

        async fn metadata(&self) -> PluginResult<Metadata> {
            Ok(Metadata::default())
        }
    }

    /// Serve `client` in the background and return the agent's reader and
    /// writer, with the handshake line already consumed.
    async fn spawn_server(
        client: DispensedClient,
    ) -> (BufReader<tokio::io::DuplexStream>, tokio::io::DuplexStream, String) {
        let (agent_out, plugin_in) = duplex(4096);
        let (plugin_out, agent_in) = duplex(4096);
        tokio::spawn(serve_with(client, BufReader::new(plugin_in), plugin_out));

        let mut reader = BufReader::new(agent_in);
        let mut handshake = String::new();
        reader.read_line(&mut handshake).await.unwrap();
        (reader, agent_out, handshake)
    }

    #[test]
    fn environment_must_carry_the_cookie() {
        let missing = check_environment(|_| None);
        assert!(matches!(missing, Err(ServeError::NotLaunchedByAgent)));

        let agent = |key: &str| match key {
            MAGIC_COOKIE_KEY => Some(MAGIC_COOKIE_VALUE.to_owned()),
            PROTOCOL_VERSION_KEY => Some("1".to_owned()),
            _ => None,
        };
        assert!(check_environment(agent).is_ok());

        let future_agent = |key: &str| match key {
            MAGIC_COOKIE_KEY => Some(MAGIC_COOKIE_VALUE.to_owned()),
            PROTOCOL_VERSION_KEY => Some("7".to_owned()),
            _ => None,
        };
        assert!(matches!(
            check_environment(future_agent),
            Err(ServeError::UnsupportedProtocol { .. })
        ));
    }

    #[tokio::test]
    async fn executor_round_trip() {
        let (reader, writer, handshake) =
            spawn_server(DispensedClient::Executor(Arc::new(Upper))).await;
        let parsed = Handshake::parse(&handshake).unwrap();
        assert_eq!(parsed.kind, "executor");
        parsed.validate().unwrap();

        let executor = RpcExecutor::new(RpcConnection::new(reader, writer, "upper"));
        assert_eq!(executor.metadata().await.unwrap().version, "v1.2.3");
        let out = executor
            .execute(ExecuteInput {
                command: "get pods".into(),
                configs: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(out.data, "GET PODS");
    }

    #[tokio::test]
    async fn source_stream_ends_with_result() {
        let (reader, writer, handshake) =
            spawn_server(DispensedClient::Source(Arc::new(Counter))).await;
        assert!(handshake.contains("|source|"));

        let source = RpcSource::new(RpcConnection::new(reader, writer, "counter"));
        let mut events = source.stream(StreamInput::default()).await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event.payload);
        }
        assert_eq!(seen, vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)]);
    }

    #[tokio::test]
    async fn unsupported_method_is_an_error_reply() {
        let (reader, writer, _) = spawn_server(DispensedClient::Source(Arc::new(Counter))).await;
        let conn = RpcConnection::new(reader, writer, "counter");

        let err = conn
            .call::<_, Value>(method::EXECUTE, &ExecuteInput::default())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, PluginError::Rpc { message, .. } if message.contains("source plugin")),
            "{err}"
        );
    }
}
