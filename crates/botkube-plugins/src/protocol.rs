//! Plugin wire contract: handshake line and JSON-lines frames.
//!
//! The agent starts a plugin with the magic cookie and protocol version in
//! its environment. The plugin answers with a single handshake line on
//! stdout:
//!
//! ```text
//! CORE|APP|NETWORK|KIND|PROTOCOL      e.g. 1|1|stdio|executor|jsonl
//! ```
//!
//! after which stdin/stdout carry one JSON frame per line. Requests are
//! `{"id","method","params"}`; replies are `{"id","result"}`,
//! `{"id","error"}` or, for streams, any number of `{"id","event"}`
//! followed by a final result for the same id.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::PluginKind;

/// Environment variable carrying the magic cookie.
pub const MAGIC_COOKIE_KEY: &str = "BOTKUBE_PLUGIN_MAGIC_COOKIE";

/// Shared secret proving the binary was started by the agent.
pub const MAGIC_COOKIE_VALUE: &str = "7f2a3c9d1e4b8a6f5c0d2e9b7a1f3c8d";

/// Environment variable carrying the application protocol version.
pub const PROTOCOL_VERSION_KEY: &str = "BOTKUBE_PLUGIN_PROTOCOL_VERSION";

/// Version of the handshake format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Version of the executor/source RPC surface.
pub const APP_PROTOCOL_VERSION: u32 = 1;

/// The only supported transport.
pub const NETWORK_STDIO: &str = "stdio";

/// The only supported framing.
pub const PROTOCOL_JSONL: &str = "jsonl";

/// RPC method names.
pub mod method {
    /// Executor: run a command.
    pub const EXECUTE: &str = "execute";
    /// Both kinds: describe the plugin.
    pub const METADATA: &str = "metadata";
    /// Source: start streaming events.
    pub const STREAM: &str = "stream";
}

/// The parsed handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Handshake format version.
    pub core_version: u32,
    /// RPC surface version.
    pub app_version: u32,
    /// Transport (`stdio`).
    pub network: String,
    /// Kind of client the plugin dispenses.
    pub kind: String,
    /// Framing (`jsonl`).
    pub protocol: String,
}

impl Handshake {
    /// The handshake a current plugin of `kind` sends.
    #[must_use]
    pub fn for_kind(kind: PluginKind) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: APP_PROTOCOL_VERSION,
            network: NETWORK_STDIO.to_owned(),
            kind: kind.as_str().to_owned(),
            protocol: PROTOCOL_JSONL.to_owned(),
        }
    }

    /// Parse a handshake line.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the line is malformed.
    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        let &[core, app, network, kind, protocol] = parts.as_slice() else {
            return Err(format!(
                "expected 5 '|'-separated fields, got {} in {line:?}",
                parts.len()
            ));
        };

        let core_version = core
            .parse()
            .map_err(|_| format!("invalid core protocol version '{core}'"))?;
        let app_version = app
            .parse()
            .map_err(|_| format!("invalid app protocol version '{app}'"))?;

        Ok(Self {
            core_version,
            app_version,
            network: network.to_owned(),
            kind: kind.to_owned(),
            protocol: protocol.to_owned(),
        })
    }

    /// Check versions, transport and framing against what the agent speaks.
    ///
    /// The kind is checked separately by the caller, which knows what it
    /// asked for.
    ///
    /// # Errors
    ///
    /// Returns a description of the first incompatibility.
    pub fn validate(&self) -> Result<(), String> {
        if self.core_version != CORE_PROTOCOL_VERSION {
            return Err(format!(
                "unsupported core protocol version {} (agent speaks {CORE_PROTOCOL_VERSION})",
                self.core_version
            ));
        }
        if self.app_version != APP_PROTOCOL_VERSION {
            return Err(format!(
                "unsupported app protocol version {} (agent speaks {APP_PROTOCOL_VERSION})",
                self.app_version
            ));
        }
        if self.network != NETWORK_STDIO {
            return Err(format!("unsupported network '{}'", self.network));
        }
        if self.protocol != PROTOCOL_JSONL {
            return Err(format!("unsupported protocol '{}'", self.protocol));
        }
        Ok(())
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.kind, self.protocol
        )
    }
}

/// A request from the agent to the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique per connection.
    pub id: u64,
    /// Method name, see [`method`].
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// A reply from the plugin to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Id of the request this frame answers.
    pub id: u64,
    /// Successful result. Also ends a stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// One stream event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
}

/// What a [`Frame`] carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Successful result.
    Result(Value),
    /// Error message.
    Error(String),
    /// Stream event.
    Event(Value),
}

impl Frame {
    /// A successful result.
    #[must_use]
    pub fn result(id: u64, value: Value) -> Self {
        Self {
            id,
            result: Some(value),
            error: None,
            event: None,
        }
    }

    /// An error reply.
    #[must_use]
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
            event: None,
        }
    }

    /// A stream event.
    #[must_use]
    pub fn event(id: u64, value: Value) -> Self {
        Self {
            id,
            result: None,
            error: None,
            event: Some(value),
        }
    }

    /// Classify the frame. Errors take precedence, then events; a frame with
    /// neither is a (possibly empty) result.
    #[must_use]
    pub fn into_reply(self) -> (u64, Reply) {
        let reply = match (self.error, self.event) {
            (Some(error), _) => Reply::Error(error),
            (None, Some(event)) => Reply::Event(event),
            (None, None) => Reply::Result(self.result.unwrap_or(Value::Null)),
        };
        (self.id, reply)
    }
}
