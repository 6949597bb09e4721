//! MCP tool-server layer.
//!
//! A fleet of external tool servers is described by [`config::FleetConfig`],
//! spoken to over [`transport::ToolTransport`] connections (stdio child
//! process or SSE), wrapped one-per-server by [`client::ToolClient`] and
//! aggregated behind [`broker::ToolBroker`].

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;

pub use broker::{ServerCacheStatus, ToolBroker};
pub use client::ToolClient;
pub use config::{FleetConfig, ServerTransportConfig, ToolServerConfig};
pub use transport::{RmcpTransportFactory, ToolTransport, TransportFactory};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A callable tool as advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Raw JSON Schema of the arguments as the server sent it.
    pub input_schema: Value,
}

/// A renderable prompt as advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A readable resource as advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: String,
}
