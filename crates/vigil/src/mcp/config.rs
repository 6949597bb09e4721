//! Tool fleet configuration file support.
//!
//! The fleet is described by a JSON file accepting both `mcpServers` and
//! `servers` as the root key. Each entry is either a stdio server
//! (`command`/`args`/`env`) or a url server (`url`, `type: "sse"`,
//! `bearerToken`). `${VAR}` and `${VAR:-default}` occurrences in string
//! values are substituted from the environment at load time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// File names probed, in order, when no explicit path is given.
const SEARCH_NAMES: &[&str] = &["mcp.json", ".mcp.json", "mcp_config.json"];

/// Configuration for one tool server.
#[derive(Debug, Clone)]
pub struct ToolServerConfig {
    pub name: String,
    pub transport: ServerTransportConfig,
    pub description: Option<String>,
}

/// Transport variants for a tool server.
#[derive(Debug, Clone)]
pub enum ServerTransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        headers: HashMap<String, String>,
        bearer_token: Option<String>,
    },
}

impl ToolServerConfig {
    pub fn is_stdio(&self) -> bool {
        matches!(self.transport, ServerTransportConfig::Stdio { .. })
    }
}

/// The whole tool fleet, in file order.
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    pub servers: Vec<ToolServerConfig>,
}

/// Raw JSON shape of one server entry before variant resolution.
#[derive(Debug, Deserialize)]
struct RawServer {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    url: Option<String>,
    #[serde(rename = "type")]
    _kind: Option<String>,
    #[serde(rename = "bearerToken")]
    bearer_token: Option<String>,
    description: Option<String>,
}

impl FleetConfig {
    /// Load the fleet from an explicit path, or probe the search list and the
    /// user's `~/.vigil/mcp.json`. A missing file yields an empty fleet.
    pub fn discover(explicit: Option<&Path>) -> CoreResult<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => find_config_file(),
        };
        match path {
            Some(p) if p.exists() => Self::load(&p),
            Some(p) => Err(CoreError::Validation(format!(
                "tool fleet config not found: {}",
                p.display()
            ))),
            None => {
                log::warn!("no tool fleet config found, running with an empty toolchain");
                Ok(Self::default())
            }
        }
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Validation(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse a config document, interpolating environment variables in every
    /// string value first.
    pub fn parse(content: &str) -> CoreResult<Self> {
        let mut root: Value = serde_json::from_str(content)?;
        interpolate_env_vars(&mut root);

        let servers_obj = root
            .get("mcpServers")
            .or_else(|| root.get("servers"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut servers = Vec::with_capacity(servers_obj.len());
        for (name, body) in servers_obj {
            let raw: RawServer = serde_json::from_value(body)?;
            let transport = match (&raw.command, &raw.url) {
                (Some(command), _) => ServerTransportConfig::Stdio {
                    command: command.clone(),
                    args: raw.args.clone(),
                    env: raw.env.clone(),
                },
                (None, Some(url)) => ServerTransportConfig::Sse {
                    url: url.clone(),
                    // Env entries double as headers for url servers.
                    headers: raw.env.clone(),
                    bearer_token: raw.bearer_token.clone(),
                },
                (None, None) => {
                    return Err(CoreError::Validation(format!(
                        "server '{}' has neither 'command' nor 'url'",
                        name
                    )));
                }
            };
            servers.push(ToolServerConfig {
                name,
                transport,
                description: raw.description,
            });
        }

        Ok(Self { servers })
    }

    pub fn get(&self, name: &str) -> Option<&ToolServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }
}

fn find_config_file() -> Option<PathBuf> {
    for name in SEARCH_NAMES {
        let candidate = PathBuf::from(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    if let Some(home) = dirs::home_dir() {
        let candidate = home.join(".vigil").join("mcp.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Substitute `${VAR}` and `${VAR:-default}` in every string value in place.
/// An unset variable without a default becomes the empty string.
fn interpolate_env_vars(value: &mut Value) {
    match value {
        Value::String(s) => *s = interpolate_str(s),
        Value::Array(arr) => {
            for item in arr {
                interpolate_env_vars(item);
            }
        }
        Value::Object(map) => {
            for (_key, val) in map.iter_mut() {
                interpolate_env_vars(val);
            }
        }
        _ => {}
    }
}

fn interpolate_str(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex is valid");
    re.replace_all(content, |caps: &Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str());
        match (std::env::var(var_name), default) {
            (Ok(val), _) => val,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => String::new(),
        }
    })
    .into_owned()
}
