//! Aggregation over the tool-server fleet with per-server cache TTLs.
//!
//! Each server's [`ToolClient`] entry carries a load timestamp and a TTL that
//! is deterministically staggered by hashing the server name, so the fleet
//! never reloads in a convoy. Expiry is checked on every public operation;
//! only expired servers reload, under a broker-wide lock. Callers that
//! arrive while a reload is running get the current (possibly stale)
//! aggregate view instead of blocking.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

use super::client::ToolClient;
use super::config::FleetConfig;
use super::transport::TransportFactory;
use super::{PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use crate::error::{CoreError, CoreResult};

/// Base TTL for a server's capability cache, in minutes.
const BASE_TTL_MINUTES: i64 = 60;

/// TTL bounds after staggering.
const MIN_TTL_MINUTES: i64 = 5;
const MAX_TTL_MINUTES: i64 = 24 * 60;

struct ServerCacheEntry {
    client: Arc<ToolClient>,
    loaded_at: Instant,
    ttl: Duration,
    load_count: u32,
}

impl ServerCacheEntry {
    fn is_expired(&self) -> bool {
        self.loaded_at.elapsed() > self.ttl
    }

    fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }
}

/// Aggregate capability snapshot across the fleet, tagged with the owning
/// server name.
#[derive(Debug, Clone, Default)]
pub struct ToolchainView {
    pub tools: Vec<(String, ToolDescriptor)>,
    pub prompts: Vec<(String, PromptDescriptor)>,
    pub resources: Vec<(String, ResourceDescriptor)>,
}

/// Operator-facing status of one cached server.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerCacheStatus {
    pub name: String,
    pub age_secs: u64,
    pub ttl_secs: u64,
    pub expired: bool,
    pub load_count: u32,
    pub last_error: Option<String>,
}

/// Owns the fleet's [`ToolClient`]s and serves aggregate views.
pub struct ToolBroker {
    config: FleetConfig,
    factory: Arc<dyn TransportFactory>,
    entries: RwLock<HashMap<String, ServerCacheEntry>>,
    view: RwLock<Arc<ToolchainView>>,
    /// Serializes reloads; `try_lock` failure means a reload is in flight and
    /// the caller should use the current view.
    reload_lock: Mutex<()>,
    base_ttl_minutes: i64,
}

impl ToolBroker {
    pub fn new(config: FleetConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            config,
            factory,
            entries: RwLock::new(HashMap::new()),
            view: RwLock::new(Arc::new(ToolchainView::default())),
            reload_lock: Mutex::new(()),
            base_ttl_minutes: BASE_TTL_MINUTES,
        }
    }

    /// Override the base TTL (tests use seconds-scale values).
    pub fn with_base_ttl_minutes(mut self, minutes: i64) -> Self {
        self.base_ttl_minutes = minutes;
        self
    }

    /// Staggered TTL for a server: hash variance of ±20 minutes around the
    /// base plus a reload-count offset cycling through 0..30, bounded to a
    /// sane range. Deterministic per name so the stagger survives restarts.
    fn ttl_for(&self, server_name: &str, load_count: u32) -> Duration {
        let hash = rapidhash::v3::rapidhash_v3(server_name.as_bytes());
        let variance = (hash % 40) as i64 - 20;
        let offset = ((load_count as i64) * 5) % 30;
        let minutes =
            (self.base_ttl_minutes + variance + offset).clamp(MIN_TTL_MINUTES, MAX_TTL_MINUTES);
        Duration::from_secs((minutes * 60) as u64)
    }

    /// Check per-server expiry and reload what is due, then rebuild the
    /// aggregate view. When another caller holds the reload lock the current
    /// view is kept as-is; nobody blocks on a reload in progress.
    pub async fn ensure_fresh(&self) {
        let Ok(_guard) = self.reload_lock.try_lock() else {
            log::debug!("tool loading already in progress, serving current toolchain view");
            return;
        };

        let mut to_load: Vec<String> = Vec::new();
        {
            let entries = self.entries.read().unwrap();
            for server in &self.config.servers {
                match entries.get(&server.name) {
                    None => to_load.push(server.name.clone()),
                    Some(entry) if entry.is_expired() => {
                        log::info!(
                            "server '{}' cache expired (age {:?}, ttl {:?}), reloading",
                            server.name,
                            entry.age(),
                            entry.ttl
                        );
                        to_load.push(server.name.clone());
                    }
                    Some(_) => {}
                }
            }
        }

        if to_load.is_empty() {
            return;
        }

        for name in to_load {
            self.reload_server(&name).await;
        }
        self.rebuild_view();
    }

    /// Stop the old client (if any) and bring up a fresh one for `name`.
    async fn reload_server(&self, name: &str) {
        let Some(server_config) = self.config.get(name).cloned() else {
            log::warn!("server '{}' is not in the fleet config, skipping", name);
            return;
        };

        let (old_client, load_count) = {
            let mut entries = self.entries.write().unwrap();
            match entries.remove(name) {
                Some(entry) => (Some(entry.client), entry.load_count + 1),
                None => (None, 1),
            }
        };
        if let Some(old) = old_client {
            old.stop().await;
        }

        let client = Arc::new(ToolClient::new(server_config, self.factory.clone()));
        if let Err(err) = client.start().await {
            log::error!("failed to start server '{}': {}", name, err);
        }
        let ttl = self.ttl_for(name, load_count);
        log::info!("loaded server '{}' (ttl {:?}, load #{})", name, ttl, load_count);

        self.entries.write().unwrap().insert(
            name.to_string(),
            ServerCacheEntry {
                client,
                loaded_at: Instant::now(),
                ttl,
                load_count,
            },
        );
    }

    fn rebuild_view(&self) {
        let entries = self.entries.read().unwrap();
        let mut view = ToolchainView::default();
        // Preserve fleet-config order so "first by insertion order" lookups
        // are stable across reloads.
        for server in &self.config.servers {
            let Some(entry) = entries.get(&server.name) else {
                continue;
            };
            for tool in entry.client.available_tools() {
                view.tools.push((server.name.clone(), tool));
            }
            for prompt in entry.client.available_prompts() {
                view.prompts.push((server.name.clone(), prompt));
            }
            for resource in entry.client.available_resources() {
                view.resources.push((server.name.clone(), resource));
            }
        }
        log::info!(
            "toolchain view rebuilt: {} tools, {} prompts, {} resources across {} servers",
            view.tools.len(),
            view.prompts.len(),
            view.resources.len(),
            entries.len()
        );
        *self.view.write().unwrap() = Arc::new(view);
    }

    fn current_view(&self) -> Arc<ToolchainView> {
        self.view.read().unwrap().clone()
    }

    fn client_for(&self, server_name: &str) -> Option<Arc<ToolClient>> {
        self.entries
            .read()
            .unwrap()
            .get(server_name)
            .map(|entry| entry.client.clone())
    }

    /// Union of every client's tool cache; empty caches contribute nothing.
    pub async fn aggregate_tools(&self) -> Vec<ToolDescriptor> {
        self.ensure_fresh().await;
        self.current_view()
            .tools
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub async fn aggregate_prompts(&self) -> Vec<PromptDescriptor> {
        self.ensure_fresh().await;
        self.current_view()
            .prompts
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub async fn aggregate_resources(&self) -> Vec<ResourceDescriptor> {
        self.ensure_fresh().await;
        self.current_view()
            .resources
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// The first client (in fleet order) whose cache contains `tool_name`.
    pub async fn find(&self, tool_name: &str) -> Option<Arc<ToolClient>> {
        self.ensure_fresh().await;
        let view = self.current_view();
        let (server, _) = view.tools.iter().find(|(_, t)| t.name == tool_name)?;
        self.client_for(server)
    }

    /// Dispatch a tool call to the owning client. An unknown tool is a
    /// tool-result error payload, consistent with the client's own policy of
    /// never throwing into the turn.
    pub async fn call(&self, tool_name: &str, args: Value) -> Value {
        match self.find(tool_name).await {
            Some(client) => client.call(tool_name, args).await,
            None => {
                log::warn!("tool '{}' not present in any server cache", tool_name);
                serde_json::json!({ "error": format!("Tool '{}' not found", tool_name) })
            }
        }
    }

    /// Render a named prompt from whichever server advertises it.
    pub async fn get_prompt(&self, name: &str, args: Value) -> CoreResult<String> {
        self.ensure_fresh().await;
        let view = self.current_view();
        let Some((server, _)) = view.prompts.iter().find(|(_, p)| p.name == name) else {
            return Err(CoreError::NotFound(format!("prompt '{}' not found", name)));
        };
        let client = self
            .client_for(server)
            .ok_or_else(|| CoreError::NotFound(format!("server '{}' not loaded", server)))?;
        client.get_prompt(name, args).await
    }

    /// Read a resource: cached client-of-origin first, then every client in
    /// fleet order as a fallback.
    pub async fn read_resource(&self, uri: &str) -> CoreResult<String> {
        self.ensure_fresh().await;
        let view = self.current_view();

        if let Some((server, _)) = view.resources.iter().find(|(_, r)| r.uri == uri) {
            if let Some(client) = self.client_for(server) {
                match client.read_resource(uri).await {
                    Ok(body) => return Ok(body),
                    Err(err) => {
                        log::debug!("cached origin '{}' failed for '{}': {}", server, uri, err);
                    }
                }
            }
        }

        let mut last_err: Option<CoreError> = None;
        for server in &self.config.servers {
            let Some(client) = self.client_for(&server.name) else {
                continue;
            };
            match client.read_resource(uri).await {
                Ok(body) if !body.is_empty() => return Ok(body),
                Ok(_) => {}
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::NotFound(format!("resource '{}' not found", uri))))
    }

    /// Operator-triggered refresh of a single server, bypassing its TTL.
    /// Unlike `ensure_fresh` this waits for any reload in progress.
    pub async fn force_reload(&self, name: &str) -> CoreResult<()> {
        if self.config.get(name).is_none() {
            return Err(CoreError::NotFound(format!(
                "server '{}' is not configured",
                name
            )));
        }
        let _guard = self.reload_lock.lock().await;
        log::info!("force reloading server '{}'", name);
        self.reload_server(name).await;
        self.rebuild_view();

        match self.client_for(name).and_then(|client| client.last_error()) {
            Some(err) => Err(CoreError::Transport(err)),
            None => Ok(()),
        }
    }

    /// Status of every cached server.
    pub async fn cache_status(&self) -> Vec<ServerCacheStatus> {
        let entries = self.entries.read().unwrap();
        self.config
            .servers
            .iter()
            .filter_map(|server| {
                entries.get(&server.name).map(|entry| ServerCacheStatus {
                    name: server.name.clone(),
                    age_secs: entry.age().as_secs(),
                    ttl_secs: entry.ttl.as_secs(),
                    expired: entry.is_expired(),
                    load_count: entry.load_count,
                    last_error: entry.client.last_error(),
                })
            })
            .collect()
    }

    /// Stop every client and clear the caches.
    pub async fn shutdown(&self) {
        let _guard = self.reload_lock.lock().await;
        let clients: Vec<Arc<ToolClient>> = {
            let mut entries = self.entries.write().unwrap();
            entries.drain().map(|(_, entry)| entry.client).collect()
        };
        for client in clients {
            client.stop().await;
        }
        *self.view.write().unwrap() = Arc::new(ToolchainView::default());
        log::info!("tool broker shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::config::{ServerTransportConfig, ToolServerConfig};
    use crate::mcp::transport::ToolTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FleetTransport {
        server: String,
        tools: Vec<&'static str>,
        resources: Vec<(&'static str, &'static str)>,
    }

    #[async_trait]
    impl ToolTransport for FleetTransport {
        async fn list_tools(&self) -> CoreResult<Vec<ToolDescriptor>> {
            Ok(self
                .tools
                .iter()
                .map(|name| ToolDescriptor {
                    name: (*name).into(),
                    description: format!("{} from {}", name, self.server),
                    input_schema: json!({"type": "object"}),
                })
                .collect())
        }

        async fn list_prompts(&self) -> CoreResult<Vec<PromptDescriptor>> {
            Ok(vec![PromptDescriptor {
                name: format!("{}_prompt", self.server),
                description: String::new(),
            }])
        }

        async fn list_resources(&self) -> CoreResult<Vec<ResourceDescriptor>> {
            Ok(self
                .resources
                .iter()
                .map(|(uri, _)| ResourceDescriptor {
                    uri: (*uri).into(),
                    name: String::new(),
                })
                .collect())
        }

        async fn call_tool(&self, name: &str, _args: Value) -> CoreResult<String> {
            Ok(format!("{}:{}", self.server, name))
        }

        async fn get_prompt(&self, name: &str, _args: Value) -> CoreResult<String> {
            Ok(format!("rendered {}", name))
        }

        async fn read_resource(&self, uri: &str) -> CoreResult<String> {
            self.resources
                .iter()
                .find(|(u, _)| *u == uri)
                .map(|(_, body)| (*body).to_string())
                .ok_or_else(|| CoreError::NotFound(uri.to_string()))
        }

        async fn shutdown(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    struct FleetFactory {
        connects: AtomicU32,
    }

    #[async_trait]
    impl TransportFactory for FleetFactory {
        async fn connect(&self, config: &ToolServerConfig) -> CoreResult<Arc<dyn ToolTransport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tools, resources): (Vec<&'static str>, Vec<(&'static str, &'static str)>) =
                match config.name.as_str() {
                    "calc" => (vec!["add", "mul"], vec![]),
                    "notes" => (vec!["save_note"], vec![("note://today", "today's note")]),
                    _ => (vec![], vec![]),
                };
            Ok(Arc::new(FleetTransport {
                server: config.name.clone(),
                tools,
                resources,
            }))
        }
    }

    fn fleet() -> FleetConfig {
        let stdio = |name: &str| ToolServerConfig {
            name: name.into(),
            transport: ServerTransportConfig::Stdio {
                command: "stub".into(),
                args: Vec::new(),
                env: Default::default(),
            },
            description: None,
        };
        FleetConfig {
            servers: vec![stdio("calc"), stdio("notes")],
        }
    }

    fn broker() -> ToolBroker {
        ToolBroker::new(
            fleet(),
            Arc::new(FleetFactory {
                connects: AtomicU32::new(0),
            }),
        )
    }

    #[tokio::test]
    async fn aggregates_preserve_fleet_order() {
        let broker = broker();
        let tools = broker.aggregate_tools().await;
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["add", "mul", "save_note"]);
    }

    #[tokio::test]
    async fn find_returns_owning_client() {
        let broker = broker();
        let client = broker.find("save_note").await.unwrap();
        assert_eq!(client.name(), "notes");
        assert!(broker.find("no_such_tool").await.is_none());
    }

    #[tokio::test]
    async fn call_routes_to_owner_and_unknown_becomes_error_payload() {
        let broker = broker();
        let result = broker.call("add", json!({})).await;
        assert_eq!(result, Value::String("calc:add".into()));

        let missing = broker.call("vanish", json!({})).await;
        assert!(missing["error"].as_str().unwrap().contains("vanish"));
    }

    #[tokio::test]
    async fn resources_resolve_via_cached_origin() {
        let broker = broker();
        let body = broker.read_resource("note://today").await.unwrap();
        assert_eq!(body, "today's note");
        assert!(broker.read_resource("note://missing").await.is_err());
    }

    #[tokio::test]
    async fn prompts_resolve_by_owner() {
        let broker = broker();
        let text = broker.get_prompt("calc_prompt", json!({})).await.unwrap();
        assert_eq!(text, "rendered calc_prompt");
        assert!(broker.get_prompt("nope", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn ttl_is_staggered_and_bounded() {
        let broker = broker();
        // Deterministic per name.
        assert_eq!(broker.ttl_for("calc", 1), broker.ttl_for("calc", 1));
        // Bounded to the sane range.
        for (name, count) in [("calc", 0u32), ("notes", 7), ("x", 100)] {
            let ttl = broker.ttl_for(name, count).as_secs() as i64 / 60;
            assert!((MIN_TTL_MINUTES..=MAX_TTL_MINUTES).contains(&ttl));
        }
        // Reload count shifts the TTL within its 0..30 minute cycle.
        assert_ne!(broker.ttl_for("calc", 1), broker.ttl_for("calc", 2));
    }

    #[tokio::test]
    async fn valid_caches_are_not_reloaded() {
        let factory = Arc::new(FleetFactory {
            connects: AtomicU32::new(0),
        });
        let broker = ToolBroker::new(fleet(), factory.clone());
        broker.ensure_fresh().await;
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);

        // A second pass with valid caches must not reconnect anything.
        broker.ensure_fresh().await;
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_reload_bypasses_ttl() {
        let factory = Arc::new(FleetFactory {
            connects: AtomicU32::new(0),
        });
        let broker = ToolBroker::new(fleet(), factory.clone());
        broker.ensure_fresh().await;
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);

        broker.force_reload("calc").await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 3);

        let status = broker.cache_status().await;
        let calc = status.iter().find(|s| s.name == "calc").unwrap();
        assert_eq!(calc.load_count, 2);

        assert!(broker.force_reload("ghost").await.is_err());
    }

    #[tokio::test]
    async fn reload_in_progress_serves_current_view() {
        let broker = Arc::new(broker());
        broker.ensure_fresh().await;

        // Hold the reload lock to simulate a reload in flight.
        let guard = broker.reload_lock.lock().await;
        let tools = broker.aggregate_tools().await;
        assert_eq!(tools.len(), 3, "stale view is served, not blocked on");
        drop(guard);
    }
}
