//! Process-wide registry of tool servers.
//!
//! # Concurrency
//!
//! Readers never lock for longer than an `Arc` clone: every lookup works on
//! an immutable [`Snapshot`] that mutations replace wholesale. Mutations
//! (add, remove, rename) are serialized by an async mutex, so a server is
//! published only after its catalog has been fetched and a removed server
//! disappears from dispatch before its transport is shut down.
//!
//! # Shadowing
//!
//! Tool names are global. When two servers advertise the same name, both
//! tools stay listed but dispatch goes to the server registered first.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::error::{McpError, McpResult};
use super::transport::{
    ConnectRequest, Connector, Credentials, DefaultConnector, Transport, TransportKind,
    TransportSettings,
};
use super::types::{McpTool, ToolOutput};

/// A registered, connected tool server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerRecord {
    pub name: String,
    pub transport_kind: TransportKind,
    pub endpoint: String,
    pub tools: Vec<McpTool>,
    pub connected_at: DateTime<Utc>,
    #[serde(skip)]
    transport: Arc<dyn Transport>,
    /// Registration order; survives renames.
    #[serde(skip)]
    seq: u64,
}

impl ServerRecord {
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

/// A tool descriptor tagged with the server that advertises it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredTool {
    pub server: String,
    #[serde(flatten)]
    pub tool: McpTool,
}

#[derive(Debug, Default)]
struct Snapshot {
    servers: BTreeMap<String, ServerRecord>,
    /// tool name -> owning server name (first registration wins)
    dispatch: HashMap<String, String>,
}

impl Snapshot {
    fn build(servers: BTreeMap<String, ServerRecord>) -> Self {
        let mut dispatch = HashMap::new();
        for record in by_registration(&servers) {
            for tool in &record.tools {
                dispatch
                    .entry(tool.name.clone())
                    .or_insert_with(|| record.name.clone());
            }
        }
        Self { servers, dispatch }
    }
}

fn by_registration(servers: &BTreeMap<String, ServerRecord>) -> Vec<&ServerRecord> {
    let mut records: Vec<_> = servers.values().collect();
    records.sort_by_key(|record| record.seq);
    records
}

/// Owns every [`ServerRecord`] and the transports behind them.
#[derive(Debug)]
pub struct ServerRegistry {
    connector: Arc<dyn Connector>,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serializes mutations; holds the next registration sequence number.
    mutations: Mutex<u64>,
}

impl ServerRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            mutations: Mutex::new(0),
        }
    }

    /// Registry that opens real subprocess and HTTP transports.
    pub fn with_default_connector(settings: TransportSettings) -> Self {
        Self::new(Arc::new(DefaultConnector::new(settings)))
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish(&self, snapshot: Snapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// Connect a server, fetch its catalog and register it.
    ///
    /// Without a `name`, the first free `server-N` is used. Nothing is
    /// published unless the connection and the catalog fetch both succeed.
    pub async fn add_server(
        &self,
        name: Option<&str>,
        kind: TransportKind,
        endpoint: &str,
        credentials: Credentials,
    ) -> McpResult<ServerRecord> {
        let mut seq = self.mutations.lock().await;
        let current = self.current();

        let name = match name.map(str::trim) {
            Some("") => return Err(McpError::InvalidName(String::new())),
            Some(name) if current.servers.contains_key(name) => {
                return Err(McpError::DuplicateName(name.to_string()));
            }
            Some(name) => name.to_string(),
            None => generate_name(&current.servers),
        };

        let request = ConnectRequest {
            server_name: name.clone(),
            kind,
            endpoint: endpoint.trim().to_string(),
            credentials,
        };
        let transport = self.connector.connect(&request).await?;
        let tools = match transport.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "Catalog fetch failed; dropping server");
                transport.disconnect().await;
                return Err(e);
            }
        };

        for tool in &tools {
            if let Some(owner) = current.dispatch.get(&tool.name) {
                tracing::warn!(
                    name: "mcp.tool.shadowed",
                    tool = %tool.name,
                    server = %name,
                    owner = %owner,
                    "Tool name already provided by another server; calls keep going to the first"
                );
            } else {
                tracing::debug!(name: "mcp.tool.discovered", tool = %tool.name, server = %name, "Discovered tool");
            }
        }

        *seq += 1;
        let record = ServerRecord {
            name: name.clone(),
            transport_kind: kind,
            endpoint: request.endpoint,
            tools,
            connected_at: Utc::now(),
            transport,
            seq: *seq,
        };

        let mut servers = current.servers.clone();
        servers.insert(name.clone(), record.clone());
        self.publish(Snapshot::build(servers));

        tracing::info!(
            name: "mcp.server.added",
            server = %name,
            transport = %kind,
            tools = record.tools.len(),
            "Registered tool server"
        );
        Ok(record)
    }

    /// Unregister a server and return; the disconnect runs in the background.
    ///
    /// New dispatches stop reaching the server at once. Calls already holding
    /// the transport complete or time out on their own before it closes.
    pub async fn remove_server(&self, name: &str) -> McpResult<()> {
        let record = {
            let _guard = self.mutations.lock().await;
            let current = self.current();
            let mut servers = current.servers.clone();
            let record = servers
                .remove(name)
                .ok_or_else(|| McpError::NotFound(name.to_string()))?;
            self.publish(Snapshot::build(servers));
            record
        };

        tracing::info!(name: "mcp.server.removed", server = %name, "Removing tool server");
        let server = name.to_string();
        tokio::spawn(async move {
            record.transport.disconnect().await;
            tracing::debug!(server = %server, "Removed tool server disconnected");
        });
        Ok(())
    }

    /// Change a server's key. The transport and catalog are untouched.
    pub async fn rename_server(&self, old: &str, new: &str) -> McpResult<()> {
        let new = new.trim();
        if new.is_empty() {
            return Err(McpError::InvalidName(new.to_string()));
        }

        let _guard = self.mutations.lock().await;
        let current = self.current();
        if !current.servers.contains_key(old) {
            return Err(McpError::NotFound(old.to_string()));
        }
        if old == new {
            return Ok(());
        }
        if current.servers.contains_key(new) {
            return Err(McpError::DuplicateName(new.to_string()));
        }

        let mut servers = current.servers.clone();
        if let Some(mut record) = servers.remove(old) {
            record.name = new.to_string();
            servers.insert(new.to_string(), record);
        }
        self.publish(Snapshot::build(servers));

        tracing::info!(name: "mcp.server.renamed", from = %old, to = %new, "Renamed tool server");
        Ok(())
    }

    /// Every advertised tool, in registration order, tagged with its server.
    #[must_use]
    pub fn list_tools(&self) -> Vec<RegisteredTool> {
        let current = self.current();
        by_registration(&current.servers)
            .into_iter()
            .flat_map(|record| {
                record.tools.iter().map(|tool| RegisteredTool {
                    server: record.name.clone(),
                    tool: tool.clone(),
                })
            })
            .collect()
    }

    /// Registered servers in registration order.
    #[must_use]
    pub fn list_servers(&self) -> Vec<ServerRecord> {
        let current = self.current();
        by_registration(&current.servers)
            .into_iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn server(&self, name: &str) -> Option<ServerRecord> {
        self.current().servers.get(name).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current().servers.is_empty()
    }

    /// Find the server that handles `tool_name`.
    pub fn resolve(&self, tool_name: &str) -> McpResult<ServerRecord> {
        let current = self.current();
        current
            .dispatch
            .get(tool_name)
            .and_then(|server| current.servers.get(server))
            .cloned()
            .ok_or_else(|| McpError::UnknownTool(tool_name.to_string()))
    }

    /// Resolve and invoke a tool in one step.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> McpResult<ToolOutput> {
        let record = self.resolve(tool_name)?;
        tracing::debug!(
            name: "mcp.tool.call",
            tool = %tool_name,
            server = %record.name,
            "Calling tool"
        );
        record
            .transport
            .call_tool(tool_name, arguments, timeout)
            .await
    }

    /// Unregister and disconnect every server.
    ///
    /// Returns once each transport has let its in-flight calls complete or
    /// time out and has closed.
    pub async fn shutdown(&self) {
        let records = {
            let _guard = self.mutations.lock().await;
            let current = self.current();
            self.publish(Snapshot::default());
            by_registration(&current.servers)
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
        };

        futures::future::join_all(records.iter().map(|record| record.transport.disconnect())).await;
        if !records.is_empty() {
            tracing::info!(servers = records.len(), "All tool servers disconnected");
        }
    }
}

fn generate_name(servers: &BTreeMap<String, ServerRecord>) -> String {
    (1u64..)
        .map(|n| format!("server-{n}"))
        .find(|candidate| !servers.contains_key(candidate))
        .unwrap_or_else(|| format!("server-{}", uuid::Uuid::new_v4()))
}
