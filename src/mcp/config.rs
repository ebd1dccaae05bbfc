//! Tool-server entries as they appear in configuration.
//!
//! Two shapes are accepted. The application config carries a list:
//!
//! ```yaml
//! mcp:
//!   - name: time
//!     cmd: npx -y @mcpcentral/mcp-time
//!   - url: https://tools.example.com/sse
//!     headers:
//!       Authorization: Bearer ${TOOLS_TOKEN}
//! ```
//!
//! A separate `mcp.json` in the common `mcpServers` layout is also understood:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "time": { "command": "npx", "args": ["-y", "@mcpcentral/mcp-time"] },
//!     "search": { "url": "https://tools.example.com/sse", "env": { "KEY": "${KEY}" } }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::transport::{Credentials, TransportKind};

/// One preconfigured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Registry name; generated when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// URL for event-stream servers, command line for subprocess servers.
    #[serde(alias = "cmd", alias = "command")]
    pub url: String,
    /// Inferred from `url` when absent.
    #[serde(default, rename = "type")]
    pub kind: Option<TransportKind>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ServerConfig {
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind.unwrap_or_else(|| TransportKind::infer(&self.url))
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            env: self.env.clone(),
            headers: self.headers.clone(),
        }
    }

    /// Replace `${VAR}` references in credential values.
    pub fn expand_placeholders(&mut self) {
        for value in self.env.values_mut().chain(self.headers.values_mut()) {
            *value = expand_env_placeholders(value);
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum McpServerEntry {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Remote {
        url: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl McpServersFile {
    /// Flatten into server entries, sorted by name.
    #[must_use]
    pub fn into_servers(self) -> Vec<ServerConfig> {
        let mut servers: Vec<_> = self
            .mcp_servers
            .into_iter()
            .map(|(name, entry)| match entry {
                McpServerEntry::Stdio { command, args, env } => ServerConfig {
                    name: Some(name),
                    url: std::iter::once(command).chain(args).collect::<Vec<_>>().join(" "),
                    kind: Some(TransportKind::Stdio),
                    env,
                    headers: BTreeMap::new(),
                },
                McpServerEntry::Remote { url, env, headers } => ServerConfig {
                    name: Some(name),
                    url,
                    kind: Some(TransportKind::Sse),
                    env,
                    headers,
                },
            })
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }
}

/// Read an `mcpServers` JSON file.
pub fn load_mcp_servers_file(path: impl AsRef<Path>) -> Result<Vec<ServerConfig>, config::ConfigError> {
    let path = path.as_ref();
    let txt = fs::read_to_string(path).map_err(|e| {
        config::ConfigError::Message(format!("cannot read {}: {e}", path.display()))
    })?;
    let file: McpServersFile = serde_json::from_str(&txt).map_err(|e| {
        config::ConfigError::Message(format!("invalid MCP server file {}: {e}", path.display()))
    })?;
    Ok(file.into_servers())
}

/// Expand `${NAME}` placeholders from the process environment.
///
/// Unknown variables are left as written.
pub fn expand_env_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => {
                tracing::warn!(variable = %name, "Unresolved placeholder in configuration");
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
