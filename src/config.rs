//! Application settings.
//!
//! Priority, lowest to highest: built-in defaults, config file
//! (`--config`, or `./explorer-config.yaml` when present), `EXPLORER__*`
//! environment variables, `LLM_*` variables, CLI flags.

use std::env;
use std::path::Path;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::llm::{LlmSettings, QueryOptions, QuerySettings, ToolOverride};
use crate::mcp::config::{ServerConfig, load_mcp_servers_file};
use crate::mcp::transport::TransportSettings;

/// Config file picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "explorer-config.yaml";

const DEFAULT_PROMPT: &str = "You are a helpful assistant. Use the available tools when they help answer the user's question.";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "EXPLORER_CONFIG")]
    pub config: Option<String>,

    /// Log level or filter directive (e.g. `debug`, `mcp_explorer=trace`)
    #[arg(long, env = "EXPLORER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Maximum model/tool rounds per query
    #[arg(long)]
    pub max_tool_calls: Option<u32>,

    /// Model identifier
    #[arg(long, env = "LLM_MODEL")]
    pub model: Option<String>,

    /// Additional `mcpServers` JSON file
    #[arg(long, env = "MCP_CONFIG")]
    pub mcp_config: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Default system prompt.
    pub prompt: String,
    pub log_level: String,
    pub log_json: bool,
    pub query: QueryConfig,
    pub transport: TransportConfig,
    pub llm: LlmConfig,
    /// Servers connected at startup.
    #[serde(default)]
    pub mcp: Vec<ServerConfig>,
    #[serde(default)]
    pub mcp_config: Option<String>,
    /// Description overrides applied to every query.
    #[serde(default)]
    pub tool_overrides: Vec<ToolOverride>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    pub max_tool_calls: usize,
    pub tool_timeout_secs: u64,
    pub history_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    pub connect_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Deserialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl Settings {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        // 1. Defaults
        let mut builder = Config::builder()
            .set_default("prompt", DEFAULT_PROMPT)?
            .set_default("log_level", "info")?
            .set_default("log_json", false)?
            .set_default("query.max_tool_calls", 5)?
            .set_default("query.tool_timeout_secs", 30)?
            .set_default("query.history_limit", 100)?
            .set_default("transport.connect_timeout_secs", 10)?
            .set_default("transport.shutdown_grace_secs", 3)?
            .set_default("llm.base_url", "https://api.openai.com")?
            .set_default("llm.model", "gpt-4o-mini")?;

        // 2. Config file
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path).required(true));
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            builder = builder.add_source(File::from(Path::new(DEFAULT_CONFIG_FILE)));
        }

        // 3. EXPLORER__QUERY__MAX_TOOL_CALLS=8 and friends
        builder = builder.add_source(
            Environment::with_prefix("EXPLORER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        // 4. Conventional LLM variables
        if let Some(key) = non_empty_env("LLM_API_KEY") {
            builder = builder.set_override("llm.api_key", key)?;
        }
        if let Some(url) = non_empty_env("LLM_BASE_URL") {
            builder = builder.set_override("llm.base_url", url)?;
        }

        // 5. CLI flags (clap already folded in their env fallbacks)
        if let Some(level) = cli.log_level {
            builder = builder.set_override("log_level", level)?;
        }
        if cli.log_json {
            builder = builder.set_override("log_json", true)?;
        }
        if let Some(max) = cli.max_tool_calls {
            builder = builder.set_override("query.max_tool_calls", u64::from(max))?;
        }
        if let Some(model) = cli.model {
            builder = builder.set_override("llm.model", model)?;
        }
        if let Some(path) = cli.mcp_config {
            builder = builder.set_override("mcp_config", path)?;
        }

        let mut settings: Self = builder.build()?.try_deserialize()?;

        if let Some(path) = &settings.mcp_config {
            let extra = load_mcp_servers_file(path)?;
            settings.mcp.extend(extra);
        }
        for server in &mut settings.mcp {
            server.expand_placeholders();
        }
        if let Some(key) = settings.llm.api_key.as_mut() {
            *key = crate::mcp::config::expand_env_placeholders(key);
        }

        Ok(settings)
    }

    #[must_use]
    pub fn query_settings(&self) -> QuerySettings {
        QuerySettings {
            max_tool_calls: self.query.max_tool_calls,
            tool_timeout: Duration::from_secs(self.query.tool_timeout_secs),
            history_limit: self.query.history_limit,
        }
    }

    #[must_use]
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_secs(self.transport.connect_timeout_secs),
            shutdown_grace: Duration::from_secs(self.transport.shutdown_grace_secs),
        }
    }

    #[must_use]
    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            base_url: self.llm.base_url.clone(),
            api_key: self.llm.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: self.llm.model.clone(),
            max_tokens: self.llm.max_tokens,
        }
    }

    /// Options applied to every query unless the caller supplies its own.
    #[must_use]
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            max_tool_calls: None,
            tool_overrides: self.tool_overrides.clone(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
