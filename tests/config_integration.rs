use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use mcp_explorer::config::{DEFAULT_CONFIG_FILE, Settings};
use mcp_explorer::mcp::transport::TransportKind;
use serial_test::serial;

// Variables that would leak into every load.
fn clear_env_vars() {
    unsafe {
        env::remove_var("EXPLORER_CONFIG");
        env::remove_var("EXPLORER_LOG_LEVEL");
        env::remove_var("EXPLORER__QUERY__MAX_TOOL_CALLS");
        env::remove_var("EXPLORER__LLM__MODEL");
        env::remove_var("LLM_MODEL");
        env::remove_var("LLM_API_KEY");
        env::remove_var("LLM_BASE_URL");
        env::remove_var("MCP_CONFIG");
        env::remove_var("EXPLORER_TEST_TOKEN");
    }
}

fn load(extra: &[&str]) -> Settings {
    let args = std::iter::once("mcp-explorer").chain(extra.iter().copied());
    Settings::load_from_args(args).expect("Failed to load config")
}

fn write(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();
    let cwd = tempfile::tempdir().unwrap();
    let previous = env::current_dir().unwrap();
    env::set_current_dir(cwd.path()).unwrap();

    let settings = Settings::load_from_args(["mcp-explorer"]);
    env::set_current_dir(previous).unwrap();

    let settings = settings.expect("defaults should load");
    assert_eq!(settings.log_level, "info");
    assert!(!settings.log_json);
    assert!(settings.mcp.is_empty());

    let query = settings.query_settings();
    assert_eq!(query.max_tool_calls, 5);
    assert_eq!(query.tool_timeout, Duration::from_secs(30));
    assert_eq!(query.history_limit, 100);
    assert_eq!(settings.transport_settings().shutdown_grace, Duration::from_secs(3));
    assert!(settings.llm_settings().api_key.is_none());
}

#[test]
#[serial]
fn test_config_file_servers() {
    clear_env_vars();
    unsafe {
        env::set_var("EXPLORER_TEST_TOKEN", "t0ken");
    }
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "explorer.yaml",
        r#"
query:
  max_tool_calls: 3
  tool_timeout_secs: 12
mcp:
  - name: time
    cmd: npx -y @mcpcentral/mcp-time
  - url: https://tools.example.com/sse
    headers:
      Authorization: Bearer ${EXPLORER_TEST_TOKEN}
  - name: forced
    url: https://example.com/stdio-wrapper
    type: stdio
"#,
    );

    let settings = load(&["--config", &path]);
    assert_eq!(settings.query.max_tool_calls, 3);
    assert_eq!(settings.query_settings().tool_timeout, Duration::from_secs(12));

    let servers = &settings.mcp;
    assert_eq!(servers.len(), 3);
    assert_eq!(servers[0].name.as_deref(), Some("time"));
    assert_eq!(servers[0].url, "npx -y @mcpcentral/mcp-time");
    assert_eq!(servers[0].kind(), TransportKind::Stdio);

    assert_eq!(servers[1].name, None);
    assert_eq!(servers[1].kind(), TransportKind::Sse);
    let headers: Vec<_> = servers[1].headers.values().cloned().collect();
    assert_eq!(headers, vec!["Bearer t0ken".to_string()]);

    assert_eq!(servers[2].kind(), TransportKind::Stdio);
    clear_env_vars();
}

#[test]
#[serial]
fn test_env_and_cli_override() {
    clear_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "explorer.yaml", "query:\n  max_tool_calls: 3\n");

    unsafe {
        env::set_var("EXPLORER__QUERY__MAX_TOOL_CALLS", "8");
        env::set_var("LLM_API_KEY", "sk-test");
        env::set_var("LLM_BASE_URL", "http://localhost:11434");
    }
    let settings = load(&["--config", &path]);
    assert_eq!(settings.query.max_tool_calls, 8);
    let llm = settings.llm_settings();
    assert_eq!(llm.api_key.as_deref(), Some("sk-test"));
    assert_eq!(llm.base_url, "http://localhost:11434");
    assert!(!format!("{:?}", settings.llm).contains("sk-test"));

    // CLI beats the environment.
    let settings = load(&[
        "--config",
        &path,
        "--max-tool-calls",
        "2",
        "--model",
        "local-model",
        "--log-json",
    ]);
    assert_eq!(settings.query.max_tool_calls, 2);
    assert_eq!(settings.llm.model, "local-model");
    assert!(settings.log_json);

    clear_env_vars();
}

#[test]
#[serial]
fn test_working_directory_config_file() {
    clear_env_vars();
    let cwd = tempfile::tempdir().unwrap();
    write(cwd.path(), DEFAULT_CONFIG_FILE, "log_level: debug\n");
    let previous = env::current_dir().unwrap();
    env::set_current_dir(cwd.path()).unwrap();

    let settings = Settings::load_from_args(["mcp-explorer"]);
    env::set_current_dir(previous).unwrap();

    assert_eq!(settings.unwrap().log_level, "debug");
}

#[test]
#[serial]
fn test_mcp_servers_file() {
    clear_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let config = write(
        dir.path(),
        "explorer.yaml",
        "mcp:\n  - name: inline\n    url: ./server\n",
    );
    let servers = write(
        dir.path(),
        "mcp.json",
        r#"{
  "mcpServers": {
    "time": { "command": "npx", "args": ["-y", "@mcpcentral/mcp-time"] },
    "remote": { "url": "https://tools.example.com/sse" }
  }
}"#,
    );

    let settings = load(&["--config", &config, "--mcp-config", &servers]);
    let names: Vec<_> = settings
        .mcp
        .iter()
        .map(|s| s.name.clone().unwrap_or_default())
        .collect();
    assert_eq!(names, vec!["inline", "remote", "time"]);
    assert_eq!(settings.mcp[1].kind(), TransportKind::Sse);
    assert_eq!(settings.mcp[2].url, "npx -y @mcpcentral/mcp-time");
    assert_eq!(settings.mcp[2].kind(), TransportKind::Stdio);
}

#[test]
#[serial]
fn test_missing_config_file_is_an_error() {
    clear_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");

    let result = Settings::load_from_args(["mcp-explorer", "--config", missing.to_str().unwrap()]);
    assert!(result.is_err());
}
