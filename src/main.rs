//! MCP Explorer console.
//!
//! Loads settings, connects the configured tool servers and reads queries
//! and `/commands` from standard input.

#![allow(clippy::print_stdout)]

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use anyhow::Context;
use dotenvy::dotenv;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_explorer::Explorer;
use mcp_explorer::config::Settings;
use mcp_explorer::mcp::transport::TransportKind;

const HELP: &str = "\
Type a question to query the model, or one of:
  /tools                                   list available tools
  /servers                                 list connected servers
  /history                                 show the conversation as JSON
  /reset                                   clear the conversation
  /add <stdio|sse|auto> <endpoint...> [--name <name>]
  /remove <name>
  /rename <old> <new>
  /call <tool> [json arguments]
  /help
  /quit";

#[derive(Debug, PartialEq)]
enum Command {
    Query(String),
    Tools,
    Servers,
    History,
    Reset,
    Add {
        kind: Option<TransportKind>,
        endpoint: String,
        name: Option<String>,
    },
    Remove(String),
    Rename(String, String),
    Call(String, Value),
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Query(line.to_string()));
        };
        let (head, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let args = args.trim();

        match head {
            "tools" => Ok(Self::Tools),
            "servers" => Ok(Self::Servers),
            "history" => Ok(Self::History),
            "reset" => Ok(Self::Reset),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            "remove" if !args.is_empty() => Ok(Self::Remove(args.to_string())),
            "rename" => match args.split_whitespace().collect::<Vec<_>>().as_slice() {
                [old, new] => Ok(Self::Rename(old.to_string(), new.to_string())),
                _ => Err("usage: /rename <old> <new>".to_string()),
            },
            "call" if !args.is_empty() => {
                let (tool, json) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
                let arguments = if json.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(json).map_err(|e| format!("invalid JSON arguments: {e}"))?
                };
                Ok(Self::Call(tool.to_string(), arguments))
            }
            "add" => parse_add(args),
            other => Err(format!("unknown or incomplete command: /{other} (try /help)")),
        }
    }
}

fn parse_add(args: &str) -> Result<Command, String> {
    let mut words: Vec<&str> = args.split_whitespace().collect();
    let mut name = None;
    if let Some(pos) = words.iter().position(|w| *w == "--name") {
        let value = words
            .get(pos + 1)
            .ok_or_else(|| "--name needs a value".to_string())?;
        name = Some((*value).to_string());
        words.drain(pos..=pos + 1);
    }
    let [kind, endpoint @ ..] = &words[..] else {
        return Err("usage: /add <stdio|sse|auto> <endpoint...> [--name <name>]".to_string());
    };
    if endpoint.is_empty() {
        return Err("missing endpoint".to_string());
    }
    let kind = match *kind {
        "auto" => None,
        other => Some(other.parse::<TransportKind>()?),
    };
    Ok(Command::Add {
        kind,
        endpoint: endpoint.join(" "),
        name,
    })
}

fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .context("invalid log level")?;

    // Logs go to stderr; stdout belongs to the console.
    let registry = tracing_subscriber::registry().with(filter);
    if settings.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let settings = Settings::load().context("failed to load configuration")?;
    init_tracing(&settings)?;

    info!(
        name: "llm.config.loaded",
        base_url = %settings.llm.base_url,
        model = %settings.llm.model,
        "LLM configuration loaded"
    );

    let explorer = Explorer::from_settings(&settings);
    let connected = explorer.connect_configured(&settings.mcp).await;
    info!(
        servers = connected.len(),
        tools = explorer.list_tools().len(),
        "Tool servers ready"
    );

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_prompt();
        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match Command::parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => run(&explorer, &settings, command).await,
            Err(message) => println!("{message}"),
        }
    }

    explorer.shutdown().await;
    Ok(())
}

fn print_prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn run(explorer: &Explorer, settings: &Settings, command: Command) {
    match command {
        Command::Query(text) => match explorer.process_query(&settings.prompt, &text).await {
            Ok(answer) => println!("{answer}"),
            Err(e) => println!("error: {e}"),
        },
        Command::Tools => {
            for tool in explorer.list_tools() {
                println!(
                    "{:<24} [{}] {}",
                    tool.tool.name,
                    tool.server,
                    tool.tool.description.as_deref().unwrap_or("")
                );
            }
        }
        Command::Servers => {
            for server in explorer.list_tool_servers() {
                println!(
                    "{:<16} {:<5} {} ({} tools, {})",
                    server.name,
                    server.transport_kind.as_str(),
                    server.endpoint,
                    server.tools.len(),
                    if server.is_connected() { "connected" } else { "disconnected" }
                );
            }
        }
        Command::History => match serde_json::to_string_pretty(explorer.session().conversation()) {
            Ok(json) => println!("{json}"),
            Err(e) => println!("error: {e}"),
        },
        Command::Reset => {
            explorer.reset_history().await;
            println!("conversation cleared");
        }
        Command::Add {
            kind,
            endpoint,
            name,
        } => {
            let kind = kind.unwrap_or_else(|| TransportKind::infer(&endpoint));
            match explorer
                .add_tool_server(name.as_deref(), &endpoint, kind, None)
                .await
            {
                Ok(record) => println!("added '{}' with {} tools", record.name, record.tools.len()),
                Err(e) => println!("error: {e}"),
            }
        }
        Command::Remove(name) => match explorer.remove_tool_server(&name).await {
            Ok(()) => println!("removed '{name}'"),
            Err(e) => println!("error: {e}"),
        },
        Command::Rename(old, new) => match explorer.rename_tool_server(&old, &new).await {
            Ok(()) => println!("renamed '{old}' to '{new}'"),
            Err(e) => println!("error: {e}"),
        },
        Command::Call(tool, arguments) => match explorer.call_tool_directly(&tool, arguments).await {
            Ok(output) if output.is_error => println!("tool error: {}", output.text()),
            Ok(output) => println!("{}", output.text()),
            Err(e) => println!("error: {e}"),
        },
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}
