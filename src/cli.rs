//! Command-line front end.
//!
//! Every command loads the config, does its work through [`McpClient`] and
//! disconnects before returning. Failures surface as `anyhow` errors wrapping
//! an [`McpError`] where one exists; `main` maps that onto the exit code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::logging::LogOptions;
use crate::mcp_client::{
    ConnectionSnapshot, ConnectionState, ExecutionStats, McpClient, McpConfig, McpError,
    ToolDescriptor, ToolInvocation, ToolResult,
};

/// Longest description shown in table output.
const DESCRIPTION_WIDTH: usize = 60;

// ─── Arguments ───────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "toolbridge", version, about = "Connect to MCP tool servers and call their tools")]
pub struct Cli {
    /// Server configuration file (JSON, or YAML by extension).
    #[arg(short, long, global = true, default_value = "mcp-servers.json")]
    pub config: PathBuf,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            verbose: self.verbose,
            json: self.log_json,
            file: self.log_file.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to every server and report its state.
    Status,
    /// Print the normalized configuration.
    Config {
        /// Only check that the file is valid.
        #[arg(long)]
        validate: bool,
    },
    /// Inspect configured servers.
    Servers {
        #[command(subcommand)]
        command: ServersCommand,
    },
    /// Discover and call tools.
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ServersCommand {
    /// List configured servers without connecting.
    List,
    /// Connect and probe one server, or all of them.
    Test { name: Option<String> },
}

#[derive(Debug, Subcommand)]
pub enum ToolsCommand {
    List {
        #[arg(long)]
        server: Option<String>,
        /// Keep tools whose name or description contains every term.
        #[arg(long)]
        search: Option<String>,
        #[arg(long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },
    Describe {
        name: String,
        #[arg(long)]
        server: Option<String>,
    },
    Call {
        name: String,
        #[arg(long)]
        server: Option<String>,
        /// `key=value`; the value is parsed as JSON, else taken as a string.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// Parameters as one JSON object; `--param` entries override it.
        #[arg(long)]
        params_json: Option<String>,
        /// Invocation timeout in milliseconds.
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Call a tool with placeholder arguments generated from its schema.
    Test {
        name: String,
        #[arg(long)]
        server: Option<String>,
    },
    /// Run a JSON array of invocations concurrently.
    Batch {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// One entry of a batch file.
#[derive(Debug, Deserialize)]
struct BatchEntry {
    tool: String,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
    /// Milliseconds.
    #[serde(default)]
    timeout: Option<u64>,
}

impl BatchEntry {
    fn into_invocation(self) -> ToolInvocation {
        let mut invocation = ToolInvocation::new(&self.tool, self.params);
        if let Some(server) = &self.server {
            invocation = invocation.on_server(server);
        }
        if let Some(ms) = self.timeout {
            invocation = invocation.with_timeout(Duration::from_millis(ms));
        }
        invocation
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

pub async fn run(cli: Cli) -> Result<()> {
    let config = McpConfig::load(&cli.config)?;

    match cli.command {
        Command::Config { validate } => {
            if validate {
                println!("{}: ok ({} servers)", cli.config.display(), config.servers.len());
            } else {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            Ok(())
        }
        Command::Servers {
            command: ServersCommand::List,
        } => {
            print!("{}", render_server_list(&config));
            Ok(())
        }
        command => {
            let client = McpClient::from_config(config);
            let outcome = run_connected(&client, command).await;
            client.disconnect_all().await;
            outcome
        }
    }
}

async fn run_connected(client: &McpClient, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            connect_all(client).await;
            client.manager().check_all().await;
            print!("{}", render_status(&client.status()));
            println!("{}", client.registry().capability_summary());
            print!("{}", render_stats(&client.stats()));
            Ok(())
        }
        Command::Servers {
            command: ServersCommand::Test { name },
        } => {
            let names = match name {
                Some(name) => vec![name],
                None => client.config().server_names(),
            };
            let mut first_error = None;
            for name in names {
                match client.test_server(&name).await {
                    Ok(snapshot) => println!("{}", render_server_test(&snapshot)),
                    Err(e) => {
                        println!("{name}: {e}");
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e.into()),
                None => Ok(()),
            }
        }
        Command::Tools { command } => run_tools(client, command).await,
        Command::Config { .. }
        | Command::Servers {
            command: ServersCommand::List,
        } => Ok(()),
    }
}

async fn run_tools(client: &McpClient, command: ToolsCommand) -> Result<()> {
    connect_all(client).await;

    match command {
        ToolsCommand::List {
            server,
            search,
            format,
        } => {
            let mut tools = match &search {
                Some(query) => client.search(query),
                None => client.tools(server.as_deref()),
            };
            if let Some(server) = &server {
                tools.retain(|t| &t.server == server);
            }
            match format {
                ListFormat::Table => print!("{}", render_tool_table(&tools)),
                ListFormat::Json => println!("{}", serde_json::to_string_pretty(&tools_json(&tools))?),
            }
            Ok(())
        }
        ToolsCommand::Describe { name, server } => {
            let tool = client.describe(&name, server.as_deref())?;
            print!("{}", render_tool_detail(&tool));
            Ok(())
        }
        ToolsCommand::Call {
            name,
            server,
            params,
            params_json,
            timeout,
            format,
        } => {
            let params = parse_params(&params, params_json.as_deref()).map_err(|reason| {
                McpError::Validation {
                    tool: name.clone(),
                    field: "(params)".into(),
                    reason,
                }
            })?;
            let mut invocation = ToolInvocation::new(&name, params);
            if let Some(server) = &server {
                invocation = invocation.on_server(server);
            }
            if let Some(ms) = timeout {
                invocation = invocation.with_timeout(Duration::from_millis(ms));
            }
            finish_one(client.invoke(invocation).await, format)
        }
        ToolsCommand::Test { name, server } => {
            let result = client.test_tool(&name, server.as_deref()).await;
            finish_one(result, OutputFormat::Text)
        }
        ToolsCommand::Batch { file, format } => {
            let invocations = load_batch(&file)?;
            let total = invocations.len();
            let results = client.batch_invoke(invocations).await;
            print!("{}", render_batch(&results, format)?);

            let failed = results.iter().filter(|r| !r.success).count();
            match results.into_iter().find_map(|r| r.error) {
                Some(e) => Err(anyhow::Error::new(e)
                    .context(format!("{failed} of {total} invocations failed"))),
                None => Ok(()),
            }
        }
    }
}

/// Connect every server; failures are logged and the command carries on
/// with whatever connected.
async fn connect_all(client: &McpClient) {
    for (name, e) in client.connect_all().await {
        tracing::warn!(server = %name, error = %e, "server unavailable");
    }
}

fn finish_one(result: ToolResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", render_result_text(&result)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result.to_json())?),
    }
    result.into_result()?;
    Ok(())
}

fn load_batch(path: &Path) -> Result<Vec<ToolInvocation>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read batch file {}", path.display()))?;
    parse_batch(&raw).with_context(|| format!("invalid batch file {}", path.display()))
}

fn parse_batch(raw: &str) -> Result<Vec<ToolInvocation>> {
    let entries: Vec<BatchEntry> = serde_json::from_str(raw)?;
    if let Some(i) = entries.iter().position(|e| e.tool.trim().is_empty()) {
        return Err(anyhow!("entry {i} has an empty tool name"));
    }
    Ok(entries.into_iter().map(BatchEntry::into_invocation).collect())
}

/// Merge `--params-json` and `--param key=value` pairs into one object.
pub fn parse_params(pairs: &[String], json: Option<&str>) -> Result<Map<String, Value>, String> {
    let mut params = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err("--params-json must be a JSON object".into()),
            Err(e) => return Err(format!("--params-json is not valid JSON: {e}")),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(format!("expected key=value, got '{pair}'"));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in '{pair}'"));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

/// Exit code for a failed command.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<McpError>())
        .map_or(1, McpError::exit_code)
}

// ─── Rendering ───────────────────────────────────────────────────────────────

/// Left-aligned columns, two spaces apart.
fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, &w)| format!("{c:<w$}"))
            .collect();
        format!("{}\n", padded.join("  ").trim_end())
    };

    let mut out = line(headers.to_vec());
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}

fn truncate(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn render_server_list(config: &McpConfig) -> String {
    let rows: Vec<Vec<String>> = config
        .servers
        .values()
        .map(|s| vec![s.name.clone(), s.kind().to_string(), s.endpoint()])
        .collect();
    table(&["SERVER", "TRANSPORT", "ENDPOINT"], &rows)
}

fn render_status(snapshots: &[ConnectionSnapshot]) -> String {
    let rows: Vec<Vec<String>> = snapshots
        .iter()
        .map(|s| {
            vec![
                s.name.clone(),
                s.kind.to_string(),
                s.state.to_string(),
                s.tool_count.to_string(),
                s.last_error.as_deref().map(|e| truncate(e, DESCRIPTION_WIDTH)).unwrap_or_default(),
            ]
        })
        .collect();

    let connected = snapshots
        .iter()
        .filter(|s| s.state == ConnectionState::Connected)
        .count();
    let tools: usize = snapshots.iter().map(|s| s.tool_count).sum();

    let mut out = table(&["SERVER", "TRANSPORT", "STATE", "TOOLS", "LAST ERROR"], &rows);
    out.push_str(&format!(
        "\n{connected}/{} servers connected, {tools} tools available\n",
        snapshots.len()
    ));
    out
}

fn render_stats(stats: &ExecutionStats) -> String {
    format!(
        "invocations: {} ({} succeeded, {} failed, avg {:.1}ms)\n",
        stats.total,
        stats.succeeded,
        stats.failed,
        stats.average_ms()
    )
}

fn render_server_test(snapshot: &ConnectionSnapshot) -> String {
    let mut line = format!(
        "{}: {} ({} tools, {} {})",
        snapshot.name, snapshot.state, snapshot.tool_count, snapshot.kind, snapshot.endpoint
    );
    if let Some(e) = &snapshot.last_error {
        line.push_str(&format!(", last error: {e}"));
    }
    line
}

fn render_tool_table(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return "no tools available\n".to_string();
    }
    let rows: Vec<Vec<String>> = tools
        .iter()
        .map(|t| {
            vec![
                t.name.clone(),
                t.server.clone(),
                t.param_count().to_string(),
                truncate(&t.description, DESCRIPTION_WIDTH),
            ]
        })
        .collect();
    table(&["TOOL", "SERVER", "PARAMS", "DESCRIPTION"], &rows)
}

fn tools_json(tools: &[ToolDescriptor]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "server": t.server,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect(),
    )
}

fn render_tool_detail(tool: &ToolDescriptor) -> String {
    let required = tool.required_params();
    let schema = serde_json::to_string_pretty(&tool.input_schema).unwrap_or_default();
    let mut out = format!(
        "{}\n  server:      {}\n  description: {}\n  required:    {}\n  input schema:\n",
        tool.qualified_name(),
        tool.server,
        if tool.description.is_empty() { "-" } else { tool.description.as_str() },
        if required.is_empty() { "-".to_string() } else { required.join(", ") },
    );
    for line in schema.lines() {
        out.push_str(&format!("    {line}\n"));
    }
    if let Some(output) = &tool.output_schema {
        out.push_str("  output schema:\n");
        for line in serde_json::to_string_pretty(output).unwrap_or_default().lines() {
            out.push_str(&format!("    {line}\n"));
        }
    }
    out
}

/// Text parts of an MCP result payload, or the payload as pretty JSON.
fn payload_text(payload: &Value) -> String {
    let texts: Vec<&str> = payload
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if texts.is_empty() {
        serde_json::to_string_pretty(payload).unwrap_or_default()
    } else {
        texts.join("\n")
    }
}

fn render_result_text(result: &ToolResult) -> String {
    let server = result.server_name.as_deref().unwrap_or("-");
    let header = format!(
        "{}@{} {} in {}ms ({} attempt{})",
        result.tool_name,
        server,
        if result.success { "ok" } else { "failed" },
        result.execution_time_ms,
        result.attempts,
        if result.attempts == 1 { "" } else { "s" },
    );
    let body = match (&result.error, &result.result) {
        (Some(e), _) => format!("error: {e}"),
        (None, Some(payload)) => payload_text(payload),
        (None, None) => String::new(),
    };
    format!("{header}\n{body}\n")
}

fn render_batch(results: &[ToolResult], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let all: Vec<Value> = results.iter().map(ToolResult::to_json).collect();
            Ok(format!("{}\n", serde_json::to_string_pretty(&all)?))
        }
        OutputFormat::Text => {
            let mut out = String::new();
            for (i, result) in results.iter().enumerate() {
                out.push_str(&format!("[{i}] {}", render_result_text(result)));
            }
            let failed = results.iter().filter(|r| !r.success).count();
            out.push_str(&format!("\n{} invocations, {failed} failed\n", results.len()));
            Ok(out)
        }
    }
}
