//! Server configuration loading and validation.
//!
//! Reads the declarative server list (JSON, or YAML by extension), checks it
//! against the per-transport schema, and produces immutable [`ServerConfig`]
//! records keyed by server name. Environment variables are interpolated only
//! where credentials are expected: pipe `env` values and http `headers`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::errors::McpError;

// ─── Defaults ────────────────────────────────────────────────────────────────

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_TOOL_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_RECONNECT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Server label used in `SchemaViolation` for top-level settings.
const GLOBAL_SCOPE: &str = "(global)";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which transport a server is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking over stdin/stdout.
    Stdio,
    /// Plain TCP socket.
    Socket,
    /// HTTP endpoint, one POST per request.
    Http,
}

impl TransportKind {
    /// Parse the `type` field. `pipe` is accepted as a synonym for `stdio`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stdio" | "pipe" => Some(TransportKind::Stdio),
            "socket" => Some(TransportKind::Socket),
            "http" => Some(TransportKind::Http),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Socket => "socket",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        #[serde(serialize_with = "serialize_redacted")]
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    Socket {
        host: String,
        port: u16,
    },
    Http {
        url: String,
        #[serde(serialize_with = "serialize_redacted")]
        headers: BTreeMap<String, String>,
    },
}

/// Retry behaviour for connects and transport-level invocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", serialize_with = "serialize_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", serialize_with = "serialize_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}

/// Immutable configuration for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(rename = "connect_timeout_ms", serialize_with = "serialize_ms")]
    pub connect_timeout: Duration,
    #[serde(rename = "timeout_ms", serialize_with = "serialize_ms")]
    pub call_timeout: Duration,
    /// Per-server override of the global retry policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl ServerConfig {
    pub fn kind(&self) -> TransportKind {
        match self.transport {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Socket { .. } => TransportKind::Socket,
            TransportConfig::Http { .. } => TransportKind::Http,
        }
    }

    /// The retry policy in force for this server.
    pub fn retry_policy(&self, settings: &ClientSettings) -> RetryPolicy {
        self.retry.unwrap_or(settings.retry)
    }

    /// Short human-readable endpoint (command line, `host:port`, or url).
    pub fn endpoint(&self) -> String {
        match &self.transport {
            TransportConfig::Stdio { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{command} {}", args.join(" "))
                }
            }
            TransportConfig::Socket { host, port } => format!("{host}:{port}"),
            TransportConfig::Http { url, .. } => url.clone(),
        }
    }
}

/// Client-wide settings; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSettings {
    #[serde(rename = "default_timeout_ms", serialize_with = "serialize_ms")]
    pub default_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", serialize_with = "serialize_ms")]
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    #[serde(rename = "tool_cache_ttl_ms", serialize_with = "serialize_ms")]
    pub tool_cache_ttl: Duration,
    #[serde(rename = "health_check_interval_ms", serialize_with = "serialize_ms")]
    pub health_check_interval: Duration,
    /// Consecutive failed probes that move `Degraded` to `Failed`.
    pub health_failure_threshold: u32,
    #[serde(rename = "reconnect_cooldown_ms", serialize_with = "serialize_ms")]
    pub reconnect_cooldown: Duration,
    pub max_concurrency: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            tool_cache_ttl: Duration::from_secs(DEFAULT_TOOL_CACHE_TTL_SECS),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            health_failure_threshold: DEFAULT_HEALTH_FAILURE_THRESHOLD,
            reconnect_cooldown: Duration::from_secs(DEFAULT_RECONNECT_COOLDOWN_SECS),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

/// The validated configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct McpConfig {
    pub servers: BTreeMap<String, ServerConfig>,
    pub settings: ClientSettings,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl McpConfig {
    /// Load a configuration file. `.yaml`/`.yml` files are parsed as YAML,
    /// everything else as JSON.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        if is_yaml {
            Self::from_yaml_str(&raw)
        } else {
            Self::from_json_str(&raw)
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, McpError> {
        let doc: RawDocument = serde_json::from_str(text).map_err(|e| McpError::Config {
            reason: format!("invalid JSON: {e}"),
        })?;
        let servers = match doc.servers.clone() {
            Some(entries) => entries,
            // Flat form: the whole document is the server map.
            None => serde_json::from_str(text).map_err(|e| McpError::Config {
                reason: format!("invalid JSON: {e}"),
            })?,
        };
        Self::from_raw(doc, servers)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, McpError> {
        let doc: RawDocument = serde_yaml::from_str(text).map_err(|e| McpError::Config {
            reason: format!("invalid YAML: {e}"),
        })?;
        let servers = match doc.servers.clone() {
            Some(entries) => entries,
            None => serde_yaml::from_str(text).map_err(|e| McpError::Config {
                reason: format!("invalid YAML: {e}"),
            })?,
        };
        Self::from_raw(doc, servers)
    }

    fn from_raw(doc: RawDocument, entries: ServerEntries) -> Result<Self, McpError> {
        let settings = parse_settings(&doc)?;

        if entries.0.is_empty() {
            return Err(McpError::Config {
                reason: "at least one server must be configured".into(),
            });
        }

        let mut seen = HashSet::new();
        let mut servers = BTreeMap::new();
        for (name, value) in &entries.0 {
            if name.trim().is_empty() {
                return Err(violation(name, "name", "server name cannot be empty"));
            }
            if !seen.insert(name.clone()) {
                return Err(violation(name, "name", "duplicate server name"));
            }
            let server = parse_server(name, value, &settings)?;
            servers.insert(name.clone(), server);
        }

        Ok(Self { servers, settings })
    }

    /// Configured server names in sorted order.
    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn server(&self, name: &str) -> Result<&ServerConfig, McpError> {
        self.servers.get(name).ok_or_else(|| McpError::UnknownServer {
            name: name.to_string(),
        })
    }
}

// ─── Raw Document ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    servers: Option<ServerEntries>,
    #[serde(default)]
    default_timeout: Option<Value>,
    #[serde(default)]
    connect_timeout: Option<Value>,
    #[serde(default)]
    retry_attempts: Option<Value>,
    #[serde(default)]
    retry_delay_ms: Option<Value>,
    #[serde(default)]
    retry_max_delay_ms: Option<Value>,
    #[serde(default)]
    tool_cache_ttl: Option<Value>,
    #[serde(default)]
    health_check_interval: Option<Value>,
    #[serde(default)]
    health_failure_threshold: Option<Value>,
    #[serde(default)]
    reconnect_cooldown: Option<Value>,
    #[serde(default)]
    max_concurrency: Option<Value>,
}

/// Server entries in document order, duplicates preserved.
///
/// A plain map would silently keep the last of two same-named entries.
#[derive(Debug, Clone, Default)]
struct ServerEntries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for ServerEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = ServerEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of server name to server config")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, Value>()? {
                    entries.push((key, value));
                }
                Ok(ServerEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

fn violation(server: &str, field: &str, reason: impl Into<String>) -> McpError {
    McpError::SchemaViolation {
        server: server.to_string(),
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn parse_settings(doc: &RawDocument) -> Result<ClientSettings, McpError> {
    let defaults = ClientSettings::default();
    let g = GLOBAL_SCOPE;

    let retry_attempts = match &doc.retry_attempts {
        Some(v) => positive_u32(v, g, "retry_attempts")?,
        None => defaults.retry.max_attempts,
    };
    let base_delay = match &doc.retry_delay_ms {
        Some(v) => Duration::from_millis(non_negative(v, g, "retry_delay_ms")?),
        None => defaults.retry.base_delay,
    };
    let max_delay = match &doc.retry_max_delay_ms {
        Some(v) => Duration::from_millis(non_negative(v, g, "retry_max_delay_ms")?),
        None => defaults.retry.max_delay.max(base_delay),
    };
    if max_delay < base_delay {
        return Err(violation(
            g,
            "retry_max_delay_ms",
            "must not be smaller than retry_delay_ms",
        ));
    }

    let millis = |v: &Option<Value>, field: &str, default: Duration| -> Result<Duration, McpError> {
        match v {
            Some(v) => Ok(Duration::from_millis(positive(v, g, field)?)),
            None => Ok(default),
        }
    };
    let secs = |v: &Option<Value>, field: &str, default: Duration| -> Result<Duration, McpError> {
        match v {
            Some(v) => Ok(Duration::from_secs(positive(v, g, field)?)),
            None => Ok(default),
        }
    };

    let max_concurrency = match &doc.max_concurrency {
        Some(v) => usize::try_from(positive(v, g, "max_concurrency")?)
            .map_err(|_| violation(g, "max_concurrency", "value too large"))?,
        None => defaults.max_concurrency,
    };

    Ok(ClientSettings {
        default_timeout: millis(&doc.default_timeout, "default_timeout", defaults.default_timeout)?,
        connect_timeout: millis(&doc.connect_timeout, "connect_timeout", defaults.connect_timeout)?,
        retry: RetryPolicy {
            max_attempts: retry_attempts,
            base_delay,
            max_delay,
        },
        tool_cache_ttl: secs(&doc.tool_cache_ttl, "tool_cache_ttl", defaults.tool_cache_ttl)?,
        health_check_interval: secs(
            &doc.health_check_interval,
            "health_check_interval",
            defaults.health_check_interval,
        )?,
        health_failure_threshold: match &doc.health_failure_threshold {
            Some(v) => positive_u32(v, g, "health_failure_threshold")?,
            None => defaults.health_failure_threshold,
        },
        reconnect_cooldown: secs(
            &doc.reconnect_cooldown,
            "reconnect_cooldown",
            defaults.reconnect_cooldown,
        )?,
        max_concurrency,
    })
}

fn parse_server(
    name: &str,
    value: &Value,
    settings: &ClientSettings,
) -> Result<ServerConfig, McpError> {
    let obj = value
        .as_object()
        .ok_or_else(|| violation(name, "(entry)", "expected an object"))?;

    let kind = match obj.get("type") {
        None | Some(Value::Null) => TransportKind::Stdio,
        Some(Value::String(raw)) => TransportKind::parse(raw).ok_or_else(|| {
            violation(
                name,
                "type",
                format!("unrecognized transport type '{raw}' (expected stdio, socket, or http)"),
            )
        })?,
        Some(_) => return Err(violation(name, "type", "must be a string")),
    };

    let transport = match kind {
        TransportKind::Stdio => {
            let command = opt_string(obj, name, "command")?
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| violation(name, "command", "stdio servers require a command"))?;
            let env = string_map(obj, name, "env")?
                .into_iter()
                .map(|(k, v)| (k, interpolate_env_vars(&v)))
                .collect();
            TransportConfig::Stdio {
                command,
                args: string_list(obj, name, "args")?,
                env,
                cwd: opt_string(obj, name, "cwd")?.map(|c| PathBuf::from(expand_tilde(&c))),
            }
        }
        TransportKind::Socket => {
            let host = opt_string(obj, name, "host")?
                .filter(|h| !h.trim().is_empty())
                .ok_or_else(|| violation(name, "host", "socket servers require a host"))?;
            let port = opt_port(obj, name)?
                .ok_or_else(|| violation(name, "port", "socket servers require a port"))?;
            TransportConfig::Socket { host, port }
        }
        TransportKind::Http => {
            let url = match opt_string(obj, name, "url")? {
                Some(url) => url,
                None => match (opt_string(obj, name, "host")?, opt_port(obj, name)?) {
                    (Some(host), Some(port)) => format!("http://{host}:{port}"),
                    _ => {
                        return Err(violation(
                            name,
                            "url",
                            "http servers require a url (or host and port)",
                        ))
                    }
                },
            };
            let parsed = reqwest::Url::parse(&url)
                .map_err(|e| violation(name, "url", format!("invalid url '{url}': {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(violation(
                    name,
                    "url",
                    format!("unsupported scheme '{}'", parsed.scheme()),
                ));
            }
            let headers = string_map(obj, name, "headers")?
                .into_iter()
                .map(|(k, v)| (k, interpolate_env_vars(&v)))
                .collect();
            TransportConfig::Http { url, headers }
        }
    };

    let call_timeout = match obj.get("timeout") {
        Some(v) => Duration::from_millis(positive(v, name, "timeout")?),
        None => settings.default_timeout,
    };
    let connect_timeout = match obj.get("connect_timeout") {
        Some(v) => Duration::from_millis(positive(v, name, "connect_timeout")?),
        None => settings.connect_timeout,
    };
    let retry = match obj.get("retry") {
        Some(v) => Some(parse_retry(name, v, &settings.retry)?),
        None => None,
    };

    Ok(ServerConfig {
        name: name.to_string(),
        transport,
        connect_timeout,
        call_timeout,
        retry,
    })
}

fn parse_retry(name: &str, value: &Value, defaults: &RetryPolicy) -> Result<RetryPolicy, McpError> {
    let obj = value
        .as_object()
        .ok_or_else(|| violation(name, "retry", "expected an object"))?;
    let max_attempts = match obj.get("attempts") {
        Some(v) => positive_u32(v, name, "retry.attempts")?,
        None => defaults.max_attempts,
    };
    let base_delay = match obj.get("base_delay_ms") {
        Some(v) => Duration::from_millis(non_negative(v, name, "retry.base_delay_ms")?),
        None => defaults.base_delay,
    };
    let max_delay = match obj.get("max_delay_ms") {
        Some(v) => Duration::from_millis(non_negative(v, name, "retry.max_delay_ms")?),
        None => defaults.max_delay.max(base_delay),
    };
    if max_delay < base_delay {
        return Err(violation(
            name,
            "retry.max_delay_ms",
            "must not be smaller than base_delay_ms",
        ));
    }
    Ok(RetryPolicy {
        max_attempts,
        base_delay,
        max_delay,
    })
}

// ─── Field Helpers ───────────────────────────────────────────────────────────

type Object = serde_json::Map<String, Value>;

fn opt_string(obj: &Object, server: &str, field: &str) -> Result<Option<String>, McpError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(violation(server, field, "must be a string")),
    }
}

fn string_list(obj: &Object, server: &str, field: &str) -> Result<Vec<String>, McpError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| violation(server, field, "must be an array of strings"))
            })
            .collect(),
        Some(_) => Err(violation(server, field, "must be an array of strings")),
    }
}

fn string_map(
    obj: &Object,
    server: &str,
    field: &str,
) -> Result<BTreeMap<String, String>, McpError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                _ => Err(violation(
                    server,
                    &format!("{field}.{k}"),
                    "must be a string",
                )),
            })
            .collect(),
        Some(_) => Err(violation(server, field, "must be an object of strings")),
    }
}

fn opt_port(obj: &Object, server: &str) -> Result<Option<u16>, McpError> {
    match obj.get("port") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let port = v
                .as_u64()
                .filter(|p| (1..=65_535).contains(p))
                .ok_or_else(|| violation(server, "port", "must be an integer between 1 and 65535"))?;
            Ok(Some(port as u16))
        }
    }
}

fn positive(value: &Value, server: &str, field: &str) -> Result<u64, McpError> {
    value
        .as_u64()
        .filter(|v| *v > 0)
        .ok_or_else(|| violation(server, field, "must be a positive integer"))
}

fn positive_u32(value: &Value, server: &str, field: &str) -> Result<u32, McpError> {
    let v = positive(value, server, field)?;
    u32::try_from(v).map_err(|_| violation(server, field, "value too large"))
}

fn non_negative(value: &Value, server: &str, field: &str) -> Result<u64, McpError> {
    value
        .as_u64()
        .ok_or_else(|| violation(server, field, "must be a non-negative integer"))
}

// ─── Serialization Helpers ───────────────────────────────────────────────────

fn serialize_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

fn serialize_redacted<S: Serializer>(
    map: &BTreeMap<String, String>,
    s: S,
) -> Result<S::Ok, S::Error> {
    let redacted: BTreeMap<&str, &str> = map.keys().map(|k| (k.as_str(), "<redacted>")).collect();
    redacted.serialize(s)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "servers": {
            "memory": {
                "type": "stdio",
                "command": "python3",
                "args": ["-m", "memory_server"],
                "env": {"MONGO_URI": "mongodb://localhost"},
                "timeout": 15000
            },
            "docker": {"type": "socket", "host": "127.0.0.1", "port": 9000, "timeout": 5000},
            "api": {"type": "http", "url": "http://localhost:8080/mcp", "timeout": 20000}
        }
    }"#;

    fn expect_violation(text: &str, server: &str, field: &str) {
        match McpConfig::from_json_str(text) {
            Err(McpError::SchemaViolation {
                server: s,
                field: f,
                ..
            }) => {
                assert_eq!(s, server);
                assert_eq!(f, field);
            }
            other => panic!("expected SchemaViolation({server}, {field}), got {other:?}"),
        }
    }

    #[test]
    fn test_load_valid_document() {
        let config = McpConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.server_names(), vec!["api", "docker", "memory"]);

        let memory = config.server("memory").unwrap();
        assert_eq!(memory.kind(), TransportKind::Stdio);
        assert_eq!(memory.call_timeout, Duration::from_millis(15_000));
        assert_eq!(memory.connect_timeout, Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS));
        assert_eq!(memory.endpoint(), "python3 -m memory_server");

        let docker = config.server("docker").unwrap();
        assert_eq!(
            docker.transport,
            TransportConfig::Socket {
                host: "127.0.0.1".into(),
                port: 9000
            }
        );
        assert_eq!(config.server("api").unwrap().kind(), TransportKind::Http);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let first = McpConfig::from_json_str(SAMPLE).unwrap();
        let second = McpConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_flat_document_is_server_map() {
        let config = McpConfig::from_json_str(
            r#"{"memory": {"command": "memory-server"}}"#,
        )
        .unwrap();
        assert_eq!(config.server_names(), vec!["memory"]);
        assert_eq!(config.server("memory").unwrap().kind(), TransportKind::Stdio);
    }

    #[test]
    fn test_pipe_alias_for_stdio() {
        let config =
            McpConfig::from_json_str(r#"{"servers": {"m": {"type": "pipe", "command": "x"}}}"#)
                .unwrap();
        assert_eq!(config.server("m").unwrap().kind(), TransportKind::Stdio);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        assert!(matches!(
            McpConfig::from_json_str("{not json"),
            Err(McpError::Config { .. })
        ));
    }

    #[test]
    fn test_empty_server_list_rejected() {
        assert!(matches!(
            McpConfig::from_json_str(r#"{"servers": {}}"#),
            Err(McpError::Config { .. })
        ));
    }

    #[test]
    fn test_missing_command_names_server_and_field() {
        expect_violation(r#"{"servers": {"memory": {"type": "stdio"}}}"#, "memory", "command");
    }

    #[test]
    fn test_unknown_transport_type() {
        expect_violation(
            r#"{"servers": {"x": {"type": "carrier-pigeon", "command": "c"}}}"#,
            "x",
            "type",
        );
    }

    #[test]
    fn test_socket_requires_host_and_valid_port() {
        expect_violation(r#"{"servers": {"s": {"type": "socket", "port": 80}}}"#, "s", "host");
        expect_violation(r#"{"servers": {"s": {"type": "socket", "host": "h"}}}"#, "s", "port");
        expect_violation(
            r#"{"servers": {"s": {"type": "socket", "host": "h", "port": 70000}}}"#,
            "s",
            "port",
        );
    }

    #[test]
    fn test_http_url_or_host_port() {
        expect_violation(r#"{"servers": {"h": {"type": "http"}}}"#, "h", "url");
        expect_violation(
            r#"{"servers": {"h": {"type": "http", "url": "ftp://example.com"}}}"#,
            "h",
            "url",
        );

        let config = McpConfig::from_json_str(
            r#"{"servers": {"h": {"type": "http", "host": "localhost", "port": 8000}}}"#,
        )
        .unwrap();
        assert_eq!(config.server("h").unwrap().endpoint(), "http://localhost:8000");
    }

    #[test]
    fn test_timeouts_must_be_positive() {
        expect_violation(
            r#"{"servers": {"m": {"command": "c", "timeout": 0}}}"#,
            "m",
            "timeout",
        );
        expect_violation(
            r#"{"servers": {"m": {"command": "c", "timeout": -5}}}"#,
            "m",
            "timeout",
        );
        expect_violation(
            r#"{"servers": {"m": {"command": "c", "timeout": "fast"}}}"#,
            "m",
            "timeout",
        );
    }

    #[test]
    fn test_duplicate_server_names_rejected() {
        expect_violation(
            r#"{"servers": {"m": {"command": "a"}, "m": {"command": "b"}}}"#,
            "m",
            "name",
        );
    }

    #[test]
    fn test_global_settings_and_retry_override() {
        let config = McpConfig::from_json_str(
            r#"{
                "default_timeout": 1000,
                "retry_attempts": 5,
                "tool_cache_ttl": 60,
                "max_concurrency": 4,
                "servers": {
                    "a": {"command": "a"},
                    "b": {"command": "b", "retry": {"attempts": 2, "base_delay_ms": 10}}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.settings.retry.max_attempts, 5);
        assert_eq!(config.settings.tool_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.settings.max_concurrency, 4);

        let a = config.server("a").unwrap();
        assert_eq!(a.call_timeout, Duration::from_millis(1000));
        assert_eq!(a.retry_policy(&config.settings).max_attempts, 5);

        let b = config.server("b").unwrap().retry_policy(&config.settings);
        assert_eq!(b.max_attempts, 2);
        assert_eq!(b.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_global_setting_violation() {
        expect_violation(
            r#"{"retry_attempts": 0, "servers": {"a": {"command": "a"}}}"#,
            GLOBAL_SCOPE,
            "retry_attempts",
        );
    }

    #[test]
    fn test_header_credentials_interpolated() {
        std::env::set_var("__TOOLBRIDGE_TEST_TOKEN__", "s3cret");
        let config = McpConfig::from_json_str(
            r#"{"servers": {"api": {
                "type": "http",
                "url": "https://api.example.com/mcp",
                "headers": {"Authorization": "Bearer ${__TOOLBRIDGE_TEST_TOKEN__}"}
            }}}"#,
        )
        .unwrap();
        std::env::remove_var("__TOOLBRIDGE_TEST_TOKEN__");

        match &config.server("api").unwrap().transport {
            TransportConfig::Http { headers, .. } => {
                assert_eq!(headers["Authorization"], "Bearer s3cret");
            }
            other => panic!("expected http transport, got {other:?}"),
        }

        // Secrets never appear in the serialized form.
        let shown = serde_json::to_string(&config).unwrap();
        assert!(!shown.contains("s3cret"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLBRIDGE_NONEXISTENT_VAR__");
        let result = interpolate_env_vars("${__TOOLBRIDGE_NONEXISTENT_VAR__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("servers.yaml");
        std::fs::write(
            &path,
            "servers:\n  memory:\n    type: stdio\n    command: memory-server\n    timeout: 2500\n",
        )
        .unwrap();

        let config = McpConfig::load(&path).unwrap();
        assert_eq!(
            config.server("memory").unwrap().call_timeout,
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = McpConfig::load(Path::new("/nonexistent/toolbridge.json")).unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
    }

    #[test]
    fn test_unknown_server_lookup() {
        let config = McpConfig::from_json_str(SAMPLE).unwrap();
        assert!(matches!(
            config.server("nope"),
            Err(McpError::UnknownServer { .. })
        ));
    }
}
