//! Tool registry — per-server snapshots of discovered tools.
//!
//! Each server's tools live in one immutable [`ToolSet`] behind an `Arc`.
//! A refresh builds a new set and swaps the pointer, so a reader holds
//! either the complete old set or the complete new one. Only servers in the
//! `Connected` state have a live set; the connection manager evicts on every
//! transition out of `Connected`, and evicted sets move to a "last known"
//! bucket that is never used for resolution.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::errors::McpError;
use super::locks::{lock, read, write};
use super::types::ToolDescriptor;

/// Suggestions attached to `ToolNotFound`.
const MAX_SUGGESTIONS: usize = 3;

/// Below this similarity a tool is not worth suggesting.
const SUGGESTION_FLOOR: f64 = 0.3;

// ─── ToolSet ─────────────────────────────────────────────────────────────────

/// Every tool one server exposed in one discovery, in discovery order.
#[derive(Debug)]
pub struct ToolSet {
    pub server: String,
    pub tools: Vec<ToolDescriptor>,
    pub refreshed_at: DateTime<Utc>,
    fetched: Instant,
}

impl ToolSet {
    fn new(server: &str, tools: Vec<ToolDescriptor>) -> Self {
        Self {
            server: server.to_string(),
            tools,
            refreshed_at: Utc::now(),
            fetched: Instant::now(),
        }
    }

    pub fn get(&self, tool: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == tool)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.fetched.elapsed()
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Holds the queryable tool sets for all connected servers.
pub struct ToolRegistry {
    ttl: Duration,
    live: RwLock<HashMap<String, Arc<ToolSet>>>,
    last_known: RwLock<HashMap<String, Arc<ToolSet>>>,
    refreshing: Mutex<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            live: RwLock::new(HashMap::new()),
            last_known: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replace a server's tool set wholesale.
    ///
    /// Callers must only publish for a server that is `Connected`.
    pub fn publish(&self, server: &str, tools: Vec<ToolDescriptor>) -> Arc<ToolSet> {
        let set = Arc::new(ToolSet::new(server, tools));
        write(&self.live).insert(server.to_string(), set.clone());
        tracing::info!(server = %server, count = set.len(), "tool set published");
        set
    }

    /// Remove a server's tools from resolution, keeping them for diagnostics.
    pub fn evict(&self, server: &str) {
        let removed = write(&self.live).remove(server);
        if let Some(set) = removed {
            tracing::info!(server = %server, count = set.len(), "tool set evicted");
            write(&self.last_known).insert(server.to_string(), set);
        }
    }

    /// Current snapshot of one server's tools.
    pub fn tool_set(&self, server: &str) -> Option<Arc<ToolSet>> {
        read(&self.live).get(server).cloned()
    }

    /// Evicted snapshot of one server's tools, if any.
    pub fn last_known(&self, server: &str) -> Option<Arc<ToolSet>> {
        read(&self.last_known).get(server).cloned()
    }

    /// Snapshots of every live set, ordered by server name.
    fn snapshot(&self) -> Vec<Arc<ToolSet>> {
        let mut sets: Vec<_> = read(&self.live).values().cloned().collect();
        sets.sort_by(|a, b| a.server.cmp(&b.server));
        sets
    }

    // ─── Resolution ──────────────────────────────────────────────────────

    /// Resolve a tool name, optionally pinned to a server.
    ///
    /// A bare name exposed by more than one server is `AmbiguousTool`. A bare
    /// name no server exposes is retried as `server.tool`.
    pub fn resolve(&self, tool: &str, server: Option<&str>) -> Result<ToolDescriptor, McpError> {
        if let Some(server) = server {
            return self
                .tool_set(server)
                .and_then(|set| set.get(tool).cloned())
                .ok_or_else(|| self.not_found(&format!("{server}.{tool}")));
        }

        let mut matches: Vec<ToolDescriptor> = self
            .snapshot()
            .iter()
            .filter_map(|set| set.get(tool).cloned())
            .collect();

        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => match tool.split_once('.') {
                Some((server, bare)) => self
                    .tool_set(server)
                    .and_then(|set| set.get(bare).cloned())
                    .ok_or_else(|| self.not_found(tool)),
                None => Err(self.not_found(tool)),
            },
            _ => Err(McpError::AmbiguousTool {
                name: tool.to_string(),
                candidates: matches.iter().map(ToolDescriptor::qualified_name).collect(),
            }),
        }
    }

    fn not_found(&self, name: &str) -> McpError {
        McpError::ToolNotFound {
            name: name.to_string(),
            suggestions: self.find_similar(name, MAX_SUGGESTIONS),
        }
    }

    /// Server whose evicted set holds `tool` (bare or `server.tool`).
    ///
    /// Used to report why a tool is unavailable, never to dispatch.
    pub fn last_known_owner(&self, tool: &str, server: Option<&str>) -> Option<String> {
        let last_known = read(&self.last_known);
        if let Some(server) = server {
            return last_known
                .get(server)
                .filter(|set| set.get(tool).is_some())
                .map(|set| set.server.clone());
        }
        if let Some((server, bare)) = tool.split_once('.') {
            if last_known.get(server).is_some_and(|set| set.get(bare).is_some()) {
                return Some(server.to_string());
            }
        }
        let mut owners: Vec<&String> = last_known
            .values()
            .filter(|set| set.get(tool).is_some())
            .map(|set| &set.server)
            .collect();
        owners.sort();
        owners.first().map(|s| s.to_string())
    }

    /// Up to `max_results` qualified tool names most similar to `name`.
    ///
    /// A qualified query (`server.tool`) is compared on its tool part.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = name.rsplit('.').next().unwrap_or(name).to_lowercase();

        let mut scored: Vec<(String, f64)> = self
            .snapshot()
            .iter()
            .flat_map(|set| set.tools.iter())
            .map(|t| (t.qualified_name(), similarity(&query, &t.name.to_lowercase())))
            .filter(|(_, score)| *score > SUGGESTION_FLOOR)
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// All live tools, optionally restricted to one server.
    pub fn list(&self, server: Option<&str>) -> Vec<ToolDescriptor> {
        self.snapshot()
            .iter()
            .filter(|set| server.map_or(true, |s| s == set.server))
            .flat_map(|set| set.tools.iter().cloned())
            .collect()
    }

    /// Case-insensitive keyword search over names and descriptions.
    ///
    /// Every whitespace-separated term must appear in the name or the
    /// description. An empty query matches everything.
    pub fn search(&self, query: &str) -> Vec<ToolDescriptor> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        self.snapshot()
            .iter()
            .flat_map(|set| set.tools.iter())
            .filter(|tool| {
                let name = tool.name.to_lowercase();
                let description = tool.description.to_lowercase();
                terms
                    .iter()
                    .all(|term| name.contains(term) || description.contains(term))
            })
            .cloned()
            .collect()
    }

    /// Tool count per live server.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        read(&self.live)
            .iter()
            .map(|(name, set)| (name.clone(), set.len()))
            .collect()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.server.clone()).collect()
    }

    /// Total number of live tools.
    pub fn len(&self) -> usize {
        read(&self.live).values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─── Staleness ───────────────────────────────────────────────────────

    pub fn is_stale(&self, server: &str) -> bool {
        self.tool_set(server)
            .is_some_and(|set| set.age() >= self.ttl)
    }

    /// Live servers whose set is older than the TTL.
    pub fn stale_servers(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|set| set.age() >= self.ttl)
            .map(|set| set.server.clone())
            .collect()
    }

    /// Claim the right to refresh `server`. Returns `None` while another
    /// refresh of the same server is running.
    pub fn begin_refresh(&self, server: &str) -> Option<RefreshGuard<'_>> {
        let mut refreshing = lock(&self.refreshing);
        if refreshing.insert(server.to_string()) {
            Some(RefreshGuard {
                registry: self,
                server: server.to_string(),
            })
        } else {
            None
        }
    }

    // ─── Summary ─────────────────────────────────────────────────────────

    /// One-paragraph overview of what is currently callable.
    pub fn capability_summary(&self) -> String {
        let sets = self.snapshot();
        if sets.is_empty() {
            return "No tools currently available.".to_string();
        }

        let total: usize = sets.iter().map(|s| s.len()).sum();
        let parts: Vec<String> = sets
            .iter()
            .map(|s| format!("{} ({})", s.server, s.len()))
            .collect();
        let mut summary = format!(
            "Available capabilities ({total} tools across {} servers): {}.",
            sets.len(),
            parts.join(", "),
        );

        let stale = self.stale_servers();
        if !stale.is_empty() {
            summary.push_str(&format!("\nRefresh pending: {}.", stale.join(", ")));
        }
        summary
    }
}

/// Releases a refresh claim on drop.
pub struct RefreshGuard<'a> {
    registry: &'a ToolRegistry,
    server: String,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        lock(&self.registry.refreshing).remove(&self.server);
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein distance over chars, single-row DP.
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut diag = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = (above + 1)
                .min(row[j] + 1)
                .min(diag + usize::from(ca != *cb));
            diag = above;
        }
    }

    row[b.len()]
}

/// Normalized similarity: 1.0 identical, 0.0 nothing in common.
fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

// ─── Tests ───────────────────────────────────────────────────────────────────
