//! Tool discovery over `tools/list`.
//!
//! Follows `nextCursor` pagination until the server stops returning one and
//! turns each wire definition into an immutable [`ToolDescriptor`].

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;

use super::errors::McpError;
use super::transport::{request, Transport};
use super::types::{extract_result, ListToolsResult, ToolDescriptor};

/// Upper bound on pages fetched in one discovery.
const MAX_PAGES: usize = 100;

/// Fetch the full tool list from a connected server.
///
/// Entries without a name, and repeated names, are skipped with a warning.
pub async fn discover_tools(
    transport: &dyn Transport,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let server = transport.server_name();
    let refreshed_at = Utc::now();
    let mut tools = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: Option<String> = None;

    for page in 0..MAX_PAGES {
        let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
        let response = request(transport, "tools/list", params, timeout).await?;
        let result = extract_result(response)?;
        let listing: ListToolsResult = serde_json::from_value(result).map_err(|e| {
            McpError::transport(server, format!("invalid tools/list response: {e}"))
        })?;

        for mut def in listing.tools {
            if def.name.trim().is_empty() {
                tracing::warn!(server = %server, "skipping tool without a name");
                continue;
            }
            if !seen.insert(def.name.clone()) {
                tracing::warn!(server = %server, tool = %def.name, "skipping duplicate tool");
                continue;
            }
            if def.input_schema.is_null() {
                def.input_schema = serde_json::json!({"type": "object", "properties": {}});
            }
            tools.push(ToolDescriptor::from_definition(server, def, refreshed_at));
        }

        match listing.next_cursor.filter(|c| !c.is_empty()) {
            Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                tracing::warn!(server = %server, cursor = %next, "server repeated its cursor, stopping");
                break;
            }
            Some(next) => cursor = Some(next),
            None => break,
        }

        if page + 1 == MAX_PAGES {
            tracing::warn!(server = %server, pages = MAX_PAGES, "tools/list pagination limit reached");
        }
    }

    tracing::debug!(server = %server, count = tools.len(), "discovered tools");
    Ok(tools)
}
