pub mod cli;
pub mod logging;
pub mod mcp_client;
