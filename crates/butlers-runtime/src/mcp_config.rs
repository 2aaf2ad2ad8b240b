//! MCP config generation for adapter subprocesses.

use butlers_core::{ButlerName, SessionId};
use serde_json::Value;

/// Build the MCP config handed to the CLI.
///
/// Exactly one server is configured: the parent butler's own mesh
/// endpoint. The `runtime_session_id` query parameter lets the daemon's
/// middleware bind incoming tool calls back to this session for
/// ground-truth capture.
#[must_use]
pub fn mesh_mcp_config(butler: &ButlerName, port: u16, session_id: SessionId) -> Value {
    let url = format!("http://127.0.0.1:{port}/?runtime_session_id={session_id}");
    serde_json::json!({
        "mcpServers": {
            butler.as_str(): {
                "type": "http",
                "url": url,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_points_only_at_parent() {
        let session_id = SessionId::new();
        let config = mesh_mcp_config(&"health".into(), 8351, session_id);
        let servers = config["mcpServers"].as_object().unwrap();
        assert_eq!(servers.len(), 1);
        let url = servers["health"]["url"].as_str().unwrap();
        assert!(url.contains("127.0.0.1:8351"));
        assert!(url.contains(&format!("runtime_session_id={session_id}")));
    }
}
