//! `toolmesh call`: Invoke a single tool and print its result.

use serde_json::Value;
use toolmesh_core::ToolmeshConfig;

use super::{print_json, Session};

pub async fn run(
    config: &ToolmeshConfig,
    provider: &str,
    tool: &str,
    arguments: &str,
) -> Result<(), String> {
    let arguments: Value =
        serde_json::from_str(arguments).map_err(|e| format!("Invalid --args JSON: {}", e))?;
    if !arguments.is_object() {
        return Err("--args must be a JSON object".to_string());
    }
    if config.provider(provider).is_none() {
        return Err(format!("Provider '{}' is not configured", provider));
    }

    let session = Session::open(config).await;
    let result = session.manager.call_tool(tool, provider, arguments).await;
    session.close().await;

    let result = result.map_err(|e| e.to_string())?;
    print_json(&result);
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(format!("Tool '{}' reported an error", tool));
    }
    Ok(())
}
