//! Newline-delimited JSON-RPC server over stdio.
//!
//! One local caller per invocation; requests are handled sequentially in
//! arrival order. Responses go to stdout, one JSON object per line; logs go
//! to stderr so they never interleave with the protocol stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::calendar::CalendarService;

use super::protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION,
};
use super::{call_tool, tool_definitions, ToolError};

/// Serves tool calls over stdin/stdout until EOF.
pub async fn serve(service: Arc<CalendarService>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => {
                let is_notification = request.id.is_none();
                let response = handle_request(&service, request).await;
                if is_notification {
                    continue;
                }
                response
            }
            Err(e) => JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError {
                    code: PARSE_ERROR,
                    message: format!("Invalid JSON-RPC request: {}", e),
                    data: None,
                },
            ),
        };

        let mut encoded =
            serde_json::to_vec(&response).context("Failed to encode response")?;
        encoded.push(b'\n');
        stdout
            .write_all(&encoded)
            .await
            .context("Failed to write response")?;
        stdout.flush().await.context("Failed to flush stdout")?;
    }

    debug!("stdin closed, shutting down");
    Ok(())
}

async fn handle_request(service: &CalendarService, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone().unwrap_or(Value::Null);

    match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "calbridge",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        ),
        "notifications/initialized" => JsonRpcResponse::success(id, Value::Null),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": tool_definitions() })),
        "tools/call" => {
            let params = request.params.unwrap_or(Value::Null);
            let name = params.get("name").and_then(Value::as_str);
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

            let Some(name) = name else {
                return JsonRpcResponse::failure(
                    id,
                    ToolError::InvalidParams("missing tool name".to_string()).into_rpc_error(),
                );
            };

            debug!(tool = name, "tool call");
            match call_tool(service, name, &arguments).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(err) => {
                    let rpc = err.into_rpc_error();
                    warn!(tool = name, code = rpc.code, "tool call failed: {}", rpc.message);
                    JsonRpcResponse::failure(id, rpc)
                }
            }
        }
        other => JsonRpcResponse::failure(
            id,
            JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Unknown method: {}", other),
                data: None,
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarClient;
    use crate::credentials::{CredentialStore, KdfParams, Keystore};

    fn offline_service() -> CalendarService {
        let store = Arc::new(CredentialStore::new(":memory:").unwrap());
        let keystore = Arc::new(Keystore::with_params(
            store.clone(),
            KdfParams {
                log_n: 5,
                r: 8,
                p: 1,
            },
        ));
        let client = CalendarClient::new(
            "http://127.0.0.1:1".to_string(),
            "http://127.0.0.1:1/token".to_string(),
            "id".to_string(),
            "secret".to_string(),
        );
        CalendarService::new(store, keystore, client, None)
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: method.to_string(),
            params: Some(params),
        }
    }

    #[tokio::test]
    async fn test_initialize() {
        let service = offline_service();
        let response = handle_request(&service, request("initialize", json!({}))).await;
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "calbridge");
    }

    #[tokio::test]
    async fn test_tools_list_declares_all_tools() {
        let service = offline_service();
        let response = handle_request(&service, request("tools/list", json!({}))).await;
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, tool_definitions().len());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let service = offline_service();
        let response = handle_request(&service, request("bogus/method", json!({}))).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tools_call_without_name() {
        let service = offline_service();
        let response = handle_request(&service, request("tools/call", json!({}))).await;
        assert!(response.error.unwrap().message.contains("tool name"));
    }

    #[tokio::test]
    async fn test_tools_call_surfaces_structured_error() {
        let service = offline_service();
        let response = handle_request(
            &service,
            request("tools/call", json!({"name": "resolve-account", "arguments": {}})),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.data.unwrap()["code"], "NO_ACCOUNTS_LINKED");
    }
}
