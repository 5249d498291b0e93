//! Tool registration and dispatch.
//!
//! Each core operation is exposed as a named callable with a declared input
//! schema. Dispatch validates input shape before anything reaches the
//! resolver or the crypto path; core errors cross the boundary as a stable
//! machine-readable code plus message, with ambiguity candidates attached
//! for disambiguation prompts.

pub mod protocol;
pub mod server;

use serde_json::{json, Map, Value};

use crate::calendar::CalendarService;
use crate::error::CoreError;

use protocol::{JsonRpcError, ToolDefinition, APPLICATION_ERROR, INVALID_PARAMS};

/// Failures produced by tool dispatch.
#[derive(Debug)]
pub enum ToolError {
    /// Unknown tool name.
    UnknownTool(String),
    /// Input failed shape validation before reaching the core.
    InvalidParams(String),
    /// A core error, surfaced with its taxonomy code.
    Core(CoreError),
    /// Anything else (e.g. the outbound API failed).
    Internal(String),
}

impl ToolError {
    pub fn into_rpc_error(self) -> JsonRpcError {
        match self {
            ToolError::UnknownTool(name) => JsonRpcError {
                code: INVALID_PARAMS,
                message: format!("Unknown tool: {}", name),
                data: None,
            },
            ToolError::InvalidParams(message) => JsonRpcError {
                code: INVALID_PARAMS,
                message,
                data: None,
            },
            ToolError::Core(core) => {
                let mut data = Map::new();
                data.insert("code".to_string(), json!(core.code()));
                if !core.candidates().is_empty() {
                    data.insert("candidates".to_string(), json!(core.candidates()));
                }
                JsonRpcError {
                    code: APPLICATION_ERROR,
                    message: core.to_string(),
                    data: Some(Value::Object(data)),
                }
            }
            ToolError::Internal(message) => JsonRpcError {
                code: APPLICATION_ERROR,
                message,
                data: None,
            },
        }
    }
}

impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CoreError>() {
            Ok(core) => ToolError::Core(core),
            Err(other) => ToolError::Internal(other.to_string()),
        }
    }
}

impl From<CoreError> for ToolError {
    fn from(err: CoreError) -> Self {
        ToolError::Core(err)
    }
}

/// The account selector accepted by every calendar tool.
fn account_property() -> Value {
    json!({
        "type": "string",
        "description": "Account id, email, or a unique substring of either. \
                        Omit to use the only linked account."
    })
}

/// All registered tools with their input schemas.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "list-accounts".to_string(),
            description: "List all linked calendar accounts".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "resolve-account".to_string(),
            description: "Resolve an account selector to exactly one linked account".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "account": account_property() }
            }),
        },
        ToolDefinition {
            name: "list-calendars".to_string(),
            description: "List the calendars visible to an account".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "account": account_property() }
            }),
        },
        ToolDefinition {
            name: "list-events".to_string(),
            description: "List events on a calendar, optionally within a time window"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_property(),
                    "calendar_id": { "type": "string" },
                    "time_min": { "type": "string", "description": "RFC 3339 lower bound" },
                    "time_max": { "type": "string", "description": "RFC 3339 upper bound" }
                },
                "required": ["calendar_id"]
            }),
        },
        ToolDefinition {
            name: "get-event".to_string(),
            description: "Fetch a single event".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_property(),
                    "calendar_id": { "type": "string" },
                    "event_id": { "type": "string" }
                },
                "required": ["calendar_id", "event_id"]
            }),
        },
        ToolDefinition {
            name: "create-event".to_string(),
            description: "Create an event; the event body is passed through verbatim"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_property(),
                    "calendar_id": { "type": "string" },
                    "event": { "type": "object" }
                },
                "required": ["calendar_id", "event"]
            }),
        },
        ToolDefinition {
            name: "update-event".to_string(),
            description: "Update an event; the patch body is passed through verbatim"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_property(),
                    "calendar_id": { "type": "string" },
                    "event_id": { "type": "string" },
                    "event": { "type": "object" }
                },
                "required": ["calendar_id", "event_id", "event"]
            }),
        },
        ToolDefinition {
            name: "delete-event".to_string(),
            description: "Delete an event".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_property(),
                    "calendar_id": { "type": "string" },
                    "event_id": { "type": "string" }
                },
                "required": ["calendar_id", "event_id"]
            }),
        },
    ]
}

/// Dispatches one tool call after validating the argument shape.
pub async fn call_tool(
    service: &CalendarService,
    name: &str,
    arguments: &Value,
) -> Result<Value, ToolError> {
    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        // Missing arguments are the empty object
        Value::Null => &empty,
        _ => {
            return Err(ToolError::InvalidParams(
                "arguments must be an object".to_string(),
            ))
        }
    };
    let account = optional_str(args, "account")?;

    match name {
        "list-accounts" => {
            let accounts = service.list_accounts()?;
            Ok(json!({ "accounts": accounts }))
        }
        "resolve-account" => {
            let account = service.resolve_account(account)?;
            Ok(serde_json::to_value(account)
                .map_err(|e| ToolError::Internal(e.to_string()))?)
        }
        "list-calendars" => Ok(service.list_calendars(account).await?),
        "list-events" => {
            let calendar_id = required_str(args, "calendar_id")?;
            let time_min = optional_str(args, "time_min")?;
            let time_max = optional_str(args, "time_max")?;
            Ok(service
                .list_events(account, calendar_id, time_min, time_max)
                .await?)
        }
        "get-event" => {
            let calendar_id = required_str(args, "calendar_id")?;
            let event_id = required_str(args, "event_id")?;
            Ok(service.get_event(account, calendar_id, event_id).await?)
        }
        "create-event" => {
            let calendar_id = required_str(args, "calendar_id")?;
            let event = required_object(args, "event")?;
            Ok(service.create_event(account, calendar_id, event).await?)
        }
        "update-event" => {
            let calendar_id = required_str(args, "calendar_id")?;
            let event_id = required_str(args, "event_id")?;
            let event = required_object(args, "event")?;
            Ok(service
                .update_event(account, calendar_id, event_id, event)
                .await?)
        }
        "delete-event" => {
            let calendar_id = required_str(args, "calendar_id")?;
            let event_id = required_str(args, "event_id")?;
            service.delete_event(account, calendar_id, event_id).await?;
            Ok(json!({ "deleted": true }))
        }
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

// ----------------------------------------------------------------------
// Shape validation
// ----------------------------------------------------------------------

fn required_str<'a>(args: &'a Map<String, Value>, field: &str) -> Result<&'a str, ToolError> {
    match args.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(ToolError::InvalidParams(format!(
            "'{}' must not be empty",
            field
        ))),
        Some(_) => Err(ToolError::InvalidParams(format!(
            "'{}' must be a string",
            field
        ))),
        None => Err(ToolError::InvalidParams(format!(
            "missing required field '{}'",
            field
        ))),
    }
}

fn optional_str<'a>(args: &'a Map<String, Value>, field: &str) -> Result<Option<&'a str>, ToolError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ToolError::InvalidParams(format!(
            "'{}' must be a string",
            field
        ))),
    }
}

fn required_object<'a>(args: &'a Map<String, Value>, field: &str) -> Result<&'a Value, ToolError> {
    match args.get(field) {
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) => Err(ToolError::InvalidParams(format!(
            "'{}' must be an object",
            field
        ))),
        None => Err(ToolError::InvalidParams(format!(
            "missing required field '{}'",
            field
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::LinkRequest;
    use crate::calendar::CalendarClient;
    use crate::credentials::{CredentialStore, KdfParams, Keystore};
    use std::sync::Arc;

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
        CalendarService::new(store.clone(), keystore, client, None)
    }

    fn link(service: &CalendarService, email: &str, display_name: Option<&str>) {
        service
            .store
            .link_account(&LinkRequest {
                external_user_id: format!("ext-{}", email),
                email: email.to_string(),
                display_name: display_name.map(str::to_string),
                scopes: vec![],
            })
            .unwrap();
    }

    #[test]
    fn test_every_tool_declares_a_schema() {
        for tool in tool_definitions() {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
        }
        assert_eq!(tool_definitions().len(), 8);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let service = offline_service();
        let err = call_tool(&service, "no-such-tool", &json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_missing_required_field_rejected_before_core() {
        let service = offline_service();
        let err = call_tool(&service, "list-events", &json!({})).await.unwrap_err();
        match err {
            ToolError::InvalidParams(msg) => assert!(msg.contains("calendar_id")),
            other => panic!("expected InvalidParams, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrongly_typed_field_rejected() {
        let service = offline_service();
        let err = call_tool(&service, "get-event", &json!({"calendar_id": 5, "event_id": "e"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_resolve_account_surfaces_taxonomy_code() {
        let service = offline_service();
        let err = call_tool(&service, "resolve-account", &json!({})).await.unwrap_err();
        let rpc = err.into_rpc_error();
        assert_eq!(rpc.code, protocol::APPLICATION_ERROR);
        assert_eq!(rpc.data.unwrap()["code"], "NO_ACCOUNTS_LINKED");
    }

    #[tokio::test]
    async fn test_ambiguity_carries_candidates() {
        let service = offline_service();
        link(&service, "aa@x.com", Some("shared"));
        link(&service, "zz@x.com", Some("shared"));

        let err = call_tool(&service, "resolve-account", &json!({"account": "shared"}))
            .await
            .unwrap_err();
        let rpc = err.into_rpc_error();
        let data = rpc.data.unwrap();
        assert_eq!(data["code"], "AMBIGUOUS_ACCOUNT");
        assert_eq!(data["candidates"], json!(["aa@x.com", "zz@x.com"]));
    }

    #[tokio::test]
    async fn test_list_accounts() {
        let service = offline_service();
        link(&service, "a@x.com", None);

        let result = call_tool(&service, "list-accounts", &json!({})).await.unwrap();
        assert_eq!(result["accounts"][0]["email"], "a@x.com");
    }

    #[tokio::test]
    async fn test_null_arguments_treated_as_empty() {
        let service = offline_service();
        link(&service, "a@x.com", None);
        let result = call_tool(&service, "resolve-account", &Value::Null).await.unwrap();
        assert_eq!(result["email"], "a@x.com");
    }
}
