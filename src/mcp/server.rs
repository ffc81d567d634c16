use crate::app::App;
use crate::errors::{ErrorCode, GatewayError, GatewayErrorKind, RpcError};
use crate::managers::targets::Target;
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::services::validation::Validation;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

const PROTOCOL_VERSION: &str = "2025-06-18";
const SERVER_NAME: &str = "sshgate";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maps typed gateway errors onto JSON-RPC failures. The message carries
/// the stable code and reason; audit-only details never cross this
/// boundary.
fn map_gateway_error(error: &GatewayError) -> RpcError {
    let mut lines = vec![
        format!("code: {}", error.code),
        format!("message: {}", error.message),
    ];
    if let Some(hint) = &error.hint {
        lines.push(format!("hint: {}", hint));
    }
    let message = lines.join("\n");
    let code = match error.kind {
        GatewayErrorKind::Validation => ErrorCode::InvalidParams,
        GatewayErrorKind::Authentication
        | GatewayErrorKind::Authorization
        | GatewayErrorKind::Security => ErrorCode::InvalidRequest,
        GatewayErrorKind::Pool if error.code == "ACQUIRE_TIMEOUT" => ErrorCode::RequestTimeout,
        GatewayErrorKind::Execution if error.code == "EXECUTION_TIMEOUT" => {
            ErrorCode::RequestTimeout
        }
        _ => ErrorCode::InternalError,
    };
    RpcError::new(code, message)
}

fn tool_descriptor(name: &str, description: &str, schema: Value) -> Value {
    serde_json::json!({
        "name": name,
        "description": description,
        "inputSchema": schema,
    })
}

pub struct McpServer {
    app: Arc<App>,
    validation: Validation,
}

impl McpServer {
    pub fn new(app: Arc<App>) -> Self {
        Self {
            app,
            validation: Validation::new(),
        }
    }

    fn handle_initialize(&self) -> Value {
        serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {
                "name": SERVER_NAME,
                "version": SERVER_VERSION,
            },
        })
    }

    fn handle_tools_list(&self) -> Value {
        let operations = self.app.gateway.operation_names();
        serde_json::json!({
            "tools": [
                tool_descriptor(
                    "gateway_execute",
                    "Run a vetted operation on a registered target",
                    serde_json::json!({
                        "type": "object",
                        "properties": {
                            "target_id": {"type": "string"},
                            "operation": {"type": "string", "enum": operations},
                            "args": {"type": "array", "items": {"type": "string"}},
                            "token": {"type": "string", "description": "Caller bearer token"},
                        },
                        "required": ["target_id", "operation", "token"],
                    }),
                ),
                tool_descriptor(
                    "gateway_register_target",
                    "Register a remote target by credential reference",
                    serde_json::json!({
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "host": {"type": "string"},
                            "port": {"type": "integer", "default": 22},
                            "username": {"type": "string"},
                            "credential_ref": {"type": "string"},
                            "allowed_operations": {"type": "array", "items": {"type": "string"}},
                            "tags": {"type": "array", "items": {"type": "string"}},
                        },
                        "required": ["id", "host", "username", "credential_ref"],
                    }),
                ),
                tool_descriptor(
                    "gateway_remove_target",
                    "Remove a target and tear down its session pool",
                    serde_json::json!({
                        "type": "object",
                        "properties": {"target_id": {"type": "string"}},
                        "required": ["target_id"],
                    }),
                ),
                tool_descriptor(
                    "gateway_list_targets",
                    "List registered targets",
                    serde_json::json!({"type": "object", "properties": {}}),
                ),
                tool_descriptor(
                    "gateway_check_target",
                    "Probe connectivity to a registered target",
                    serde_json::json!({
                        "type": "object",
                        "properties": {"target_id": {"type": "string"}},
                        "required": ["target_id"],
                    }),
                ),
                tool_descriptor(
                    "gateway_status",
                    "Pool, cache and audit statistics",
                    serde_json::json!({"type": "object", "properties": {}}),
                ),
            ],
        })
    }

    async fn dispatch_tool(&self, name: &str, args: &Value) -> Result<Value, GatewayError> {
        match name {
            "gateway_execute" => {
                let target_id = self
                    .validation
                    .ensure_string(args.get("target_id").unwrap_or(&Value::Null), "target_id")?;
                let operation = self
                    .validation
                    .ensure_string(args.get("operation").unwrap_or(&Value::Null), "operation")?;
                let token = self
                    .validation
                    .ensure_string(args.get("token").unwrap_or(&Value::Null), "token")?;
                let call_args: Vec<Value> = match args.get("args") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items.clone(),
                    Some(_) => {
                        return Err(GatewayError::validation("args must be an array"))
                    }
                };
                let result = self
                    .app
                    .gateway
                    .execute(&target_id, &operation, &call_args, &token)
                    .await?;
                serde_json::to_value(&result)
                    .map_err(|err| GatewayError::internal(err.to_string()))
            }
            "gateway_register_target" => {
                let target = Target::from_value(&self.validation, args)?;
                self.app.gateway.register_target(target)?;
                Ok(serde_json::json!({"registered": true}))
            }
            "gateway_remove_target" => {
                let target_id = self
                    .validation
                    .ensure_string(args.get("target_id").unwrap_or(&Value::Null), "target_id")?;
                self.app.gateway.remove_target(&target_id).await?;
                Ok(serde_json::json!({"removed": true}))
            }
            "gateway_list_targets" => {
                let targets = self.app.gateway.list_targets();
                serde_json::to_value(&targets)
                    .map_err(|err| GatewayError::internal(err.to_string()))
            }
            "gateway_check_target" => {
                let target_id = self
                    .validation
                    .ensure_string(args.get("target_id").unwrap_or(&Value::Null), "target_id")?;
                let healthy = self.app.gateway.check_target(&target_id).await?;
                Ok(serde_json::json!({"healthy": healthy}))
            }
            "gateway_status" => Ok(self.app.gateway.status().await),
            _ => Err(GatewayError::validation(format!("Unknown tool: {}", name))),
        }
    }

    async fn handle_tools_call(&self, name: &str, args: Value) -> Result<Value, RpcError> {
        let result = self
            .dispatch_tool(name, &args)
            .await
            .map_err(|err| map_gateway_error(&err))?;
        Ok(serde_json::json!({
            "content": [{
                "type": "text",
                "text": serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string()),
            }]
        }))
    }

    pub async fn run_stdio(&self) -> Result<(), GatewayError> {
        let stdin = tokio::io::stdin();
        let stdout = tokio::io::stdout();
        let mut reader = BufReader::new(stdin).lines();
        let mut writer = BufWriter::new(stdout);

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|err| GatewayError::internal(err.to_string()))?
        {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(request) => request,
                Err(_) => {
                    let response = JsonRpcResponse::failure(
                        Value::Null,
                        ErrorCode::ParseError.as_i32(),
                        "Parse error".to_string(),
                    );
                    write_response(&mut writer, &response).await?;
                    continue;
                }
            };

            let response = match request.method.as_str() {
                _ if request.method.starts_with("notifications/") && request.id.is_none() => None,
                "initialize" => request
                    .id
                    .map(|id| JsonRpcResponse::success(id, self.handle_initialize())),
                "tools/list" => request
                    .id
                    .map(|id| JsonRpcResponse::success(id, self.handle_tools_list())),
                "tools/call" => match request.id {
                    Some(id) => {
                        let params = request.params.as_object().cloned().unwrap_or_default();
                        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
                        if name.is_empty() {
                            Some(JsonRpcResponse::failure(
                                id,
                                ErrorCode::InvalidParams.as_i32(),
                                "Missing tool name".to_string(),
                            ))
                        } else {
                            let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                            Some(match self.handle_tools_call(name, args).await {
                                Ok(result) => JsonRpcResponse::success(id, result),
                                Err(err) => {
                                    JsonRpcResponse::failure(id, err.code.as_i32(), err.message)
                                }
                            })
                        }
                    }
                    None => None,
                },
                _ => request.id.map(|id| {
                    JsonRpcResponse::failure(
                        id,
                        ErrorCode::MethodNotFound.as_i32(),
                        "Method not found".to_string(),
                    )
                }),
            };

            if let Some(response) = response {
                write_response(&mut writer, &response).await?;
            }
        }

        Ok(())
    }
}

async fn write_response(
    writer: &mut BufWriter<tokio::io::Stdout>,
    response: &JsonRpcResponse,
) -> Result<(), GatewayError> {
    let payload = serde_json::to_string(response).unwrap_or_default();
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub async fn run_stdio(app: Arc<App>) -> Result<(), GatewayError> {
    let server = McpServer::new(app);
    server.run_stdio().await
}
