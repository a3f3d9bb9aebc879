//! MCP server: a JSON-RPC 2.0 subset over stdin/stdout.
//!
//! The dispatcher reads newline-delimited JSON requests, routes
//! `initialize`, `tools/list`, and `tools/call` to the registry, and
//! writes exactly one response line per request, in input order. It is
//! single-threaded and stateless: each request re-reads the store, so a
//! concurrently running `devrack run` is always reflected. One bad line
//! never terminates the session; only an input-stream failure does.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::registry::{CleanArgs, KillArgs, ListArgs, LogsArgs, Registry, ShowArgs};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const TOOL_FAILED: i32 = -32603;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: &str, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// The MCP dispatcher: a stateless router over the registry.
pub struct McpServer {
    registry: Registry,
}

impl McpServer {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Runs the request/response loop until end of input.
    ///
    /// Every input line gets exactly one response line, in order; an
    /// unparsable line (including an empty one) gets a parse error. The
    /// only exemption is a well-formed `notifications/*` request, which
    /// carries no id and gets no response.
    ///
    /// Generic over its streams so tests can drive it with in-memory
    /// buffers; production passes locked stdin/stdout.
    pub fn serve<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> Result<()> {
        for line in reader.lines() {
            let line = line.context("failed to read request line")?;
            if let Some(response) = self.handle_line(&line) {
                let encoded = serde_json::to_string(&response)
                    .context("failed to encode response")?;
                writeln!(writer, "{}", encoded).context("failed to write response")?;
                writer.flush().context("failed to flush response")?;
            }
        }
        Ok(())
    }

    /// Handles one input line. Returns `None` for notifications, which
    /// get no response.
    fn handle_line(&self, line: &str) -> Option<RpcResponse> {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                return Some(RpcResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    "Parse error",
                    Some(Value::String(err.to_string())),
                ));
            }
        };
        debug!(method = %request.method, "handling request");

        if request.method.starts_with("notifications/") {
            return None;
        }

        let RpcRequest {
            id, method, params, ..
        } = request;
        Some(match method.as_str() {
            "initialize" => RpcResponse::result(id, initialize_result()),
            "tools/list" => RpcResponse::result(id, json!({ "tools": tool_catalog() })),
            "tools/call" => self.handle_tool_call(id, params),
            _ => RpcResponse::error(id, METHOD_NOT_FOUND, "Method not found", None),
        })
    }

    fn handle_tool_call(&self, id: Value, params: Value) -> RpcResponse {
        let call: CallParams = match serde_json::from_value(params) {
            Ok(call) => call,
            Err(err) => {
                return RpcResponse::error(
                    id,
                    INVALID_PARAMS,
                    "Invalid params",
                    Some(Value::String(err.to_string())),
                );
            }
        };
        let arguments = match call.arguments {
            Value::Null => json!({}),
            other => other,
        };

        // Convert the loose argument bag to the tool's typed request once,
        // here at the boundary.
        let outcome = match call.name.as_str() {
            "process_list" => self.invoke(arguments, |args: ListArgs| {
                self.registry.list(args).and_then(to_value)
            }),
            "process_show" => self.invoke(arguments, |args: ShowArgs| {
                self.registry.show(args).and_then(to_value)
            }),
            "process_logs" => self.invoke(arguments, |args: LogsArgs| {
                self.registry.logs(args).and_then(to_value)
            }),
            "process_kill" => self.invoke(arguments, |args: KillArgs| {
                self.registry.kill(args).and_then(to_value)
            }),
            "process_clean" => self.invoke(arguments, |args: CleanArgs| {
                self.registry.clean(args).and_then(to_value)
            }),
            other => {
                return RpcResponse::error(
                    id,
                    INVALID_PARAMS,
                    "Unknown tool",
                    Some(Value::String(other.to_string())),
                );
            }
        };

        match outcome {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result)
                    .unwrap_or_else(|_| result.to_string());
                RpcResponse::result(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }]
                    }),
                )
            }
            Err(ToolError::BadArguments(message)) => RpcResponse::error(
                id,
                INVALID_PARAMS,
                "Invalid params",
                Some(Value::String(message)),
            ),
            Err(ToolError::Failed(message)) => RpcResponse::error(
                id,
                TOOL_FAILED,
                "Tool execution failed",
                Some(Value::String(message)),
            ),
        }
    }

    fn invoke<A, F>(&self, arguments: Value, op: F) -> std::result::Result<Value, ToolError>
    where
        A: serde::de::DeserializeOwned,
        F: FnOnce(A) -> crate::error::Result<Value>,
    {
        let args: A = serde_json::from_value(arguments)
            .map_err(|err| ToolError::BadArguments(err.to_string()))?;
        op(args).map_err(|err| ToolError::Failed(err.to_string()))
    }
}

enum ToolError {
    BadArguments(String),
    Failed(String),
}

fn to_value<T: Serialize>(value: T) -> crate::error::Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| crate::error::RegistryError::Protocol(err.to_string()))
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": "devrack-mcp",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

fn tool_catalog() -> Value {
    json!([
        {
            "name": "process_list",
            "description": "List all processes started by devrack run",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "description": "Filter by status",
                        "enum": ["running", "completed", "failed"],
                    },
                    "limit": {
                        "type": "number",
                        "description": "Limit number of results",
                    },
                },
            },
        },
        {
            "name": "process_show",
            "description": "Show detailed information about a specific process",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "process_id": {
                        "type": "string",
                        "description": "Process ID to show",
                    },
                },
                "required": ["process_id"],
            },
        },
        {
            "name": "process_logs",
            "description": "View process logs (stdout and stderr)",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "process_id": {
                        "type": "string",
                        "description": "Process ID",
                    },
                    "stream": {
                        "type": "string",
                        "description": "Which stream to show",
                        "enum": ["stdout", "stderr", "both"],
                        "default": "both",
                    },
                    "lines": {
                        "type": "number",
                        "description": "Number of lines to show",
                        "default": 100,
                    },
                },
                "required": ["process_id"],
            },
        },
        {
            "name": "process_kill",
            "description": "Send signal to terminate a running process",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "process_id": {
                        "type": "string",
                        "description": "Process ID to kill",
                    },
                    "signal": {
                        "type": "string",
                        "description": "Signal to send",
                        "enum": ["SIGTERM", "SIGKILL"],
                        "default": "SIGTERM",
                    },
                },
                "required": ["process_id"],
            },
        },
        {
            "name": "process_clean",
            "description": "Remove process logs and metadata",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "all": {
                        "type": "boolean",
                        "description": "Clean all processes",
                    },
                    "completed": {
                        "type": "boolean",
                        "description": "Only completed processes",
                    },
                    "failed": {
                        "type": "boolean",
                        "description": "Only failed processes",
                    },
                    "before": {
                        "type": "string",
                        "description": "Processes started before date (RFC 3339)",
                    },
                },
            },
        },
    ])
}
