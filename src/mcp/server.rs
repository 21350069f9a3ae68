//! MCP Server implementation
//!
//! Line-delimited JSON-RPC over stdio. Stdout carries protocol messages
//! only; logs go to stderr.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::Result;
use crate::mcp::tools::ToolHandler;
use crate::mcp::types::*;
use crate::oauth::OAuthProvider;

/// MCP Server info
const SERVER_NAME: &str = "gmail";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// MCP Server for Gmail
pub struct McpServer<P: OAuthProvider> {
    /// Tool handler
    tool_handler: ToolHandler<P>,

    /// Whether the client sent `notifications/initialized`
    initialized: bool,
}

impl<P: OAuthProvider> McpServer<P> {
    /// Create a new MCP server
    pub fn new(tool_handler: ToolHandler<P>) -> Self {
        Self {
            tool_handler,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Run the server on stdio
    pub async fn run_stdio(&mut self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.run(stdin, stdout).await
    }

    /// Serve requests from `reader` until EOF, writing responses to `writer`
    pub async fn run<R, W>(&mut self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            if let Some(response) = self.handle_message(&line).await {
                let mut response_str = serde_json::to_string(&response)?;
                response_str.push('\n');
                writer.write_all(response_str.as_bytes()).await?;
                writer.flush().await?;
            }
        }

        tracing::info!("Client closed the connection");
        Ok(())
    }

    /// Handle one incoming JSON-RPC message; `None` for notifications
    pub async fn handle_message(&mut self, message: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable JSON-RPC message");
                return Some(JsonRpcResponse::error(None, JsonRpcError::parse_error(e.to_string())));
            }
        };

        tracing::debug!(method = %request.method, "Handling request");

        if request.is_notification() {
            if request.method == methods::INITIALIZED {
                self.initialized = true;
            }
            return None;
        }

        let id = request.id.clone();
        let outcome = match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(),
            methods::PING => Ok(serde_json::json!({})),
            methods::LIST_TOOLS => self.handle_list_tools(),
            methods::CALL_TOOL => self.handle_call_tool(&request).await,
            other => Err(JsonRpcError::method_not_found(other)),
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    /// Handle initialize request
    fn handle_initialize(&self) -> std::result::Result<Value, JsonRpcError> {
        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: SERVER_VERSION.to_string(),
            },
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
            },
        };

        to_value(&result)
    }

    /// Handle list tools request
    fn handle_list_tools(&self) -> std::result::Result<Value, JsonRpcError> {
        to_value(&ListToolsResult {
            tools: self.tool_handler.list_tools(),
        })
    }

    /// Handle call tool request.
    ///
    /// Tool failures are reported inside the result with `isError`; only
    /// malformed params are protocol errors.
    async fn handle_call_tool(&self, request: &JsonRpcRequest) -> std::result::Result<Value, JsonRpcError> {
        let params: CallToolParams = match request.params.clone() {
            Some(p) => serde_json::from_value(p)
                .map_err(|e| JsonRpcError::invalid_params(format!("Invalid tool parameters: {}", e)))?,
            None => return Err(JsonRpcError::invalid_params("Missing tool parameters")),
        };

        tracing::info!(tool = %params.name, user_id = %self.tool_handler.user_id(), "Tool call");

        let result = self.tool_handler.call_tool(&params.name, params.arguments).await;
        if result.is_error {
            tracing::debug!(tool = %params.name, "Tool call returned an error result");
        }
        to_value(&result)
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}
