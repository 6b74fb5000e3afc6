//! MCP Request Router
//!
//! Serves the upstream side of a session: answers protocol housekeeping
//! itself, lists the aggregated catalog, and forwards calls to the backend
//! that owns the addressed capability.
//!
//! # Namespacing
//!
//! Every tool, resource and prompt is exposed as `{backend}::{original}`,
//! e.g. `github::create_issue` or `docs::file:///readme.md`. Backend names
//! never contain `::`, so the first separator always splits correctly.

use std::sync::Arc;
use std::time::Duration;

use mcpfuse_shared::NAMESPACE_SEPARATOR;
use serde_json::{json, Map, Value};

use super::catalog::{CapabilityEntry, CapabilityItem, CapabilityKind};
use super::supervisor::Supervisor;
use super::types::*;
use crate::error::{ProxyError, ProxyResult};

/// Build the upstream identifier for a backend's capability
pub fn aggregate_id(backend: &str, original_id: &str) -> String {
    format!("{}{}{}", backend, NAMESPACE_SEPARATOR, original_id)
}

/// Split an upstream identifier into (backend, original id)
pub fn split_aggregate_id(aggregated_id: &str) -> Option<(&str, &str)> {
    aggregated_id
        .split_once(NAMESPACE_SEPARATOR)
        .filter(|(backend, _)| !backend.is_empty())
}

/// Types of MCP methods
#[derive(Debug, Clone, PartialEq)]
pub enum McpMethod {
    Initialize,
    Initialized,
    Ping,
    Cancelled,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesRead,
    ResourceTemplatesList,
    PromptsList,
    PromptsGet,
    LoggingSetLevel,
    Unknown,
}

impl McpMethod {
    pub fn from_method(method: &str) -> Self {
        match method {
            "initialize" => McpMethod::Initialize,
            "notifications/initialized" => McpMethod::Initialized,
            "ping" => McpMethod::Ping,
            "notifications/cancelled" => McpMethod::Cancelled,
            "tools/list" => McpMethod::ToolsList,
            "tools/call" => McpMethod::ToolsCall,
            "resources/list" => McpMethod::ResourcesList,
            "resources/read" => McpMethod::ResourcesRead,
            "resources/templates/list" => McpMethod::ResourceTemplatesList,
            "prompts/list" => McpMethod::PromptsList,
            "prompts/get" => McpMethod::PromptsGet,
            "logging/setLevel" => McpMethod::LoggingSetLevel,
            _ => McpMethod::Unknown,
        }
    }

    /// Does this method require routing to a specific backend?
    pub fn requires_routing(&self) -> bool {
        matches!(
            self,
            McpMethod::ToolsCall | McpMethod::ResourcesRead | McpMethod::PromptsGet
        )
    }

    /// Does this method aggregate results from all backends?
    pub fn aggregates_results(&self) -> bool {
        matches!(
            self,
            McpMethod::ToolsList | McpMethod::ResourcesList | McpMethod::PromptsList
        )
    }

    /// Capability kind a list or routed method works on
    pub fn capability_kind(&self) -> Option<CapabilityKind> {
        match self {
            McpMethod::ToolsList | McpMethod::ToolsCall => Some(CapabilityKind::Tool),
            McpMethod::ResourcesList | McpMethod::ResourcesRead => Some(CapabilityKind::Resource),
            McpMethod::PromptsList | McpMethod::PromptsGet => Some(CapabilityKind::Prompt),
            _ => None,
        }
    }
}

/// Upstream-facing request router for one session
pub struct Router {
    supervisor: Arc<Supervisor>,
    request_timeout: Duration,
}

impl Router {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let request_timeout = supervisor.timeouts().request;
        Self {
            supervisor,
            request_timeout,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Current catalog entries of `kind` in upstream shape
    ///
    /// Never fails; an empty catalog yields an empty list.
    pub fn handle_list(&self, kind: CapabilityKind) -> Vec<CapabilityItem> {
        self.supervisor
            .catalog()
            .list_all(kind)
            .iter()
            .map(|entry| present(entry))
            .collect()
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        self.handle_list(CapabilityKind::Tool)
            .into_iter()
            .filter_map(|item| match item {
                CapabilityItem::Tool(tool) => Some(tool),
                _ => None,
            })
            .collect()
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.handle_list(CapabilityKind::Resource)
            .into_iter()
            .filter_map(|item| match item {
                CapabilityItem::Resource(resource) => Some(resource),
                _ => None,
            })
            .collect()
    }

    pub fn list_prompts(&self) -> Vec<Prompt> {
        self.handle_list(CapabilityKind::Prompt)
            .into_iter()
            .filter_map(|item| match item {
                CapabilityItem::Prompt(prompt) => Some(prompt),
                _ => None,
            })
            .collect()
    }

    /// Forward one call to the backend owning `aggregated_id`
    ///
    /// A catalog miss, including a backend pruned a moment ago, is
    /// `UnknownCapability`. The backend's result comes back unchanged.
    pub async fn handle_invoke(
        &self,
        kind: CapabilityKind,
        aggregated_id: &str,
        params: Value,
        upstream_id: Option<JsonRpcId>,
    ) -> ProxyResult<Value> {
        let unknown = || ProxyError::UnknownCapability(aggregated_id.to_string());

        let (backend, _) = split_aggregate_id(aggregated_id).ok_or_else(unknown)?;
        let entry = self
            .supervisor
            .catalog()
            .resolve(kind, aggregated_id)
            .ok_or_else(unknown)?;
        let connection = self.supervisor.connection(backend).ok_or_else(unknown)?;

        tracing::debug!(
            backend = %entry.owner_backend,
            kind = %kind,
            id = %entry.original_id,
            "Routing request"
        );

        connection
            .invoke(kind, &entry.original_id, params, upstream_id, self.request_timeout)
            .await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        upstream_id: Option<JsonRpcId>,
    ) -> ProxyResult<Value> {
        self.handle_invoke(
            CapabilityKind::Tool,
            name,
            json!({ "arguments": arguments }),
            upstream_id,
        )
        .await
    }

    pub async fn read_resource(&self, uri: &str, upstream_id: Option<JsonRpcId>) -> ProxyResult<Value> {
        self.handle_invoke(CapabilityKind::Resource, uri, json!({}), upstream_id)
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Value,
        upstream_id: Option<JsonRpcId>,
    ) -> ProxyResult<Value> {
        self.handle_invoke(
            CapabilityKind::Prompt,
            name,
            json!({ "arguments": arguments }),
            upstream_id,
        )
        .await
    }

    /// Cancel the forwarded call made for `upstream_id`, wherever it is
    pub async fn cancel(&self, upstream_id: &JsonRpcId, reason: Option<&str>) -> bool {
        for connection in self.supervisor.connections() {
            if connection.cancel(upstream_id, reason).await {
                return true;
            }
        }
        false
    }

    /// Handle one upstream JSON-RPC message
    ///
    /// Returns the response to send back, or `None` for notifications.
    pub async fn handle_message(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let method = McpMethod::from_method(&request.method);

        let Some(id) = request.id.clone() else {
            self.handle_notification(method, request).await;
            return None;
        };

        let result = match method {
            McpMethod::Initialize => Ok(initialize_result()),
            McpMethod::Ping | McpMethod::LoggingSetLevel => Ok(json!({})),
            McpMethod::ResourceTemplatesList => Ok(json!({ "resourceTemplates": [] })),
            _ => match method.capability_kind() {
                Some(kind) if method.aggregates_results() => {
                    Ok(list_result(kind, self.handle_list(kind)))
                }
                Some(kind) if method.requires_routing() => self
                    .route(kind, request.params, id.clone())
                    .await
                    .map_err(|e| {
                        tracing::debug!(method = %request.method, error = %e, "Routed request failed");
                        e.to_json_rpc()
                    }),
                _ => Err(JsonRpcError::method_not_found(&request.method)),
            },
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(Some(id), value),
            Err(error) => JsonRpcResponse::error(Some(id), error),
        })
    }

    async fn route(&self, kind: CapabilityKind, params: Option<Value>, id: JsonRpcId) -> ProxyResult<Value> {
        let params = match params {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(ProxyError::InvalidParams("params must be an object".to_string())),
        };

        let aggregated_id = params
            .get(kind.id_field())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProxyError::InvalidParams(format!("missing '{}'", kind.id_field())))?;

        self.handle_invoke(kind, &aggregated_id, Value::Object(params), Some(id))
            .await
    }

    async fn handle_notification(&self, method: McpMethod, request: JsonRpcRequest) {
        match method {
            McpMethod::Initialized => {
                tracing::debug!("Client initialized");
            }
            McpMethod::Cancelled => {
                let params = request
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
                match params {
                    Some(params) => {
                        let cancelled = self
                            .cancel(&params.request_id, params.reason.as_deref())
                            .await;
                        tracing::debug!(request_id = %params.request_id, cancelled, "Client cancelled request");
                    }
                    None => tracing::debug!("Ignoring malformed cancellation"),
                }
            }
            _ => {
                tracing::trace!(method = %request.method, "Ignoring client notification");
            }
        }
    }
}

/// Translate a catalog entry into what upstream sees
fn present(entry: &CapabilityEntry) -> CapabilityItem {
    let prefix = |description: Option<&str>| match description {
        Some(desc) => Some(format!("[{}] {}", entry.owner_backend, desc)),
        None => Some(format!("[{}]", entry.owner_backend)),
    };

    match &entry.metadata {
        CapabilityItem::Tool(tool) => CapabilityItem::Tool(Tool {
            name: entry.aggregated_id.clone(),
            description: prefix(tool.description.as_deref()),
            ..tool.clone()
        }),
        CapabilityItem::Resource(resource) => CapabilityItem::Resource(Resource {
            uri: entry.aggregated_id.clone(),
            description: prefix(resource.description.as_deref()),
            ..resource.clone()
        }),
        CapabilityItem::Prompt(prompt) => CapabilityItem::Prompt(Prompt {
            name: entry.aggregated_id.clone(),
            description: prefix(prompt.description.as_deref()),
            ..prompt.clone()
        }),
    }
}

fn list_result(kind: CapabilityKind, items: Vec<CapabilityItem>) -> Value {
    let items: Vec<Value> = items.iter().map(CapabilityItem::to_value).collect();
    let mut result = Map::new();
    result.insert(kind.result_key().to_string(), Value::Array(items));
    Value::Object(result)
}

fn initialize_result() -> Value {
    let result = InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: Capabilities {
            tools: Some(ToolsCapability { list_changed: true }),
            resources: Some(ResourcesCapability {
                subscribe: false,
                list_changed: true,
            }),
            prompts: Some(PromptsCapability { list_changed: true }),
            ..Default::default()
        },
        server_info: Implementation::proxy(),
        instructions: None,
    };
    serde_json::to_value(result).unwrap_or_else(|_| json!({}))
}
