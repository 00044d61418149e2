//! Request gateway for the protected `/mcp` endpoint.
//!
//! Every request is authenticated from its bearer credential, bound to an
//! execution context through the session header, and only then dispatched.
//! The principal and context are handed to the tool registry as arguments.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use rmcp::model::{
    ErrorCode, ErrorData, Implementation, InitializeResult, JsonObject, JsonRpcError,
    JsonRpcResponse, JsonRpcVersion2_0, ListToolsResult, ProtocolVersion, RequestId,
    ServerCapabilities,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::auth::{AuthError, Authenticator, Principal};
use crate::config::ServerConfig;
use crate::session::{RequestMeta, SessionScopeManager};
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::SessionId;

/// Header carrying the transport session id in both directions.
pub const SESSION_HEADER: &str = "mcp-session-id";

pub struct Gateway {
    config: Arc<ServerConfig>,
    authenticator: Arc<Authenticator>,
    sessions: Arc<SessionScopeManager>,
    tools: Arc<ToolRegistry>,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<RequestId>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Pull the token out of `Authorization: Bearer <token>`.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

impl Gateway {
    pub fn new(
        config: Arc<ServerConfig>,
        authenticator: Arc<Authenticator>,
        sessions: Arc<SessionScopeManager>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            config,
            authenticator,
            sessions,
            tools,
        }
    }

    /// `WWW-Authenticate` value pointing clients at resource discovery.
    pub fn challenge(&self) -> String {
        format!(
            r#"Bearer resource_metadata="{}", scope="{}""#,
            self.config.resource_metadata_url(),
            self.config.default_scope
        )
    }

    /// The single 401 shape used for every credential failure.
    pub fn unauthorized(&self) -> Response {
        let mut response = (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "invalid_token",
                "error_description": "Missing or invalid access token",
            })),
        )
            .into_response();
        if let Ok(value) = HeaderValue::from_str(&self.challenge()) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }

    fn insufficient_scope(&self) -> Response {
        let mut response = (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "insufficient_scope",
                "error_description": format!("The {} scope is required", self.config.default_scope),
            })),
        )
            .into_response();
        let challenge = format!(r#"{}, error="insufficient_scope""#, self.challenge());
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }

    /// Verify the request's bearer credential.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, Response> {
        let Some(token) = extract_bearer(headers) else {
            debug!("request without bearer credential");
            return Err(self.unauthorized());
        };

        match self.authenticator.verify(token).await {
            Ok(principal) if principal.has_scope(&self.config.default_scope) => Ok(principal),
            Ok(principal) => {
                warn!(user_id = %principal.user_id, "credential lacks the required scope");
                Err(self.insufficient_scope())
            }
            Err(AuthError::InvalidToken) => Err(self.unauthorized()),
            Err(AuthError::Store(_)) => Err(server_error()),
        }
    }

    fn server_info() -> InitializeResult {
        InitializeResult {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: None,
        }
    }

    async fn dispatch(&self, id: RequestId, request: RpcRequest, ctx: &ToolContext) -> Response {
        match request.method.as_str() {
            "initialize" => rpc_result(id, Self::server_info()),
            "ping" => rpc_result(id, JsonObject::new()),
            "tools/list" => rpc_result(id, ListToolsResult::with_all_items(self.tools.list_tools())),
            "tools/call" => self.call_tool(id, request.params, ctx).await,
            other => rpc_error(
                id,
                ErrorData::new(
                    ErrorCode::METHOD_NOT_FOUND,
                    format!("Method not found: {}", other),
                    None,
                ),
            ),
        }
    }

    async fn call_tool(&self, id: RequestId, params: Value, ctx: &ToolContext) -> Response {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return rpc_error(id, ErrorData::invalid_params("tools/call requires a tool name", None));
        };
        if !self.tools.contains(name) {
            return rpc_error(
                id,
                ErrorData::invalid_params(format!("Unknown tool: {}", name), None),
            );
        }
        let args = match params.get("arguments") {
            None | Some(Value::Null) => JsonObject::new(),
            Some(Value::Object(args)) => args.clone(),
            Some(_) => {
                return rpc_error(id, ErrorData::invalid_params("arguments must be an object", None));
            }
        };

        let result = match self.tools.call_tool(name, args, ctx).await {
            Ok(result) => result,
            Err(e) => {
                debug!(tool = name, "tool returned an error: {}", e);
                e.to_call_result()
            }
        };
        rpc_result(id, result)
    }
}

pub fn gateway_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete))
        .with_state(gateway)
}

async fn handle_post(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let principal = match gateway.authenticate(&headers).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };

    let request: RpcRequest = match serde_json::from_slice::<Value>(&body) {
        Err(_) => {
            return rejected(ErrorData::new(ErrorCode::PARSE_ERROR, "Parse error", None));
        }
        Ok(value) => match serde_json::from_value(value) {
            Ok(request) => request,
            Err(_) => {
                return rejected(ErrorData::new(
                    ErrorCode::INVALID_REQUEST,
                    "Invalid request",
                    None,
                ));
            }
        },
    };

    let meta = RequestMeta {
        request_id: Uuid::new_v4().to_string(),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    let presented = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());

    let resolved = match gateway.sessions.resolve(presented, &principal, meta).await {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(user_id = %principal.user_id, "failed to resolve session: {}", e);
            return server_error();
        }
    };
    let session_id = resolved.context.session_id().clone();

    // Notifications get no body.
    let Some(id) = request.id.clone() else {
        return with_session(StatusCode::ACCEPTED.into_response(), &session_id);
    };

    let ctx = ToolContext {
        principal,
        context: resolved.context,
    };
    let reply = gateway.dispatch(id, request, &ctx).await;
    with_session(reply, &session_id)
}

async fn handle_delete(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    let principal = match gateway.authenticate(&headers).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if gateway
        .sessions
        .terminate(&SessionId::new(session_id), &principal)
    {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

fn with_session(mut response: Response, session_id: &SessionId) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id.as_str()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "server_error" })),
    )
        .into_response()
}

fn rpc_result<R: Serialize>(id: RequestId, result: R) -> Response {
    Json(JsonRpcResponse {
        jsonrpc: JsonRpcVersion2_0,
        id,
        result,
    })
    .into_response()
}

fn rpc_error(id: RequestId, error: ErrorData) -> Response {
    Json(JsonRpcError {
        jsonrpc: JsonRpcVersion2_0,
        id,
        error,
    })
    .into_response()
}

/// Errors for bodies that never yielded a request id.
fn rejected(error: ErrorData) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "jsonrpc": "2.0", "id": null, "error": error })),
    )
        .into_response()
}
