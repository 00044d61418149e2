//! End-to-end tests through the assembled axum router.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::auth::authenticator::tests::test_config;
use crate::auth::{NewApiKey, generate_secure_token};
use crate::db::store::tests::{new_user, setup_test_store};
use crate::gateway::SESSION_HEADER;
use crate::oauth::pkce::s256_challenge;
use crate::server::{AppState, create_router};
use crate::types::{SessionId, TenantId, UserId};

const REDIRECT: &str = "https://app.example/cb";
const EMAIL: &str = "alice@example.com";
const PASSWORD: &str = "correct horse battery";

struct Harness {
    state: AppState,
    router: Router,
    user_id: UserId,
    tenant_id: TenantId,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn text(&self) -> String {
        String::from_utf8(self.body.clone()).unwrap()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
    }
}

async fn harness() -> Harness {
    let store = setup_test_store().await;
    let user = store.create_user(new_user(EMAIL, PASSWORD)).await.unwrap();
    let tenant = store.create_tenant("Acme").await.unwrap();
    store
        .add_member(&user.user_id, &tenant.tenant_id, "owner")
        .await
        .unwrap();

    let state = AppState::new(test_config(), store);
    let router = create_router(&state);
    Harness {
        state,
        router,
        user_id: user.user_id,
        tenant_id: tenant.tenant_id,
    }
}

async fn send(h: &Harness, request: Request<Body>) -> Reply {
    let response = h.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    Reply {
        status,
        headers,
        body: body.to_vec(),
    }
}

fn form(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn post_form(uri: &str, pairs: &[(&str, &str)]) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form(pairs)))
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn mcp(token: &str, session: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::post("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", token));
    if let Some(session) = session {
        builder = builder.header(SESSION_HEADER, session);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn call(id: u64, tool: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": tool, "arguments": arguments },
    })
}

async fn register(h: &Harness) -> (String, String) {
    let reply = send(
        h,
        post_json(
            "/register",
            json!({ "client_name": "Test App", "redirect_uris": [REDIRECT] }),
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    let body = reply.json();
    (
        body["client_id"].as_str().unwrap().to_string(),
        body["client_secret"].as_str().unwrap().to_string(),
    )
}

/// Runs register → authorize → login and returns (client_id, secret, code).
async fn authorize(h: &Harness, verifier: &str) -> (String, String, String) {
    let (client_id, secret) = register(h).await;
    let challenge = s256_challenge(verifier);
    let params = [
        ("response_type", "code"),
        ("client_id", client_id.as_str()),
        ("redirect_uri", REDIRECT),
        ("state", "xyz"),
        ("code_challenge", challenge.as_str()),
        ("code_challenge_method", "S256"),
    ];

    let page = send(
        h,
        Request::get(format!("/authorize?{}", form(&params)))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(page.status, StatusCode::OK);
    assert!(page.text().contains(r#"name="code_challenge""#));

    let mut login = params.to_vec();
    login.push(("email", EMAIL));
    login.push(("password", PASSWORD));
    let reply = send(h, post_form("/authorize", &login)).await;
    assert_eq!(reply.status, StatusCode::FOUND);

    let location = url::Url::parse(&reply.header("location").unwrap()).unwrap();
    assert!(location.as_str().starts_with(REDIRECT));
    let query: Vec<(String, String)> = location.query_pairs().into_owned().collect();
    assert!(query.contains(&("state".to_string(), "xyz".to_string())));
    let code = query
        .iter()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.clone())
        .unwrap();
    (client_id, secret, code)
}

async fn exchange(h: &Harness, client: (&str, &str), code: &str, verifier: &str) -> Reply {
    send(
        h,
        post_form(
            "/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", REDIRECT),
                ("client_id", client.0),
                ("client_secret", client.1),
                ("code_verifier", verifier),
            ],
        ),
    )
    .await
}

#[tokio::test]
async fn test_discovery_documents() {
    let h = harness().await;

    let reply = send(
        &h,
        Request::get("/.well-known/oauth-protected-resource")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["resource"], "https://gate.example/mcp");
    assert_eq!(body["authorization_servers"], json!(["https://gate.example"]));

    let reply = send(
        &h,
        Request::get("/.well-known/oauth-authorization-server")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let body = reply.json();
    assert_eq!(body["issuer"], "https://gate.example");
    assert_eq!(body["registration_endpoint"], "https://gate.example/register");
    assert_eq!(body["code_challenge_methods_supported"], json!(["S256"]));

    let reply = send(&h, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(reply.json()["status"], "healthy");
}

#[tokio::test]
async fn test_registration_rejects_missing_fields() {
    let h = harness().await;
    let reply = send(&h, post_json("/register", json!({ "client_name": "x" }))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["error"], "invalid_request");

    let reply = send(
        &h,
        Request::post("/register")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["error"], "invalid_request");
}

#[tokio::test]
async fn test_full_authorization_code_flow() {
    let h = harness().await;
    let verifier = generate_secure_token();
    let (client_id, secret, code) = authorize(&h, &verifier).await;

    let reply = exchange(&h, (&client_id, &secret), &code, &verifier).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("cache-control").as_deref(), Some("no-store"));
    let tokens = reply.json();
    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["expires_in"], 3600);
    assert!(tokens["refresh_token"].is_string());

    // The same code cannot be redeemed twice.
    let reply = exchange(&h, (&client_id, &secret), &code, &verifier).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["error"], "invalid_grant");
}

#[tokio::test]
async fn test_wrong_verifier_is_invalid_grant_and_burns_code() {
    let h = harness().await;
    let verifier = generate_secure_token();
    let (client_id, secret, code) = authorize(&h, &verifier).await;

    let reply = exchange(&h, (&client_id, &secret), &code, "the-wrong-verifier").await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    let body = reply.json();
    assert_eq!(body["error"], "invalid_grant");
    assert!(body.get("access_token").is_none());

    let reply = exchange(&h, (&client_id, &secret), &code, &verifier).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["error"], "invalid_grant");
}

#[tokio::test]
async fn test_refresh_rotation_over_http() {
    let h = harness().await;
    let verifier = generate_secure_token();
    let (client_id, secret, code) = authorize(&h, &verifier).await;
    let first = exchange(&h, (&client_id, &secret), &code, &verifier)
        .await
        .json();
    let old_refresh = first["refresh_token"].as_str().unwrap().to_string();

    let refresh = |token: String| {
        post_form(
            "/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", secret.as_str()),
            ],
        )
    };

    let reply = send(&h, refresh(old_refresh.clone())).await;
    assert_eq!(reply.status, StatusCode::OK);
    let second = reply.json();
    assert_ne!(second["access_token"], first["access_token"]);

    let reply = send(&h, refresh(old_refresh)).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["error"], "invalid_grant");

    // The rotated-away access token no longer opens the gateway.
    let ping = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" });
    let reply = send(&h, mcp(first["access_token"].as_str().unwrap(), None, ping.clone())).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let reply = send(&h, mcp(second["access_token"].as_str().unwrap(), None, ping)).await;
    assert_eq!(reply.status, StatusCode::OK);
}

#[tokio::test]
async fn test_basic_client_authentication() {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    let h = harness().await;
    let verifier = generate_secure_token();
    let (client_id, secret, code) = authorize(&h, &verifier).await;

    let credentials = STANDARD.encode(format!("{}:{}", client_id, secret));
    let request = Request::post("/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::AUTHORIZATION, format!("Basic {}", credentials))
        .body(Body::from(form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT),
            ("code_verifier", verifier.as_str()),
        ])))
        .unwrap();
    let reply = send(&h, request).await;
    assert_eq!(reply.status, StatusCode::OK);
}

#[tokio::test]
async fn test_authorize_errors_direct_and_redirect() {
    let h = harness().await;
    let (client_id, _) = register(&h).await;

    // Unknown client: shown directly.
    let reply = send(
        &h,
        Request::get("/authorize?response_type=code&client_id=nope&redirect_uri=https%3A%2F%2Fapp.example%2Fcb")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.json()["error"], "invalid_client");

    // Missing PKCE: redirected with state.
    let query = form(&[
        ("response_type", "code"),
        ("client_id", client_id.as_str()),
        ("redirect_uri", REDIRECT),
        ("state", "s1"),
    ]);
    let reply = send(
        &h,
        Request::get(format!("/authorize?{}", query))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FOUND);
    let location = reply.header("location").unwrap();
    assert!(location.starts_with(REDIRECT));
    assert!(location.contains("error=invalid_request"));
    assert!(location.contains("state=s1"));
}

#[tokio::test]
async fn test_bad_login_rerenders_form() {
    let h = harness().await;
    let (client_id, _) = register(&h).await;
    let challenge = s256_challenge("verifier");
    let reply = send(
        &h,
        post_form(
            "/authorize",
            &[
                ("response_type", "code"),
                ("client_id", client_id.as_str()),
                ("redirect_uri", REDIRECT),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("email", EMAIL),
                ("password", "nope"),
            ],
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.text().contains("Invalid email or password"));
}

#[tokio::test]
async fn test_gateway_challenge_on_missing_or_bad_token() {
    let h = harness().await;
    let expected = r#"Bearer resource_metadata="https://gate.example/.well-known/oauth-protected-resource", scope="mcp:full""#;

    let request = Request::post("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }).to_string()))
        .unwrap();
    let missing = send(&h, request).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
    assert_eq!(missing.header("www-authenticate").as_deref(), Some(expected));

    let bad = send(
        &h,
        mcp("not-a-real-token", None, json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" })),
    )
    .await;
    assert_eq!(bad.status, StatusCode::UNAUTHORIZED);
    assert_eq!(bad.header("www-authenticate").as_deref(), Some(expected));
    assert_eq!(bad.body, missing.body);
}

#[tokio::test]
async fn test_oauth_session_tenant_selection() {
    let h = harness().await;
    let verifier = generate_secure_token();
    let (client_id, secret, code) = authorize(&h, &verifier).await;
    let tokens = exchange(&h, (&client_id, &secret), &code, &verifier)
        .await
        .json();
    let token = tokens["access_token"].as_str().unwrap().to_string();

    let init = send(
        &h,
        mcp(&token, None, json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} })),
    )
    .await;
    assert_eq!(init.status, StatusCode::OK);
    assert_eq!(init.json()["result"]["protocolVersion"], "2025-06-18");
    let session = init.header(SESSION_HEADER).unwrap();

    let listed = send(
        &h,
        mcp(&token, Some(&session), json!({ "jsonrpc": "2.0", "id": 5, "method": "tools/list" })),
    )
    .await;
    let tools = listed.json()["result"]["tools"].clone();
    assert_eq!(tools.as_array().unwrap().len(), 4);
    assert_eq!(tools[3]["name"], "tenant.select");
    assert_eq!(tools[3]["inputSchema"]["required"], json!(["tenant_id"]));

    let current = send(&h, mcp(&token, Some(&session), call(2, "tenant.current", json!({})))).await;
    let result = &current.json()["result"];
    assert_eq!(result["isError"], true);
    assert_eq!(result["structuredContent"]["error"]["code"], "no_tenant_selected");

    let selected = send(
        &h,
        mcp(&token, Some(&session), call(3, "tenant.select", json!({ "tenant_id": h.tenant_id }))),
    )
    .await;
    assert_eq!(selected.header(SESSION_HEADER).as_deref(), Some(session.as_str()));
    assert_eq!(selected.json()["result"]["isError"], false);

    // Survives eviction from memory.
    h.state.sessions.flush().await;
    h.state
        .sessions
        .evict(&SessionId::new(session.as_str()));
    let current = send(&h, mcp(&token, Some(&session), call(4, "tenant.current", json!({})))).await;
    let result = &current.json()["result"];
    assert_eq!(result["isError"], false);
    assert_eq!(result["structuredContent"]["name"], "Acme");
}

#[tokio::test]
async fn test_api_key_session_and_revocation() {
    let h = harness().await;
    let created = h
        .state
        .api_keys
        .create(NewApiKey {
            user_id: h.user_id.clone(),
            tenant_id: h.tenant_id.clone(),
            name: Some("ci".to_string()),
            scopes: Vec::new(),
            expires_in_days: None,
        })
        .await
        .unwrap();

    // Bound to the key's tenant from the first request.
    let reply = send(&h, mcp(&created.key, None, call(1, "tenant.current", json!({})))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let result = &reply.json()["result"];
    assert_eq!(result["isError"], false);
    assert_eq!(result["structuredContent"]["name"], "Acme");
    assert_eq!(result["structuredContent"]["auth_mode"], "api_key");

    let reply = send(
        &h,
        mcp(&created.key, None, call(2, "tenant.select", json!({ "tenant_id": "elsewhere" }))),
    )
    .await;
    let result = &reply.json()["result"];
    assert_eq!(result["structuredContent"]["tenant_id"], json!(h.tenant_id));
    assert_eq!(result["structuredContent"]["changed"], false);

    assert!(h.state.api_keys.revoke(&created.record.key_prefix).await.unwrap());
    let reply = send(&h, mcp(&created.key, None, call(3, "tenant.current", json!({})))).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_deactivated_user_is_locked_out_immediately() {
    let h = harness().await;
    let created = h
        .state
        .api_keys
        .create(NewApiKey {
            user_id: h.user_id.clone(),
            tenant_id: h.tenant_id.clone(),
            name: None,
            scopes: Vec::new(),
            expires_in_days: None,
        })
        .await
        .unwrap();

    let reply = send(&h, mcp(&created.key, None, call(1, "tenant.current", json!({})))).await;
    assert_eq!(reply.status, StatusCode::OK);

    assert!(h.state.authenticator.deactivate_user(&h.user_id).await.unwrap());
    let reply = send(&h, mcp(&created.key, None, call(2, "tenant.current", json!({})))).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_jsonrpc_errors() {
    let h = harness().await;
    let verifier = generate_secure_token();
    let (client_id, secret, code) = authorize(&h, &verifier).await;
    let tokens = exchange(&h, (&client_id, &secret), &code, &verifier)
        .await
        .json();
    let token = tokens["access_token"].as_str().unwrap();

    let reply = send(
        &h,
        Request::post("/mcp")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::from("{oops"))
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["error"]["code"], -32700);

    let reply = send(&h, mcp(token, None, json!({ "jsonrpc": "2.0", "id": 9, "method": "nope" }))).await;
    assert_eq!(reply.json()["error"]["code"], -32601);

    let reply = send(&h, mcp(token, None, call(10, "tenant.delete", json!({})))).await;
    assert_eq!(reply.json()["error"]["code"], -32602);

    let reply = send(
        &h,
        mcp(token, None, json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::ACCEPTED);
    assert!(reply.header(SESSION_HEADER).is_some());
}
