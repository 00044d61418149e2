// OAuth HTTP endpoints: discovery, registration, authorize and token.

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{Query, State, rejection::FormRejection, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
    routing::post,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::oauth::error::{OAuthError, found};
use crate::oauth::login_page::render_login_page;
use crate::oauth::server::{AuthorizationServer, LoginOutcome};
use crate::oauth::types::{
    AuthorizeParams, ClientCredentials, ClientRegistrationRequest, LoginForm, TokenRequest,
};

pub type OAuthState = Arc<AuthorizationServer>;

pub fn oauth_router(server: OAuthState) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata),
        )
        .route(
            "/.well-known/oauth-protected-resource/mcp",
            get(protected_resource_metadata),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route("/register", post(register))
        .route("/authorize", get(authorize_page).post(authorize_submit))
        .route("/token", post(token))
        .with_state(server)
}

async fn protected_resource_metadata(State(server): State<OAuthState>) -> impl IntoResponse {
    Json(server.protected_resource_metadata())
}

async fn authorization_server_metadata(State(server): State<OAuthState>) -> impl IntoResponse {
    Json(server.authorization_server_metadata())
}

async fn register(
    State(server): State<OAuthState>,
    body: Result<Json<ClientRegistrationRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return OAuthError::invalid_request(rejection.body_text()).into_response();
        }
    };

    match server.register_client(request).await {
        Ok(client) => (StatusCode::CREATED, no_store(), Json(client)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn authorize_page(
    State(server): State<OAuthState>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    match server.validate_authorize(&params).await {
        Ok(authorization) => Html(render_login_page(&authorization, None)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn authorize_submit(
    State(server): State<OAuthState>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Response {
    let Form(form) = match form {
        Ok(form) => form,
        Err(rejection) => {
            return OAuthError::invalid_request(rejection.body_text()).into_response();
        }
    };

    match server.submit_login(&form).await {
        Ok(LoginOutcome::Issued { redirect_url }) => found(&redirect_url),
        Ok(LoginOutcome::Rejected {
            authorization,
            message,
        }) => Html(render_login_page(&authorization, Some(message))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn token(
    State(server): State<OAuthState>,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Response {
    let Form(request) = match form {
        Ok(form) => form,
        Err(rejection) => {
            return OAuthError::invalid_request(rejection.body_text()).into_response();
        }
    };

    let basic = match basic_credentials(&headers) {
        Ok(basic) => basic,
        Err(e) => return e.into_response(),
    };

    match server.exchange(request, basic).await {
        Ok(tokens) => (
            StatusCode::OK,
            [
                (header::CACHE_CONTROL, "no-store"),
                (header::PRAGMA, "no-cache"),
            ],
            Json(tokens),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

fn no_store() -> [(header::HeaderName, &'static str); 1] {
    [(header::CACHE_CONTROL, "no-store")]
}

/// Parse `Authorization: Basic` client credentials (RFC 6749 section 2.3.1).
/// Other schemes are ignored; a malformed Basic header is `invalid_client`.
fn basic_credentials(headers: &HeaderMap) -> Result<Option<ClientCredentials>, OAuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let malformed = || OAuthError::invalid_client("malformed basic authorization header");

    let value = value.to_str().map_err(|_| malformed())?;
    let Some((scheme, encoded)) = value.split_once(' ') else {
        return Ok(None);
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return Ok(None);
    }

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| malformed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| malformed())?;
    let (id, secret) = decoded.split_once(':').ok_or_else(malformed)?;

    let client_id = urlencoding::decode(id).map_err(|_| malformed())?.into_owned();
    let client_secret = urlencoding::decode(secret)
        .map_err(|_| malformed())?
        .into_owned();
    if client_id.is_empty() {
        return Err(malformed());
    }

    Ok(Some(ClientCredentials {
        client_id,
        client_secret: (!client_secret.is_empty()).then_some(client_secret),
    }))
}
