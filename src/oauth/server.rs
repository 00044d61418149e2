//! OAuth 2.1 authorization server: registration, authorization and token
//! issuance.
//!
//! Authorization attempts move through
//! `requested -> challenged (login form) -> code issued -> redeemed | expired`.
//! Codes are claimed atomically the first time anyone tries to redeem them,
//! so a failed exchange (bad verifier, wrong redirect) burns the code too.

use std::collections::HashSet;
use std::sync::Arc;

use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{Authenticator, generate_oauth_token, generate_secure_token, hash_token};
use crate::config::ServerConfig;
use crate::db::{AuthorizationCodeRecord, OAuthClientRecord, OAuthTokenRecord};
use crate::oauth::error::{AuthorizeError, OAuthError, OAuthErrorCode, append_query};
use crate::oauth::pkce::verify_pkce;
use crate::oauth::types::*;
use crate::store::{CredentialStore, Directory};
use crate::types::{ClientId, UserId};

/// An authorization request that passed every check and may be shown the
/// login form.
#[derive(Debug, Clone)]
pub struct ValidatedAuthorization {
    pub client: OAuthClientRecord,
    pub redirect_uri: String,
    pub scope: String,
    pub state: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
}

/// Result of a login submission that did not hit a protocol error.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Code minted; send the user agent here.
    Issued { redirect_url: String },
    /// Credentials rejected; show the form again with this message.
    Rejected {
        authorization: ValidatedAuthorization,
        message: &'static str,
    },
}

pub struct AuthorizationServer {
    config: Arc<ServerConfig>,
    store: Arc<dyn CredentialStore>,
    directory: Arc<dyn Directory>,
    authenticator: Arc<Authenticator>,
}

impl AuthorizationServer {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn CredentialStore>,
        directory: Arc<dyn Directory>,
        authenticator: Arc<Authenticator>,
    ) -> Self {
        Self {
            config,
            store,
            directory,
            authenticator,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // ----- discovery -------------------------------------------------------

    pub fn protected_resource_metadata(&self) -> ProtectedResourceMetadata {
        ProtectedResourceMetadata {
            resource: self.config.resource_url(),
            authorization_servers: vec![self.config.issuer().to_string()],
            scopes_supported: vec![self.config.default_scope.clone()],
            bearer_methods_supported: vec!["header".to_string()],
        }
    }

    pub fn authorization_server_metadata(&self) -> AuthorizationServerMetadata {
        AuthorizationServerMetadata {
            issuer: self.config.issuer().to_string(),
            authorization_endpoint: self.config.endpoint("/authorize"),
            token_endpoint: self.config.endpoint("/token"),
            registration_endpoint: self.config.endpoint("/register"),
            scopes_supported: self.config.scopes_supported.clone(),
            response_types_supported: vec![RESPONSE_TYPE_CODE.to_string()],
            response_modes_supported: vec!["query".to_string()],
            grant_types_supported: vec![
                GRANT_AUTHORIZATION_CODE.to_string(),
                GRANT_REFRESH_TOKEN.to_string(),
            ],
            token_endpoint_auth_methods_supported: vec![
                AUTH_METHOD_BASIC.to_string(),
                AUTH_METHOD_POST.to_string(),
                AUTH_METHOD_NONE.to_string(),
            ],
            code_challenge_methods_supported: vec![PKCE_METHOD_S256.to_string()],
        }
    }

    // ----- dynamic client registration -------------------------------------

    pub async fn register_client(
        &self,
        request: ClientRegistrationRequest,
    ) -> Result<ClientRegistrationResponse, OAuthError> {
        let client_name = request
            .client_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("client_name is required"))?;

        if request.redirect_uris.is_empty() {
            return Err(OAuthError::invalid_request(
                "at least one redirect_uri is required",
            ));
        }
        for uri in &request.redirect_uris {
            if url::Url::parse(uri).is_err() {
                return Err(OAuthError::invalid_request(format!(
                    "invalid redirect_uri: {}",
                    uri
                )));
            }
        }

        let auth_method = request
            .token_endpoint_auth_method
            .unwrap_or_else(|| AUTH_METHOD_POST.to_string());
        if ![AUTH_METHOD_POST, AUTH_METHOD_BASIC, AUTH_METHOD_NONE].contains(&auth_method.as_str()) {
            return Err(OAuthError::invalid_request(format!(
                "unsupported token_endpoint_auth_method: {}",
                auth_method
            )));
        }

        let grant_types = request.grant_types.unwrap_or_else(|| {
            vec![
                GRANT_AUTHORIZATION_CODE.to_string(),
                GRANT_REFRESH_TOKEN.to_string(),
            ]
        });
        if let Some(bad) = grant_types
            .iter()
            .find(|g| *g != GRANT_AUTHORIZATION_CODE && *g != GRANT_REFRESH_TOKEN)
        {
            return Err(OAuthError::invalid_request(format!(
                "unsupported grant_type: {}",
                bad
            )));
        }

        let response_types = request
            .response_types
            .unwrap_or_else(|| vec![RESPONSE_TYPE_CODE.to_string()]);
        if response_types.iter().any(|r| r != RESPONSE_TYPE_CODE) {
            return Err(OAuthError::invalid_request(
                "only the code response_type is supported",
            ));
        }

        let scope = request
            .scope
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.config.default_scope.clone());
        if let Some(bad) = scope
            .split_whitespace()
            .find(|s| !self.config.is_supported_scope(s))
        {
            return Err(OAuthError::invalid_scope(format!("unsupported scope: {}", bad)));
        }

        let confidential = auth_method != AUTH_METHOD_NONE;
        let client_secret = confidential.then(generate_secure_token);
        let now = chrono::Utc::now().timestamp();

        let record = OAuthClientRecord {
            client_id: ClientId::new(Uuid::new_v4().to_string()),
            secret_hash: client_secret.as_deref().map(hash_token),
            client_name,
            redirect_uris: request.redirect_uris,
            grant_types,
            response_types,
            token_endpoint_auth_method: auth_method,
            scope,
            confidential,
            created_at: now,
        };

        self.store.insert_client(&record).await.map_err(|e| {
            error!("failed to store oauth client: {:#}", e);
            OAuthError::server_error()
        })?;
        info!(client_id = %record.client_id, client_name = %record.client_name, "oauth client registered");

        Ok(ClientRegistrationResponse {
            client_id: record.client_id.into_inner(),
            client_secret,
            client_name: record.client_name,
            redirect_uris: record.redirect_uris,
            grant_types: record.grant_types,
            response_types: record.response_types,
            token_endpoint_auth_method: record.token_endpoint_auth_method,
            scope: record.scope,
            client_id_issued_at: now,
            client_secret_expires_at: 0,
        })
    }

    // ----- authorization ---------------------------------------------------

    /// Validate an authorization request.
    ///
    /// Unknown client and redirect URI mismatches are reported directly;
    /// all later failures are redirected back to the client.
    pub async fn validate_authorize(
        &self,
        params: &AuthorizeParams,
    ) -> Result<ValidatedAuthorization, AuthorizeError> {
        let client_id = non_empty(&params.client_id).ok_or_else(|| {
            AuthorizeError::Direct(OAuthError::invalid_request("client_id is required"))
        })?;

        let client = self
            .store
            .find_client(&ClientId::new(client_id))
            .await
            .map_err(|e| {
                error!("failed to load oauth client: {:#}", e);
                AuthorizeError::Direct(OAuthError::server_error())
            })?
            .ok_or_else(|| AuthorizeError::Direct(OAuthError::invalid_client("unknown client_id")))?;

        let redirect_uri = non_empty(&params.redirect_uri)
            .filter(|uri| client.redirect_uris.iter().any(|r| r == uri))
            .ok_or_else(|| {
                AuthorizeError::Direct(OAuthError::invalid_request(
                    "redirect_uri does not match a registered redirect URI",
                ))
            })?
            .to_string();

        // From here on the redirect target is trusted.
        let state = non_empty(&params.state).map(str::to_string);
        let redirect = |error: OAuthError| AuthorizeError::Redirect {
            redirect_uri: redirect_uri.clone(),
            error,
            state: state.clone(),
        };

        if params.response_type.as_deref() != Some(RESPONSE_TYPE_CODE) {
            return Err(redirect(OAuthError::new(
                OAuthErrorCode::UnsupportedResponseType,
                "response_type must be code",
            )));
        }
        if !client.allows_grant(GRANT_AUTHORIZATION_CODE) {
            return Err(redirect(OAuthError::new(
                OAuthErrorCode::UnauthorizedClient,
                "client is not allowed to use the authorization_code grant",
            )));
        }
        let code_challenge = non_empty(&params.code_challenge)
            .ok_or_else(|| redirect(OAuthError::invalid_request("code_challenge is required")))?
            .to_string();
        let method = non_empty(&params.code_challenge_method).unwrap_or("");
        if method != PKCE_METHOD_S256 {
            return Err(redirect(OAuthError::invalid_request(
                "only the S256 code_challenge_method is supported",
            )));
        }

        let scope = match non_empty(&params.scope) {
            None => client.scope.clone(),
            Some(requested) => {
                let allowed: HashSet<&str> = client.allowed_scopes().collect();
                if let Some(bad) = requested.split_whitespace().find(|s| !allowed.contains(s)) {
                    return Err(redirect(OAuthError::invalid_scope(format!(
                        "scope not allowed for this client: {}",
                        bad
                    ))));
                }
                requested.split_whitespace().collect::<Vec<_>>().join(" ")
            }
        };

        Ok(ValidatedAuthorization {
            client,
            redirect_uri,
            scope,
            state,
            code_challenge,
            code_challenge_method: PKCE_METHOD_S256.to_string(),
        })
    }

    /// Handle the login form: re-validate, authenticate the user and mint a
    /// one-time code.
    pub async fn submit_login(&self, form: &LoginForm) -> Result<LoginOutcome, AuthorizeError> {
        let authorization = self.validate_authorize(&form.authorize_params()).await?;
        let redirect = |error: OAuthError| AuthorizeError::Redirect {
            redirect_uri: authorization.redirect_uri.clone(),
            error,
            state: authorization.state.clone(),
        };

        if form.email.trim().is_empty() || form.password.is_empty() {
            return Ok(LoginOutcome::Rejected {
                authorization,
                message: "Email and password are required",
            });
        }

        let user = self
            .directory
            .verify_credentials(form.email.trim(), &form.password)
            .await
            .map_err(|e| {
                error!("credential check failed: {:#}", e);
                redirect(OAuthError::server_error())
            })?;
        let Some(user) = user else {
            warn!(client_id = %authorization.client.client_id, "login rejected: bad credentials");
            return Ok(LoginOutcome::Rejected {
                authorization,
                message: "Invalid email or password",
            });
        };
        if !user.is_active {
            return Ok(LoginOutcome::Rejected {
                authorization,
                message: "Account is not active",
            });
        }

        let code = generate_oauth_token();
        let now = chrono::Utc::now().timestamp();
        let record = AuthorizationCodeRecord {
            code_hash: hash_token(&code),
            client_id: authorization.client.client_id.clone(),
            user_id: user.user_id.clone(),
            redirect_uri: authorization.redirect_uri.clone(),
            scope: authorization.scope.clone(),
            code_challenge: Some(authorization.code_challenge.clone()),
            code_challenge_method: Some(authorization.code_challenge_method.clone()),
            expires_at: now + self.config.auth_code_ttl_secs,
            used: false,
            created_at: now,
        };
        self.store
            .insert_authorization_code(&record)
            .await
            .map_err(|e| {
                error!("failed to store authorization code: {:#}", e);
                redirect(OAuthError::server_error())
            })?;
        info!(client_id = %record.client_id, user_id = %record.user_id, "authorization code issued");

        let mut params = vec![("code", code.as_str())];
        if let Some(state) = authorization.state.as_deref() {
            params.push(("state", state));
        }
        let redirect_url = append_query(&authorization.redirect_uri, &params)
            .ok_or_else(|| redirect(OAuthError::server_error()))?;

        Ok(LoginOutcome::Issued { redirect_url })
    }

    // ----- token endpoint --------------------------------------------------

    /// Handle `POST /token`. `basic` carries credentials parsed from an HTTP
    /// Basic header, if one was sent.
    pub async fn exchange(
        &self,
        request: TokenRequest,
        basic: Option<ClientCredentials>,
    ) -> Result<TokenResponse, OAuthError> {
        let credentials = resolve_client_credentials(&request, basic)?;
        let client = self.authenticate_client(&credentials).await?;

        let grant_type = non_empty(&request.grant_type)
            .ok_or_else(|| OAuthError::invalid_request("grant_type is required"))?;
        match grant_type {
            GRANT_AUTHORIZATION_CODE | GRANT_REFRESH_TOKEN if !client.allows_grant(grant_type) => {
                Err(OAuthError::new(
                    OAuthErrorCode::UnauthorizedClient,
                    format!("client is not allowed to use the {} grant", grant_type),
                ))
            }
            GRANT_AUTHORIZATION_CODE => self.exchange_code(&client, &request).await,
            GRANT_REFRESH_TOKEN => self.refresh(&client, &request).await,
            other => Err(OAuthError::new(
                OAuthErrorCode::UnsupportedGrantType,
                format!("unsupported grant_type: {}", other),
            )),
        }
    }

    async fn authenticate_client(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<OAuthClientRecord, OAuthError> {
        let client = self
            .store
            .find_client(&ClientId::new(credentials.client_id.as_str()))
            .await
            .map_err(|e| {
                error!("failed to load oauth client: {:#}", e);
                OAuthError::server_error()
            })?
            .ok_or_else(|| OAuthError::invalid_client("unknown client"))?;

        if client.confidential {
            let presented = credentials
                .client_secret
                .as_deref()
                .ok_or_else(|| OAuthError::invalid_client("client authentication required"))?;
            let expected = client
                .secret_hash
                .as_ref()
                .ok_or_else(|| OAuthError::invalid_client("client authentication failed"))?;
            let presented = hash_token(presented);
            let matches: bool = presented
                .as_str()
                .as_bytes()
                .ct_eq(expected.as_str().as_bytes())
                .into();
            if !matches {
                warn!(client_id = %client.client_id, "client authentication failed");
                return Err(OAuthError::invalid_client("client authentication failed"));
            }
        }

        Ok(client)
    }

    async fn exchange_code(
        &self,
        client: &OAuthClientRecord,
        request: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let code = non_empty(&request.code)
            .ok_or_else(|| OAuthError::invalid_request("code is required"))?;
        let redirect_uri = non_empty(&request.redirect_uri)
            .ok_or_else(|| OAuthError::invalid_request("redirect_uri is required"))?;

        // Claiming marks the code used; every check below runs on a burned code.
        let record = self
            .store
            .claim_authorization_code(&hash_token(code))
            .await
            .map_err(|e| {
                error!("failed to claim authorization code: {:#}", e);
                OAuthError::server_error()
            })?
            .ok_or_else(|| OAuthError::invalid_grant("invalid or already used authorization code"))?;

        let now = chrono::Utc::now().timestamp();
        if record.client_id != client.client_id {
            warn!(client_id = %client.client_id, "authorization code presented by another client");
            return Err(OAuthError::invalid_grant("authorization code was issued to another client"));
        }
        if record.expires_at <= now {
            return Err(OAuthError::invalid_grant("authorization code has expired"));
        }
        if record.redirect_uri != redirect_uri {
            return Err(OAuthError::invalid_grant("redirect_uri mismatch"));
        }
        if let Some(challenge) = record.code_challenge.as_deref() {
            let verifier = non_empty(&request.code_verifier)
                .ok_or_else(|| OAuthError::invalid_grant("code_verifier is required"))?;
            let method = record
                .code_challenge_method
                .as_deref()
                .unwrap_or(PKCE_METHOD_S256);
            if !verify_pkce(verifier, challenge, method) {
                warn!(client_id = %client.client_id, "pkce verification failed");
                return Err(OAuthError::invalid_grant("code_verifier does not match"));
            }
        }

        self.issue_tokens(client, &record.user_id, &record.scope).await
    }

    async fn refresh(
        &self,
        client: &OAuthClientRecord,
        request: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let refresh_token = non_empty(&request.refresh_token)
            .ok_or_else(|| OAuthError::invalid_request("refresh_token is required"))?;
        let refresh_hash = hash_token(refresh_token);

        let row = self
            .store
            .find_token_by_refresh_hash(&refresh_hash)
            .await
            .map_err(|e| {
                error!("failed to load refresh token: {:#}", e);
                OAuthError::server_error()
            })?
            .filter(|row| !row.revoked)
            .ok_or_else(|| OAuthError::invalid_grant("invalid refresh token"))?;

        let now = chrono::Utc::now().timestamp();
        if row.client_id != client.client_id {
            warn!(client_id = %client.client_id, "refresh token presented by another client");
            return Err(OAuthError::invalid_grant("invalid refresh token"));
        }
        if row.refresh_expires_at.is_some_and(|exp| exp <= now) {
            return Err(OAuthError::invalid_grant("refresh token has expired"));
        }

        let scope = match non_empty(&request.scope) {
            None => row.scope.clone(),
            Some(requested) => {
                let granted: HashSet<&str> = row.scope.split_whitespace().collect();
                if requested.split_whitespace().any(|s| !granted.contains(s)) {
                    return Err(OAuthError::invalid_scope(
                        "requested scope exceeds the original grant",
                    ));
                }
                requested.split_whitespace().collect::<Vec<_>>().join(" ")
            }
        };

        // Rotation: only the caller that revokes the live row may continue.
        let revoked = self
            .store
            .revoke_token_by_refresh_hash(&refresh_hash)
            .await
            .map_err(|e| {
                error!("failed to revoke refresh token: {:#}", e);
                OAuthError::server_error()
            })?
            .ok_or_else(|| OAuthError::invalid_grant("invalid refresh token"))?;
        self.authenticator.invalidate(&revoked.access_token_hash);

        self.issue_tokens(client, &revoked.user_id, &scope).await
    }

    async fn issue_tokens(
        &self,
        client: &OAuthClientRecord,
        user_id: &UserId,
        scope: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let now = chrono::Utc::now().timestamp();
        let access_token = generate_oauth_token();
        let refresh_token = client
            .allows_grant(GRANT_REFRESH_TOKEN)
            .then(generate_oauth_token);

        let record = OAuthTokenRecord {
            access_token_hash: hash_token(&access_token),
            refresh_token_hash: refresh_token.as_deref().map(hash_token),
            client_id: client.client_id.clone(),
            user_id: user_id.clone(),
            scope: scope.to_string(),
            access_expires_at: now + self.config.access_token_ttl_secs,
            refresh_expires_at: refresh_token
                .as_ref()
                .map(|_| now + self.config.refresh_token_ttl_secs),
            revoked: false,
            created_at: now,
        };
        self.store.insert_token(&record).await.map_err(|e| {
            error!("failed to store tokens: {:#}", e);
            OAuthError::server_error()
        })?;
        info!(client_id = %client.client_id, user_id = %user_id, "tokens issued");

        Ok(TokenResponse {
            access_token,
            token_type: TOKEN_TYPE_BEARER.to_string(),
            expires_in: self.config.access_token_ttl_secs,
            refresh_token,
            scope: scope.to_string(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Merge credentials from the Basic header and the form body. Both paths
/// end in the same validation; sending conflicting client ids is an error.
fn resolve_client_credentials(
    request: &TokenRequest,
    basic: Option<ClientCredentials>,
) -> Result<ClientCredentials, OAuthError> {
    let form_id = non_empty(&request.client_id);
    match basic {
        Some(basic) => {
            if form_id.is_some_and(|id| id != basic.client_id) {
                return Err(OAuthError::invalid_request(
                    "client_id in body does not match the authorization header",
                ));
            }
            Ok(basic)
        }
        None => {
            let client_id = form_id
                .ok_or_else(|| OAuthError::invalid_request("client_id is required"))?
                .to_string();
            Ok(ClientCredentials {
                client_id,
                client_secret: request.client_secret.clone().filter(|s| !s.is_empty()),
            })
        }
    }
}
