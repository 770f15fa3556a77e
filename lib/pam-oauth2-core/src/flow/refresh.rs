//! Three-legged refresh-token flow for `authorized_user` documents.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::{
    AccessToken, AuthType, ClientId, ClientSecret, RefreshToken, RequestTokenError, Scope,
    StandardRevocableToken, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use super::FetchStrategy;
use super::http::lenient_seconds;
use crate::context::{BoxFuture, FetchContext};
use crate::credentials::UserCredentials;
use crate::endpoint::{AuthStyle, Endpoint, Provider};
use crate::error::{Flow, Hop, TokenError};
use crate::secret::SecretString;
use crate::token::Token;

const FLOW: Flow = Flow::AuthorizedUser;

/// One refresh-token grant.
#[derive(Debug, Clone, Copy)]
pub struct RefreshRequest<'a> {
    /// Endpoint to redeem at; `token_url` is never empty.
    pub endpoint: &'a Endpoint,
    /// OAuth client id.
    pub client_id: &'a str,
    /// OAuth client secret, empty for public clients.
    pub client_secret: &'a SecretString,
    /// Refresh token to redeem.
    pub refresh_token: &'a SecretString,
}

/// Redeems refresh tokens at a token endpoint.
pub trait TokenEndpoint: Send + Sync {
    /// Performs one `grant_type=refresh_token` request.
    fn refresh<'a>(
        &'a self,
        request: RefreshRequest<'a>,
        ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>>;
}

/// Fetch strategy for `authorized_user` documents.
///
/// When the server rotates the refresh token the new one is used for every
/// later fetch; otherwise the current one is carried into each new token.
pub struct RefreshTokenStrategy {
    client_id: String,
    client_secret: SecretString,
    endpoint: Endpoint,
    refresh_token: tokio::sync::Mutex<SecretString>,
    transport: Arc<dyn TokenEndpoint>,
}

impl RefreshTokenStrategy {
    /// Creates the strategy, filling missing URLs from `fallback`.
    pub fn new(
        user: &UserCredentials,
        fallback: Option<Provider>,
        transport: Arc<dyn TokenEndpoint>,
    ) -> Self {
        Self {
            client_id: user.client_id.clone(),
            client_secret: user.client_secret.clone(),
            endpoint: resolve_endpoint(user, fallback),
            refresh_token: tokio::sync::Mutex::new(user.refresh_token.clone()),
            transport,
        }
    }

    /// The endpoint tokens are redeemed at.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// URLs in the document win; gaps are filled from the provider registry.
fn resolve_endpoint(user: &UserCredentials, fallback: Option<Provider>) -> Endpoint {
    let registry = fallback.map(Provider::endpoint);

    let auth_url = user
        .auth_url
        .clone()
        .or_else(|| registry.map(|endpoint| endpoint.auth_url.clone()))
        .unwrap_or_default();
    let token_url = user
        .token_url
        .clone()
        .or_else(|| registry.map(|endpoint| endpoint.token_url.clone()))
        .unwrap_or_default();
    let auth_style = match (&user.token_url, registry) {
        (Some(_), _) => AuthStyle::InParams,
        (None, Some(endpoint)) => endpoint.auth_style,
        (None, None) => AuthStyle::default(),
    };

    Endpoint {
        auth_url,
        token_url,
        auth_style,
    }
}

impl fmt::Debug for RefreshTokenStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTokenStrategy")
            .field("client_id", &self.client_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl FetchStrategy for RefreshTokenStrategy {
    fn flow(&self) -> Flow {
        FLOW
    }

    fn fetch_token<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async move {
            if self.endpoint.token_url.is_empty() {
                return Err(TokenError::MissingEndpoint { flow: FLOW });
            }

            let current = self.refresh_token.lock().await.clone();
            debug!(token_url = %self.endpoint.token_url, "redeeming refresh token");
            let request = RefreshRequest {
                endpoint: &self.endpoint,
                client_id: &self.client_id,
                client_secret: &self.client_secret,
                refresh_token: &current,
            };
            let token = ctx.run(self.transport.refresh(request, ctx)).await?;

            match token.refresh_token() {
                Some(rotated) if !rotated.is_empty() => {
                    if rotated != current.expose() {
                        debug!("token endpoint rotated the refresh token");
                        *self.refresh_token.lock().await = SecretString::new(rotated);
                    }
                    Ok(token)
                }
                _ => Ok(token.with_refresh_token(current.expose())),
            }
        })
    }
}

/// Refresh grant response.
///
/// Unlike `oauth2`'s standard response, `token_type` is optional and matched
/// case-insensitively; providers such as Slack omit it.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RefreshResponse {
    #[serde(default = "empty_access_token")]
    access_token: AccessToken,
    #[serde(default = "bearer", deserialize_with = "token_type_ignoring_case")]
    token_type: BasicTokenType,
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<RefreshToken>,
}

fn empty_access_token() -> AccessToken {
    AccessToken::new(String::new())
}

fn bearer() -> BasicTokenType {
    BasicTokenType::Bearer
}

fn token_type_ignoring_case<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BasicTokenType, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    Ok(match raw.to_ascii_lowercase().as_str() {
        "" | "bearer" => BasicTokenType::Bearer,
        "mac" => BasicTokenType::Mac,
        _ => BasicTokenType::Extension(raw),
    })
}

impl TokenResponse for RefreshResponse {
    type TokenType = BasicTokenType;

    fn access_token(&self) -> &AccessToken {
        &self.access_token
    }

    fn token_type(&self) -> &BasicTokenType {
        &self.token_type
    }

    fn expires_in(&self) -> Option<Duration> {
        self.expires_in.map(Duration::from_secs)
    }

    fn refresh_token(&self) -> Option<&RefreshToken> {
        self.refresh_token.as_ref()
    }

    fn scopes(&self) -> Option<&Vec<Scope>> {
        None
    }
}

type RefreshClient = oauth2::Client<
    BasicErrorResponse,
    RefreshResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

/// [`TokenEndpoint`] backed by the `oauth2` crate.
///
/// With [`AuthStyle::AutoDetect`] the HTTP Basic header is tried first and
/// form parameters second; the style that worked is remembered per token URL.
pub struct OAuth2TokenEndpoint {
    http: oauth2::reqwest::Client,
    learned_styles: Mutex<HashMap<String, AuthStyle>>,
}

impl fmt::Debug for OAuth2TokenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2TokenEndpoint").finish_non_exhaustive()
    }
}

impl OAuth2TokenEndpoint {
    /// Creates the endpoint client.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be initialised.
    pub fn new() -> Result<Self, TokenError> {
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| {
                TokenError::configuration(FLOW, format!("cannot build HTTP client: {err}"))
            })?;
        Ok(Self {
            http,
            learned_styles: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the style learned for `token_url`, if any.
    pub fn learned_style(&self, token_url: &str) -> Option<AuthStyle> {
        self.learned_styles
            .lock()
            .ok()
            .and_then(|styles| styles.get(token_url).copied())
    }

    fn learn(&self, token_url: &str, style: AuthStyle) {
        if let Ok(mut styles) = self.learned_styles.lock() {
            styles.insert(token_url.to_string(), style);
        }
    }

    async fn exchange(
        &self,
        request: &RefreshRequest<'_>,
        auth_type: AuthType,
    ) -> Result<Token, TokenError> {
        let token_url = TokenUrl::new(request.endpoint.token_url.clone()).map_err(|err| {
            TokenError::configuration(
                FLOW,
                format!("invalid token URL '{}': {err}", request.endpoint.token_url),
            )
        })?;

        let mut client = RefreshClient::new(ClientId::new(request.client_id.to_string()))
            .set_auth_type(auth_type)
            .set_token_uri(token_url);
        if !request.client_secret.is_empty() {
            client = client.set_client_secret(ClientSecret::new(
                request.client_secret.expose().to_string(),
            ));
        }

        let refresh_token = RefreshToken::new(request.refresh_token.expose().to_string());
        let response = client
            .exchange_refresh_token(&refresh_token)
            .request_async(&self.http)
            .await
            .map_err(request_error)?;

        let access_token = response.access_token().secret();
        if access_token.is_empty() {
            return Err(TokenError::IncompleteToken {
                flow: FLOW,
                hop: Hop::TokenEndpoint,
                reason: "server response missing access_token".to_string(),
            });
        }

        let mut token =
            Token::new(access_token.clone()).with_token_type(token_type(response.token_type()));
        if let Some(expires_in) = response.expires_in().filter(|expires_in| !expires_in.is_zero()) {
            token = token.with_expires_in(expires_in);
        }
        if let Some(refresh_token) = response.refresh_token() {
            token = token.with_refresh_token(refresh_token.secret().clone());
        }
        Ok(token)
    }
}

fn token_type(token_type: &BasicTokenType) -> &str {
    match token_type {
        BasicTokenType::Bearer => "Bearer",
        BasicTokenType::Mac => "MAC",
        BasicTokenType::Extension(other) => other,
    }
}

fn request_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> TokenError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => TokenError::Rejected {
            flow: FLOW,
            hop: Hop::TokenEndpoint,
            status: None,
            reason: response.to_string(),
        },
        RequestTokenError::Request(err) => TokenError::transport(FLOW, Hop::TokenEndpoint, err),
        RequestTokenError::Parse(err, _body) => {
            TokenError::invalid_response(FLOW, Hop::TokenEndpoint, err)
        }
        RequestTokenError::Other(reason) => TokenError::invalid_response(FLOW, Hop::TokenEndpoint, reason),
    }
}

impl TokenEndpoint for OAuth2TokenEndpoint {
    fn refresh<'a>(
        &'a self,
        request: RefreshRequest<'a>,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async move {
            let token_url = request.endpoint.token_url.as_str();
            let style = self
                .learned_style(token_url)
                .unwrap_or(request.endpoint.auth_style);

            match style {
                AuthStyle::InParams => self.exchange(&request, AuthType::RequestBody).await,
                AuthStyle::InHeader => self.exchange(&request, AuthType::BasicAuth).await,
                AuthStyle::AutoDetect => match self.exchange(&request, AuthType::BasicAuth).await {
                    Ok(token) => {
                        self.learn(token_url, AuthStyle::InHeader);
                        Ok(token)
                    }
                    Err(
                        err @ (TokenError::Rejected { .. } | TokenError::InvalidResponse { .. }),
                    ) => {
                        warn!(%token_url, error = %err, "basic auth refused, retrying with client credentials in the body");
                        let token = self.exchange(&request, AuthType::RequestBody).await?;
                        self.learn(token_url, AuthStyle::InParams);
                        Ok(token)
                    }
                    Err(err) => Err(err),
                },
            }
        })
    }
}
