//! Two-legged JWT bearer flow for service-account keys (RFC 7523).

use std::fmt;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::Serialize;
use tracing::debug;

use super::FetchStrategy;
use super::http;
use crate::context::{BoxFuture, FetchContext};
use crate::credentials::JwtConfig;
use crate::error::{Flow, Hop, TokenError};
use crate::token::Token;

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Assertion lifetime.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// `iat` is backdated so a server with a slightly slow clock accepts it.
const ISSUED_AT_BACKDATE_SECS: i64 = 10;

/// Signs an assertion for a [`JwtConfig`] and redeems it for a token.
pub trait JwtRedeemer: Send + Sync {
    /// Signs and redeems one assertion.
    fn sign_and_redeem<'a>(
        &'a self,
        config: &'a JwtConfig,
        ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>>;
}

/// Fetch strategy for `service_account` documents.
pub struct ServiceAccountStrategy {
    config: JwtConfig,
    redeemer: Arc<dyn JwtRedeemer>,
}

impl ServiceAccountStrategy {
    /// Creates the strategy.
    pub fn new(config: JwtConfig, redeemer: Arc<dyn JwtRedeemer>) -> Self {
        Self { config, redeemer }
    }

    /// The configuration assertions are signed with.
    pub fn config(&self) -> &JwtConfig {
        &self.config
    }
}

impl fmt::Debug for ServiceAccountStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountStrategy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FetchStrategy for ServiceAccountStrategy {
    fn flow(&self) -> Flow {
        Flow::ServiceAccount
    }

    fn fetch_token<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async move {
            debug!(
                issuer = %self.config.email,
                token_url = %self.config.token_url,
                "redeeming service account assertion"
            );
            ctx.run(self.redeemer.sign_and_redeem(&self.config, ctx))
                .await
        })
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    exp: i64,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
}

/// Signs an RS256 assertion for `config`, issued at `now` (Unix seconds).
fn sign_assertion(config: &JwtConfig, now: i64) -> Result<String, TokenError> {
    let issued_at = now - ISSUED_AT_BACKDATE_SECS;
    let claims = Claims {
        iss: &config.email,
        scope: config.scopes.join(" "),
        aud: &config.token_url,
        exp: issued_at + ASSERTION_LIFETIME_SECS,
        iat: issued_at,
        sub: config.subject.as_deref(),
    };

    let mut header = Header::new(Algorithm::RS256);
    header.typ = Some("JWT".to_string());
    if !config.private_key_id.is_empty() {
        header.kid = Some(config.private_key_id.clone());
    }

    let key = EncodingKey::from_rsa_pem(config.private_key.expose().as_bytes()).map_err(|err| {
        TokenError::configuration(
            Flow::ServiceAccount,
            format!("invalid RSA private key (PEM): {err}"),
        )
    })?;
    encode(&header, &claims, &key).map_err(|err| {
        TokenError::configuration(Flow::ServiceAccount, format!("failed to sign JWT: {err}"))
    })
}

/// [`JwtRedeemer`] posting to the configured token URL.
#[derive(Debug, Clone)]
pub struct HttpJwtRedeemer {
    http: reqwest::Client,
}

impl HttpJwtRedeemer {
    /// Creates a redeemer sharing `http`.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl JwtRedeemer for HttpJwtRedeemer {
    fn sign_and_redeem<'a>(
        &'a self,
        config: &'a JwtConfig,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async move {
            let assertion = sign_assertion(config, chrono::Utc::now().timestamp())?;
            let form = [("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())];

            let request = http::with_form(
                self.http.post(&config.token_url),
                &form,
                Flow::ServiceAccount,
                Hop::TokenEndpoint,
            )?;
            let body = http::execute(request, Flow::ServiceAccount, Hop::TokenEndpoint).await?;
            http::parse_token(&body, Flow::ServiceAccount, Hop::TokenEndpoint)
        })
    }
}
