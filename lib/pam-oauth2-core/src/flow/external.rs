//! Workload identity federation for `external_account` documents.
//!
//! A fetch has up to three hops:
//!
//! 1. read the subject token from the credential source,
//! 2. exchange it at the STS endpoint (RFC 8693),
//! 3. optionally impersonate a service account with the exchanged token.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::FetchStrategy;
use super::http;
use crate::context::{BoxFuture, FetchContext};
use crate::credentials::ExternalAccount;
use crate::error::{Flow, Hop, TokenError};
use crate::secret::SecretString;
use crate::token::Token;

const FLOW: Flow = Flow::ExternalAccount;

/// Scope requested when none is given, and at the STS when impersonating.
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Lifetime asked for impersonated tokens.
const IMPERSONATION_LIFETIME: Duration = Duration::from_secs(3600);

/// Resolves the opaque `credential_source` object to a subject token.
pub trait SubjectTokenSupplier: Send + Sync {
    /// Reads the current subject token.
    fn subject_token<'a>(
        &'a self,
        source: &'a Value,
        ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<SecretString, TokenError>>;
}

/// RFC 8693 token exchange request.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeRequest<'a> {
    /// STS endpoint.
    pub token_url: &'a str,
    /// Workload identity provider.
    pub audience: &'a str,
    /// Token read from the credential source.
    pub subject_token: &'a SecretString,
    /// Type of `subject_token`.
    pub subject_token_type: &'a str,
    /// Scopes for the exchanged token.
    pub scopes: &'a [String],
    /// Client id for STS client authentication.
    pub client_id: Option<&'a str>,
    /// Client secret for STS client authentication.
    pub client_secret: Option<&'a SecretString>,
}

/// Service-account impersonation request.
#[derive(Debug, Clone, Copy)]
pub struct ImpersonationRequest<'a> {
    /// IAM `generateAccessToken` URL.
    pub url: &'a str,
    /// Exchanged STS token, used as the bearer credential.
    pub access_token: &'a str,
    /// Scopes of the impersonated token.
    pub scopes: &'a [String],
    /// Requested lifetime.
    pub lifetime: Duration,
}

/// Performs the STS exchange and the impersonation hop.
pub trait TokenExchanger: Send + Sync {
    /// Exchanges a subject token for an access token.
    fn exchange<'a>(
        &'a self,
        request: ExchangeRequest<'a>,
        ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>>;

    /// Trades an access token for a service-account token.
    fn impersonate<'a>(
        &'a self,
        request: ImpersonationRequest<'a>,
        ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>>;
}

/// Fetch strategy for `external_account` documents.
pub struct ExternalAccountStrategy {
    account: ExternalAccount,
    scopes: Vec<String>,
    subject_tokens: Arc<dyn SubjectTokenSupplier>,
    exchanger: Arc<dyn TokenExchanger>,
}

impl ExternalAccountStrategy {
    /// Creates the strategy. No scopes means the cloud-platform scope.
    pub fn new(
        account: ExternalAccount,
        scopes: &[String],
        subject_tokens: Arc<dyn SubjectTokenSupplier>,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Self {
        let scopes = if scopes.is_empty() {
            vec![CLOUD_PLATFORM_SCOPE.to_string()]
        } else {
            scopes.to_vec()
        };
        Self {
            account,
            scopes,
            subject_tokens,
            exchanger,
        }
    }

    /// The scopes of the final token.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

impl fmt::Debug for ExternalAccountStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalAccountStrategy")
            .field("audience", &self.account.audience)
            .field("token_url", &self.account.token_url)
            .field(
                "impersonation_url",
                &self.account.service_account_impersonation_url,
            )
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Attributes a collaborator error to `hop`.
fn at_hop(err: TokenError, hop: Hop) -> TokenError {
    match err {
        TokenError::IncompleteToken { reason, .. } => TokenError::IncompleteToken {
            flow: FLOW,
            hop,
            reason,
        },
        TokenError::InvalidResponse { reason, .. } => TokenError::InvalidResponse {
            flow: FLOW,
            hop,
            reason,
        },
        TokenError::Rejected { status, reason, .. } => TokenError::Rejected {
            flow: FLOW,
            hop,
            status,
            reason,
        },
        TokenError::Transport { reason, .. } => TokenError::Transport {
            flow: FLOW,
            hop,
            reason,
        },
        other => other,
    }
}

impl FetchStrategy for ExternalAccountStrategy {
    fn flow(&self) -> Flow {
        FLOW
    }

    fn issuing_hop(&self) -> Hop {
        if self.account.service_account_impersonation_url.is_some() {
            Hop::Impersonation
        } else {
            Hop::Exchange
        }
    }

    fn fetch_token<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async move {
            let account = &self.account;

            let subject_token = ctx
                .run(self.subject_tokens.subject_token(&account.credential_source, ctx))
                .await
                .map_err(|err| at_hop(err, Hop::SubjectToken))?;

            let platform_scope = [CLOUD_PLATFORM_SCOPE.to_string()];
            let exchange_scopes: &[String] = match account.service_account_impersonation_url {
                Some(_) => &platform_scope,
                None => &self.scopes,
            };

            debug!(token_url = %account.token_url, audience = %account.audience, "exchanging subject token");
            let exchanged = ctx
                .run(self.exchanger.exchange(
                    ExchangeRequest {
                        token_url: &account.token_url,
                        audience: &account.audience,
                        subject_token: &subject_token,
                        subject_token_type: &account.subject_token_type,
                        scopes: exchange_scopes,
                        client_id: account.client_id.as_deref(),
                        client_secret: account.client_secret.as_ref(),
                    },
                    ctx,
                ))
                .await
                .map_err(|err| at_hop(err, Hop::Exchange))?;

            let Some(url) = account.service_account_impersonation_url.as_deref() else {
                return Ok(exchanged);
            };

            debug!(%url, "impersonating service account");
            ctx.run(self.exchanger.impersonate(
                ImpersonationRequest {
                    url,
                    access_token: exchanged.access_token(),
                    scopes: &self.scopes,
                    lifetime: IMPERSONATION_LIFETIME,
                },
                ctx,
            ))
            .await
            .map_err(|err| at_hop(err, Hop::Impersonation))
        })
    }
}

/// [`TokenExchanger`] talking to the STS and IAM credentials endpoints.
#[derive(Debug, Clone)]
pub struct HttpTokenExchanger {
    http: reqwest::Client,
}

impl HttpTokenExchanger {
    /// Creates an exchanger sharing `http`.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[derive(Serialize)]
struct StsForm<'a> {
    grant_type: &'static str,
    audience: &'a str,
    scope: String,
    requested_token_type: &'static str,
    subject_token: &'a str,
    subject_token_type: &'a str,
}

#[derive(Serialize)]
struct GenerateAccessTokenRequest<'a> {
    scope: &'a [String],
    lifetime: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expire_time: String,
}

impl TokenExchanger for HttpTokenExchanger {
    fn exchange<'a>(
        &'a self,
        request: ExchangeRequest<'a>,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async move {
            let form = StsForm {
                grant_type: TOKEN_EXCHANGE_GRANT,
                audience: request.audience,
                scope: request.scopes.join(" "),
                requested_token_type: ACCESS_TOKEN_TYPE,
                subject_token: request.subject_token.expose(),
                subject_token_type: request.subject_token_type,
            };

            let mut builder = self.http.post(request.token_url);
            if let Some(client_id) = request.client_id {
                builder = builder.basic_auth(client_id, request.client_secret.map(SecretString::expose));
            }
            let builder = http::with_form(builder, &form, FLOW, Hop::Exchange)?;

            let body = http::execute(builder, FLOW, Hop::Exchange).await?;
            http::parse_token(&body, FLOW, Hop::Exchange)
        })
    }

    fn impersonate<'a>(
        &'a self,
        request: ImpersonationRequest<'a>,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async move {
            let payload = GenerateAccessTokenRequest {
                scope: request.scopes,
                lifetime: format!("{}s", request.lifetime.as_secs()),
            };
            let builder = self
                .http
                .post(request.url)
                .bearer_auth(request.access_token)
                .json(&payload);

            let body = http::execute(builder, FLOW, Hop::Impersonation).await?;
            let response: GenerateAccessTokenResponse = serde_json::from_str(&body)
                .map_err(|err| TokenError::invalid_response(FLOW, Hop::Impersonation, err))?;

            if response.access_token.is_empty() {
                return Err(TokenError::IncompleteToken {
                    flow: FLOW,
                    hop: Hop::Impersonation,
                    reason: "server response missing accessToken".to_string(),
                });
            }
            let expire_time = chrono::DateTime::parse_from_rfc3339(&response.expire_time)
                .map_err(|err| {
                    TokenError::invalid_response(
                        FLOW,
                        Hop::Impersonation,
                        format!("invalid expireTime '{}': {err}", response.expire_time),
                    )
                })?;
            let remaining = (expire_time.with_timezone(&chrono::Utc) - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            Ok(Token::new(response.access_token)
                .with_token_type("Bearer")
                .with_expires_in(remaining))
        })
    }
}

#[derive(Debug, Deserialize)]
struct CredentialSource {
    file: Option<String>,
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    executable: Option<Value>,
    environment_id: Option<String>,
    #[serde(default)]
    format: SourceFormat,
}

#[derive(Debug, Default, Deserialize)]
struct SourceFormat {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    subject_token_field_name: String,
}

/// [`SubjectTokenSupplier`] for file and URL credential sources.
///
/// The token is read as text, or as a JSON object when `format.type` is
/// `json`, in which case `format.subject_token_field_name` names the field.
/// Executable and AWS sources need a dedicated supplier.
#[derive(Debug, Clone)]
pub struct CredentialSourceSupplier {
    http: reqwest::Client,
}

impl CredentialSourceSupplier {
    /// Creates a supplier sharing `http` for URL sources.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn read(&self, source: &CredentialSource) -> Result<String, TokenError> {
        if let Some(path) = &source.file {
            return tokio::fs::read_to_string(path).await.map_err(|err| {
                let reason = format!("cannot read '{path}': {err}");
                match err.kind() {
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                        TokenError::configuration(FLOW, reason)
                    }
                    _ => TokenError::transport(FLOW, Hop::SubjectToken, reason),
                }
            });
        }

        if let Some(url) = &source.url {
            let mut builder = self.http.get(url);
            for (name, value) in &source.headers {
                builder = builder.header(name, value);
            }
            return http::execute(builder, FLOW, Hop::SubjectToken).await;
        }

        let reason = if source.executable.is_some() {
            "executable-sourced credentials need a dedicated subject token supplier"
        } else if source.environment_id.is_some() {
            "environment-sourced credentials need a dedicated subject token supplier"
        } else {
            "credential_source names no file or url"
        };
        Err(TokenError::configuration(FLOW, reason))
    }
}

fn extract_subject_token(raw: &str, format: &SourceFormat) -> Result<SecretString, TokenError> {
    let token = match format.kind.as_str() {
        "" | "text" => raw.trim().to_string(),
        "json" => {
            if format.subject_token_field_name.is_empty() {
                return Err(TokenError::configuration(
                    FLOW,
                    "credential_source format 'json' requires subject_token_field_name",
                ));
            }
            let document: Value = serde_json::from_str(raw)
                .map_err(|err| TokenError::invalid_response(FLOW, Hop::SubjectToken, err))?;
            document
                .get(&format.subject_token_field_name)
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| {
                    TokenError::invalid_response(
                        FLOW,
                        Hop::SubjectToken,
                        format!("no string field '{}'", format.subject_token_field_name),
                    )
                })?
        }
        other => {
            return Err(TokenError::configuration(
                FLOW,
                format!("unsupported credential_source format '{other}'"),
            ));
        }
    };

    if token.is_empty() {
        return Err(TokenError::IncompleteToken {
            flow: FLOW,
            hop: Hop::SubjectToken,
            reason: "subject token is empty".to_string(),
        });
    }
    Ok(SecretString::new(token))
}

impl SubjectTokenSupplier for CredentialSourceSupplier {
    fn subject_token<'a>(
        &'a self,
        source: &'a Value,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<SecretString, TokenError>> {
        Box::pin(async move {
            let source = CredentialSource::deserialize(source).map_err(|err| {
                TokenError::configuration(FLOW, format!("invalid credential_source: {err}"))
            })?;
            let raw = self.read(&source).await?;
            extract_subject_token(&raw, &source.format)
        })
    }
}
