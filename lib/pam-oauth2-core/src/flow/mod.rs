//! Authentication flows and the builder that selects one from a document.
//!
//! Every flow implements [`FetchStrategy`]: it knows how to obtain exactly one
//! fresh token and nothing else. Caching lives in
//! [`CachedTokenSource`](crate::CachedTokenSource).
//!
//! Network I/O is delegated to collaborator traits ([`JwtRedeemer`],
//! [`TokenEndpoint`], [`SubjectTokenSupplier`], [`TokenExchanger`],
//! [`PlatformProbe`], [`MetadataClient`]) so the flows stay testable and the
//! transport can be swapped.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::cache::CachedTokenSource;
use crate::context::{BoxFuture, FetchContext};
use crate::credentials::{CredentialsDocument, JwtConfig};
use crate::endpoint::Provider;
use crate::error::{Flow, Hop, TokenError};
use crate::secret::SecretString;
use crate::token::Token;

mod external;
mod http;
mod jwt;
mod metadata;
mod refresh;

pub use self::external::{
    CredentialSourceSupplier, ExchangeRequest, ExternalAccountStrategy, HttpTokenExchanger,
    ImpersonationRequest, SubjectTokenSupplier, TokenExchanger,
};
pub use self::jwt::{HttpJwtRedeemer, JwtRedeemer, ServiceAccountStrategy};
pub use self::metadata::{
    DEFAULT_ACCOUNT, DeprecationNotice, HttpMetadataClient, MetadataClient, MetadataStrategy,
    PlatformProbe, SysfsPlatformProbe, compute_token_source, legacy_app_engine_source,
};
pub use self::refresh::{OAuth2TokenEndpoint, RefreshRequest, RefreshTokenStrategy, TokenEndpoint};

/// Something that can fetch one fresh token.
pub trait FetchStrategy: Send + Sync {
    /// The flow, used to tag logs and errors.
    fn flow(&self) -> Flow;

    /// The hop that issues the final token.
    fn issuing_hop(&self) -> Hop {
        Hop::TokenEndpoint
    }

    /// Fetches a new token, honouring `ctx`.
    fn fetch_token<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, Result<Token, TokenError>>;
}

impl<T: FetchStrategy + ?Sized> FetchStrategy for Box<T> {
    fn flow(&self) -> Flow {
        (**self).flow()
    }

    fn issuing_hop(&self) -> Hop {
        (**self).issuing_hop()
    }

    fn fetch_token<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, Result<Token, TokenError>> {
        (**self).fetch_token(ctx)
    }
}

impl<T: FetchStrategy + ?Sized> FetchStrategy for Arc<T> {
    fn flow(&self) -> Flow {
        (**self).flow()
    }

    fn issuing_hop(&self) -> Hop {
        (**self).issuing_hop()
    }

    fn fetch_token<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, Result<Token, TokenError>> {
        (**self).fetch_token(ctx)
    }
}

/// Scopes and subject requested by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialsParams {
    /// Requested scopes, in order.
    pub scopes: Vec<String>,
    /// E-mail of the user a service account acts for.
    pub subject: Option<String>,
}

impl CredentialsParams {
    /// Creates parameters for the given scopes.
    pub fn new(scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            subject: None,
        }
    }

    /// Sets the impersonation subject.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// The strategy built for a credentials document.
///
/// One variant per document type; dispatch is an exhaustive match.
#[derive(Debug)]
pub enum FlowStrategy {
    /// JWT bearer grant.
    ServiceAccount(ServiceAccountStrategy),
    /// Refresh-token grant.
    AuthorizedUser(RefreshTokenStrategy),
    /// Subject-token exchange.
    ExternalAccount(ExternalAccountStrategy),
}

impl FetchStrategy for FlowStrategy {
    fn flow(&self) -> Flow {
        match self {
            Self::ServiceAccount(strategy) => strategy.flow(),
            Self::AuthorizedUser(strategy) => strategy.flow(),
            Self::ExternalAccount(strategy) => strategy.flow(),
        }
    }

    fn issuing_hop(&self) -> Hop {
        match self {
            Self::ServiceAccount(strategy) => strategy.issuing_hop(),
            Self::AuthorizedUser(strategy) => strategy.issuing_hop(),
            Self::ExternalAccount(strategy) => strategy.issuing_hop(),
        }
    }

    fn fetch_token<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, Result<Token, TokenError>> {
        match self {
            Self::ServiceAccount(strategy) => strategy.fetch_token(ctx),
            Self::AuthorizedUser(strategy) => strategy.fetch_token(ctx),
            Self::ExternalAccount(strategy) => strategy.fetch_token(ctx),
        }
    }
}

/// Wires a credentials document to its flow.
///
/// The builder only assembles state; it never performs I/O. Collaborators
/// default to an implementation that fails with [`TokenError::Configuration`],
/// use [`FlowBuilder::with_http_defaults`] for the HTTP-backed ones.
///
/// # Example
///
/// ```rust,no_run
/// use pam_oauth2_core::{CredentialsDocument, CredentialsParams, FlowBuilder};
///
/// # async fn example(raw: &[u8]) -> Result<(), pam_oauth2_core::TokenError> {
/// let document = CredentialsDocument::from_json(raw)?;
/// let source = FlowBuilder::with_http_defaults()?
///     .build_cached(&document, &CredentialsParams::new(["openid", "email"]));
///
/// let token = source.token().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FlowBuilder {
    provider: Option<Provider>,
    jwt: Arc<dyn JwtRedeemer>,
    token_endpoint: Arc<dyn TokenEndpoint>,
    subject_tokens: Arc<dyn SubjectTokenSupplier>,
    exchanger: Arc<dyn TokenExchanger>,
}

impl Default for FlowBuilder {
    fn default() -> Self {
        Self {
            provider: Some(Provider::Google),
            jwt: Arc::new(Unconfigured),
            token_endpoint: Arc::new(Unconfigured),
            subject_tokens: Arc::new(Unconfigured),
            exchanger: Arc::new(Unconfigured),
        }
    }
}

impl FlowBuilder {
    /// A builder using the HTTP-backed collaborators.
    ///
    /// # Errors
    ///
    /// Fails if an HTTP client cannot be initialised.
    pub fn with_http_defaults() -> Result<Self, TokenError> {
        let http = http::client(Flow::ServiceAccount)?;
        Ok(Self::default()
            .with_jwt_redeemer(HttpJwtRedeemer::new(http.clone()))
            .with_token_endpoint(OAuth2TokenEndpoint::new()?)
            .with_subject_token_supplier(CredentialSourceSupplier::new(http.clone()))
            .with_token_exchanger(HttpTokenExchanger::new(http)))
    }

    /// Sets the provider whose endpoint fills in missing user-credential URLs.
    #[must_use]
    pub fn with_provider_fallback(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Disables the registry fallback for user credentials.
    #[must_use]
    pub fn without_provider_fallback(mut self) -> Self {
        self.provider = None;
        self
    }

    /// Sets the JWT signer and redeemer.
    #[must_use]
    pub fn with_jwt_redeemer(mut self, redeemer: impl JwtRedeemer + 'static) -> Self {
        self.jwt = Arc::new(redeemer);
        self
    }

    /// Sets the refresh-token endpoint client.
    #[must_use]
    pub fn with_token_endpoint(mut self, endpoint: impl TokenEndpoint + 'static) -> Self {
        self.token_endpoint = Arc::new(endpoint);
        self
    }

    /// Sets the credential-source resolver.
    #[must_use]
    pub fn with_subject_token_supplier(
        mut self,
        supplier: impl SubjectTokenSupplier + 'static,
    ) -> Self {
        self.subject_tokens = Arc::new(supplier);
        self
    }

    /// Sets the STS and impersonation client.
    #[must_use]
    pub fn with_token_exchanger(mut self, exchanger: impl TokenExchanger + 'static) -> Self {
        self.exchanger = Arc::new(exchanger);
        self
    }

    /// Builds the strategy for `document`.
    pub fn build(&self, document: &CredentialsDocument, params: &CredentialsParams) -> FlowStrategy {
        match document {
            CredentialsDocument::ServiceAccount(key) => {
                let config = JwtConfig::from_key(key, &params.scopes, params.subject.as_deref());
                FlowStrategy::ServiceAccount(ServiceAccountStrategy::new(
                    config,
                    Arc::clone(&self.jwt),
                ))
            }
            CredentialsDocument::UserCredentials(user) => {
                FlowStrategy::AuthorizedUser(RefreshTokenStrategy::new(
                    user,
                    self.provider,
                    Arc::clone(&self.token_endpoint),
                ))
            }
            CredentialsDocument::ExternalAccount(account) => {
                FlowStrategy::ExternalAccount(ExternalAccountStrategy::new(
                    account.clone(),
                    &params.scopes,
                    Arc::clone(&self.subject_tokens),
                    Arc::clone(&self.exchanger),
                ))
            }
        }
    }

    /// Builds the strategy for `document` wrapped in a token cache.
    pub fn build_cached(
        &self,
        document: &CredentialsDocument,
        params: &CredentialsParams,
    ) -> CachedTokenSource<FlowStrategy> {
        CachedTokenSource::new(self.build(document, params))
    }
}

impl fmt::Debug for FlowBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowBuilder")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Placeholder collaborator for flows the caller did not wire.
#[derive(Debug, Clone, Copy)]
struct Unconfigured;

impl Unconfigured {
    fn fail<'a, T: Send + 'a>(flow: Flow, what: &'static str) -> BoxFuture<'a, Result<T, TokenError>> {
        Box::pin(async move {
            Err(TokenError::configuration(flow, format!("no {what} configured")))
        })
    }
}

impl JwtRedeemer for Unconfigured {
    fn sign_and_redeem<'a>(
        &'a self,
        _config: &'a JwtConfig,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>> {
        Self::fail(Flow::ServiceAccount, "JWT redeemer")
    }
}

impl TokenEndpoint for Unconfigured {
    fn refresh<'a>(
        &'a self,
        _request: RefreshRequest<'a>,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>> {
        Self::fail(Flow::AuthorizedUser, "token endpoint client")
    }
}

impl SubjectTokenSupplier for Unconfigured {
    fn subject_token<'a>(
        &'a self,
        _source: &'a Value,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<SecretString, TokenError>> {
        Self::fail(Flow::ExternalAccount, "subject token supplier")
    }
}

impl TokenExchanger for Unconfigured {
    fn exchange<'a>(
        &'a self,
        _request: ExchangeRequest<'a>,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>> {
        Self::fail(Flow::ExternalAccount, "token exchanger")
    }

    fn impersonate<'a>(
        &'a self,
        _request: ImpersonationRequest<'a>,
        _ctx: &'a FetchContext,
    ) -> BoxFuture<'a, Result<Token, TokenError>> {
        Self::fail(Flow::ExternalAccount, "token exchanger")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::credentials::JWT_TOKEN_URL;
    use crate::endpoint::AuthStyle;

    fn document(value: &Value) -> CredentialsDocument {
        CredentialsDocument::from_json(value.to_string().as_bytes()).expect("valid document")
    }

    #[test]
    fn should_build_service_account_with_default_token_url() {
        let doc = document(&json!({
            "type": "service_account",
            "client_email": "sa@p.iam.gserviceaccount.com",
            "private_key": "pem",
            "private_key_id": "kid"
        }));
        let params = CredentialsParams::new(["openid"]).with_subject("alice@example.com");

        let FlowStrategy::ServiceAccount(strategy) = FlowBuilder::default().build(&doc, &params)
        else {
            panic!("expected the JWT flow");
        };
        let config = strategy.config();
        assert_eq!(config.token_url, JWT_TOKEN_URL);
        assert_eq!(config.subject.as_deref(), Some("alice@example.com"));
        assert_eq!(config.private_key_id, "kid");
        assert_eq!(config.scopes, vec!["openid"]);
    }

    #[test]
    fn should_keep_token_url_from_key() {
        let doc = document(&json!({
            "type": "service_account",
            "client_email": "sa@p.iam.gserviceaccount.com",
            "private_key": "pem",
            "token_uri": "https://oauth2.example.com/token"
        }));

        let FlowStrategy::ServiceAccount(strategy) =
            FlowBuilder::default().build(&doc, &CredentialsParams::default())
        else {
            panic!("expected the JWT flow");
        };
        assert_eq!(strategy.config().token_url, "https://oauth2.example.com/token");
    }

    #[test]
    fn should_fill_user_endpoint_from_registry() {
        let doc = document(&json!({
            "type": "authorized_user",
            "client_id": "id",
            "client_secret": "secret",
            "refresh_token": "r",
            "auth_uri": "",
            "token_uri": ""
        }));

        let FlowStrategy::AuthorizedUser(strategy) = FlowBuilder::default()
            .with_provider_fallback(Provider::GitLab)
            .build(&doc, &CredentialsParams::default())
        else {
            panic!("expected the refresh flow");
        };
        assert_eq!(strategy.endpoint(), Provider::GitLab.endpoint());
    }

    #[test]
    fn should_prefer_document_urls_over_registry() {
        let doc = document(&json!({
            "type": "authorized_user",
            "client_id": "id",
            "client_secret": "secret",
            "refresh_token": "r",
            "token_uri": "https://idp.example.com/token"
        }));

        let FlowStrategy::AuthorizedUser(strategy) =
            FlowBuilder::default().build(&doc, &CredentialsParams::default())
        else {
            panic!("expected the refresh flow");
        };
        let endpoint = strategy.endpoint();
        assert_eq!(endpoint.token_url, "https://idp.example.com/token");
        assert_eq!(endpoint.auth_url, Provider::Google.endpoint().auth_url);
        assert_eq!(endpoint.auth_style, AuthStyle::InParams);
    }

    #[tokio::test]
    async fn should_fail_with_missing_endpoint_without_fallback() {
        let doc = document(&json!({
            "type": "authorized_user",
            "client_id": "id",
            "client_secret": "secret",
            "refresh_token": "r"
        }));

        let strategy = FlowBuilder::default()
            .without_provider_fallback()
            .build(&doc, &CredentialsParams::default());

        let FlowStrategy::AuthorizedUser(refresh) = &strategy else {
            panic!("expected the refresh flow");
        };
        assert!(refresh.endpoint().token_url.is_empty());
        assert!(refresh.endpoint().auth_url.is_empty());

        let result = strategy.fetch_token(&FetchContext::background()).await;
        assert_eq!(
            result,
            Err(TokenError::MissingEndpoint {
                flow: Flow::AuthorizedUser
            })
        );
    }

    #[test]
    fn should_build_external_account() {
        let doc = document(&json!({
            "type": "external_account",
            "audience": "aud",
            "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
            "token_url": "https://sts.example.com/v1/token",
            "credential_source": {"file": "/tmp/token"}
        }));

        let strategy = FlowBuilder::default().build(&doc, &CredentialsParams::new(["a", "b"]));
        assert_eq!(strategy.flow(), Flow::ExternalAccount);
    }

    #[tokio::test]
    async fn should_report_unwired_collaborator() {
        let doc = document(&json!({
            "type": "service_account",
            "client_email": "sa@p.iam.gserviceaccount.com",
            "private_key": "pem"
        }));

        let source = FlowBuilder::default().build_cached(&doc, &CredentialsParams::default());
        let err = source.token().await.expect_err("nothing wired");
        insta::assert_snapshot!(err, @"service_account: configuration error: no JWT redeemer configured");
    }

    #[test]
    fn should_not_leak_collaborators_in_debug() {
        let debug_str = format!("{:?}", FlowBuilder::default());
        assert_eq!(debug_str, "FlowBuilder { provider: Some(Google), .. }");
    }
}
