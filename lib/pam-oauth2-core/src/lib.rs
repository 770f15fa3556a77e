//! # PAM OAuth2 Core
//!
//! Credential resolution and cached OAuth2 token sources for a PAM
//! authentication helper.
//!
//! The crate turns a credentials document into a token source:
//!
//! - **[`CredentialsDocument`]** - classifies the JSON document an administrator
//!   configured (`service_account`, `authorized_user` or `external_account`)
//! - **[`FlowBuilder`]** - wires the document to its authentication flow
//! - **[`CachedTokenSource`]** - reuses a token until shortly before it expires,
//!   with at most one fetch in flight
//!
//! Tokens from the instance-metadata server of a compute environment are
//! available through [`compute_token_source`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pam_oauth2_core::{CredentialsDocument, CredentialsParams, FetchContext, FlowBuilder};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let raw = std::fs::read("/etc/security/pam_oauth2.json")?;
//! let document = CredentialsDocument::from_json(&raw)?;
//!
//! let source = FlowBuilder::with_http_defaults()?
//!     .build_cached(&document, &CredentialsParams::new(["openid", "email"]));
//!
//! // PAM conversations have a time budget
//! let ctx = FetchContext::background().with_timeout(Duration::from_secs(10));
//! let token = source.token_with(&ctx).await?;
//! println!("Authorization: {}", token.authorization_value());
//! # Ok(())
//! # }
//! ```
//!
//! ## Metadata server
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pam_oauth2_core::{DEFAULT_ACCOUNT, HttpMetadataClient, SysfsPlatformProbe, compute_token_source};
//!
//! # async fn example() -> Result<(), pam_oauth2_core::TokenError> {
//! let source = compute_token_source(
//!     DEFAULT_ACCOUNT,
//!     &[],
//!     Arc::new(SysfsPlatformProbe::default()),
//!     Arc::new(HttpMetadataClient::from_env()?),
//! );
//! let token = source.token().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! Every operation returns [`TokenError`]. Errors name the [`Flow`] and, for
//! network failures, the [`Hop`] that failed. [`TokenError::is_retryable`]
//! separates transient failures from terminal ones.
//!
//! ## Logging
//!
//! The crate logs through [`tracing`]; install a subscriber to see fetches,
//! failures and deprecation warnings. Secrets never appear in logs or in
//! `Debug` output.

mod cache;
mod context;
mod credentials;
mod endpoint;
mod error;
mod flow;
mod secret;
mod token;

pub use self::cache::CachedTokenSource;
pub use self::context::{BoxFuture, FetchContext};
pub use self::credentials::{
    CredentialsDocument, ExternalAccount, JWT_TOKEN_URL, JwtConfig, ParsePolicy,
    ServiceAccountKey, UserCredentials,
};
pub use self::endpoint::{AuthStyle, Endpoint, Provider, UnknownProvider};
pub use self::error::{CancelCause, Flow, Hop, TokenError};
pub use self::flow::{
    CredentialSourceSupplier, CredentialsParams, DEFAULT_ACCOUNT, DeprecationNotice,
    ExchangeRequest, ExternalAccountStrategy, FetchStrategy, FlowBuilder, FlowStrategy,
    HttpJwtRedeemer, HttpMetadataClient, HttpTokenExchanger, ImpersonationRequest, JwtRedeemer,
    MetadataClient, MetadataStrategy, OAuth2TokenEndpoint, PlatformProbe, RefreshRequest,
    RefreshTokenStrategy, ServiceAccountStrategy, SubjectTokenSupplier, SysfsPlatformProbe,
    TokenEndpoint, TokenExchanger, compute_token_source, legacy_app_engine_source,
};
pub use self::secret::SecretString;
pub use self::token::{DEFAULT_EXPIRY_SKEW, Token};
