//! Tokens from the instance-metadata server of a compute environment.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::FetchStrategy;
use super::http;
use crate::cache::CachedTokenSource;
use crate::context::{BoxFuture, FetchContext};
use crate::error::{Flow, Hop, TokenError};
use crate::token::Token;

const FLOW: Flow = Flow::ComputeMetadata;

/// Account selector for the instance's default service account.
pub const DEFAULT_ACCOUNT: &str = "default";

const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";
const DEFAULT_METADATA_HOST: &str = "169.254.169.254";
const PRODUCT_NAME_PATH: &str = "/sys/class/dmi/id/product_name";

/// Tells whether the process runs on a compute instance.
///
/// Must be fast and must not touch the network.
pub trait PlatformProbe: Send + Sync {
    /// Returns `true` on a compute instance.
    fn on_platform(&self) -> bool;
}

/// Reads paths below `computeMetadata/v1/`.
pub trait MetadataClient: Send + Sync {
    /// Returns the body found at `path`.
    fn get<'a>(&'a self, path: &'a str, ctx: &'a FetchContext) -> BoxFuture<'a, Result<String, TokenError>>;
}

/// Fetch strategy reading service-account tokens from the metadata server.
pub struct MetadataStrategy {
    account: String,
    scopes: Vec<String>,
    probe: Arc<dyn PlatformProbe>,
    client: Arc<dyn MetadataClient>,
}

impl MetadataStrategy {
    /// Creates the strategy. An empty `account` selects [`DEFAULT_ACCOUNT`].
    pub fn new(
        account: impl Into<String>,
        scopes: &[String],
        probe: Arc<dyn PlatformProbe>,
        client: Arc<dyn MetadataClient>,
    ) -> Self {
        let account = account.into();
        Self {
            account: if account.is_empty() {
                DEFAULT_ACCOUNT.to_string()
            } else {
                account
            },
            scopes: scopes.to_vec(),
            probe,
            client,
        }
    }

    /// The account selector.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Path of the token resource, relative to `computeMetadata/v1/`.
    pub fn token_path(&self) -> String {
        let path = format!("instance/service-accounts/{}/token", self.account);
        if self.scopes.is_empty() {
            return path;
        }
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("scopes", &self.scopes.join(","))
            .finish();
        format!("{path}?{query}")
    }
}

impl fmt::Debug for MetadataStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataStrategy")
            .field("account", &self.account)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct MetadataToken {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    token_type: String,
}

impl MetadataStrategy {
    fn decode(&self, body: &str) -> Result<Token, TokenError> {
        let response: MetadataToken = serde_json::from_str(body)
            .map_err(|err| TokenError::invalid_response(FLOW, Hop::Metadata, err))?;

        let missing = if response.access_token.is_empty() {
            Some("access_token")
        } else if response.expires_in == 0 {
            Some("expires_in")
        } else {
            None
        };
        if let Some(field) = missing {
            return Err(TokenError::IncompleteToken {
                flow: FLOW,
                hop: Hop::Metadata,
                reason: format!("metadata server returned no {field}"),
            });
        }

        Ok(Token::new(response.access_token)
            .with_token_type(response.token_type)
            .with_expires_in(Duration::from_secs(response.expires_in))
            .with_extra([
                ("source".to_string(), Value::from("compute-metadata")),
                ("account".to_string(), Value::from(self.account.as_str())),
            ]))
    }
}

impl FetchStrategy for MetadataStrategy {
    fn flow(&self) -> Flow {
        FLOW
    }

    fn issuing_hop(&self) -> Hop {
        Hop::Metadata
    }

    fn fetch_token<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async move {
            if !self.probe.on_platform() {
                return Err(TokenError::NotOnPlatform);
            }

            let path = self.token_path();
            debug!(account = %self.account, "reading token from metadata server");
            let body = ctx.run(self.client.get(&path, ctx)).await?;
            self.decode(&body)
        })
    }
}

/// A cached metadata token source.
pub fn compute_token_source(
    account: impl Into<String>,
    scopes: &[String],
    probe: Arc<dyn PlatformProbe>,
    client: Arc<dyn MetadataClient>,
) -> CachedTokenSource<MetadataStrategy> {
    CachedTokenSource::new(MetadataStrategy::new(account, scopes, probe, client))
}

/// Guard making a deprecation warning appear once per process.
///
/// Create one at startup and pass it to every call that may warn.
#[derive(Debug, Default)]
pub struct DeprecationNotice {
    emitted: OnceLock<()>,
}

impl DeprecationNotice {
    /// Creates a guard that has not fired yet.
    pub const fn new() -> Self {
        Self {
            emitted: OnceLock::new(),
        }
    }

    /// Logs `message` unless this guard already fired. Returns `true` if it logged.
    pub fn emit(&self, message: &str) -> bool {
        let first = self.emitted.set(()).is_ok();
        if first {
            warn!("{message}");
        }
        first
    }

    /// Returns `true` once the warning was logged.
    pub fn has_emitted(&self) -> bool {
        self.emitted.get().is_some()
    }
}

/// Token source for the legacy App Engine environment.
///
/// Second-generation runtimes serve tokens from the metadata server, so this
/// is a default-account [`compute_token_source`] plus a one-time warning.
pub fn legacy_app_engine_source(
    notice: &DeprecationNotice,
    scopes: &[String],
    probe: Arc<dyn PlatformProbe>,
    client: Arc<dyn MetadataClient>,
) -> CachedTokenSource<MetadataStrategy> {
    notice.emit(
        "the App Engine token source is deprecated, use the compute metadata token source instead",
    );
    compute_token_source(DEFAULT_ACCOUNT, scopes, probe, client)
}

/// [`PlatformProbe`] based on the environment and the DMI product name.
#[derive(Debug, Clone)]
pub struct SysfsPlatformProbe {
    metadata_host: Option<String>,
    product_name_path: PathBuf,
}

impl Default for SysfsPlatformProbe {
    fn default() -> Self {
        Self {
            metadata_host: std::env::var(METADATA_HOST_ENV)
                .ok()
                .filter(|host| !host.is_empty()),
            product_name_path: PathBuf::from(PRODUCT_NAME_PATH),
        }
    }
}

impl PlatformProbe for SysfsPlatformProbe {
    fn on_platform(&self) -> bool {
        if self.metadata_host.is_some() {
            return true;
        }
        std::fs::read_to_string(&self.product_name_path)
            .is_ok_and(|name| name.trim().starts_with("Google"))
    }
}

/// [`MetadataClient`] over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetadataClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpMetadataClient {
    /// Targets `GCE_METADATA_HOST`, or the link-local metadata address.
    pub fn new(http: reqwest::Client) -> Self {
        let host = std::env::var(METADATA_HOST_ENV)
            .ok()
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
        Self::with_base_url(http, format!("http://{host}"))
    }

    /// Builds a client with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be initialised.
    pub fn from_env() -> Result<Self, TokenError> {
        Ok(Self::new(http::client(FLOW)?))
    }

    /// Targets an explicit server, e.g. `http://127.0.0.1:8080`.
    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

impl MetadataClient for HttpMetadataClient {
    fn get<'a>(&'a self, path: &'a str, _ctx: &'a FetchContext) -> BoxFuture<'a, Result<String, TokenError>> {
        Box::pin(async move {
            let url = format!(
                "{}/computeMetadata/v1/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            );
            let builder = self.http.get(url).header("Metadata-Flavor", "Google");
            http::execute(builder, FLOW, Hop::Metadata).await
        })
    }
}
