//! Classification of credentials documents.
//!
//! A credentials document is the JSON file an administrator points the PAM
//! helper at. Its `type` field selects the authentication flow:
//!
//! | `type`             | variant                                   |
//! |--------------------|-------------------------------------------|
//! | `service_account`  | [`CredentialsDocument::ServiceAccount`]   |
//! | `authorized_user`  | [`CredentialsDocument::UserCredentials`]  |
//! | `external_account` | [`CredentialsDocument::ExternalAccount`]  |
//!
//! Any other value, or no value, is rejected.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Flow, TokenError};
use crate::secret::SecretString;

/// Well-known token URL for the JWT bearer flow.
pub const JWT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const SERVICE_ACCOUNT_KEY: &str = "service_account";
const USER_CREDENTIALS_KEY: &str = "authorized_user";
const EXTERNAL_ACCOUNT_KEY: &str = "external_account";

/// Parser settings that depend on the deployment, not on the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsePolicy {
    /// Accept `authorized_user` documents without `client_id`/`client_secret`.
    ///
    /// Only enable this for providers that register public clients.
    pub allow_public_clients: bool,
}

impl ParsePolicy {
    /// Sets [`ParsePolicy::allow_public_clients`].
    #[must_use]
    pub fn with_public_clients(mut self, allow: bool) -> Self {
        self.allow_public_clients = allow;
        self
    }
}

/// Service-account key.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAccountKey {
    /// Service-account e-mail, the assertion issuer.
    pub client_email: String,
    /// PEM encoded RSA private key.
    pub private_key: SecretString,
    /// Identifier of the key, sent as the JWT `kid`.
    pub private_key_id: String,
    /// Token endpoint, when the key names one.
    pub token_url: Option<String>,
    /// Project the account belongs to.
    pub project_id: Option<String>,
}

/// User refresh-token record.
#[derive(Debug, Clone, PartialEq)]
pub struct UserCredentials {
    /// OAuth client id (may be empty for public clients).
    pub client_id: String,
    /// OAuth client secret (may be empty for public clients).
    pub client_secret: SecretString,
    /// Long-lived refresh token.
    pub refresh_token: SecretString,
    /// Authorization endpoint, when the record names one.
    pub auth_url: Option<String>,
    /// Token endpoint, when the record names one.
    pub token_url: Option<String>,
    /// Project billed for quota.
    pub quota_project_id: Option<String>,
}

/// Workload identity federation configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalAccount {
    /// STS audience, the workload identity provider resource.
    pub audience: String,
    /// Type of the subject token, e.g. `urn:ietf:params:oauth:token-type:jwt`.
    pub subject_token_type: String,
    /// STS token exchange endpoint.
    pub token_url: String,
    /// Token introspection endpoint.
    pub token_info_url: Option<String>,
    /// IAM `generateAccessToken` endpoint for the impersonation hop.
    pub service_account_impersonation_url: Option<String>,
    /// Where the subject token comes from. Kept opaque.
    pub credential_source: Value,
    /// OAuth client id for STS client authentication.
    pub client_id: Option<String>,
    /// OAuth client secret for STS client authentication.
    pub client_secret: Option<SecretString>,
    /// Project billed for quota.
    pub quota_project_id: Option<String>,
}

/// A parsed credentials document, one variant per flow.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialsDocument {
    /// `"type": "service_account"`
    ServiceAccount(ServiceAccountKey),
    /// `"type": "authorized_user"`
    UserCredentials(UserCredentials),
    /// `"type": "external_account"`
    ExternalAccount(ExternalAccount),
}

/// Superset of the fields of every document type.
#[derive(Default, Deserialize)]
#[serde(default)]
struct CredentialsFile {
    // service account
    client_email: String,
    private_key_id: String,
    private_key: SecretString,
    auth_uri: String,
    token_uri: String,
    project_id: String,

    // user credentials
    client_secret: SecretString,
    client_id: String,
    refresh_token: SecretString,

    // external account
    audience: String,
    subject_token_type: String,
    token_url: String,
    token_info_url: String,
    service_account_impersonation_url: String,
    credential_source: Option<Value>,
    quota_project_id: String,
}

impl CredentialsFile {
    /// Decodes the fields of a typed document; `null` reads as absent.
    fn decode(mut fields: serde_json::Map<String, Value>) -> Result<Self, TokenError> {
        fields.retain(|_, value| !value.is_null());
        serde_json::from_value(Value::Object(fields)).map_err(parse_error)
    }
}

fn parse_error(err: serde_json::Error) -> TokenError {
    TokenError::Parse {
        reason: err.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn require(value: &str, kind: Flow, field: &'static str) -> Result<(), TokenError> {
    if value.is_empty() {
        return Err(TokenError::IncompleteCredentials { kind, field });
    }
    Ok(())
}

impl CredentialsDocument {
    /// Parses a document with the default [`ParsePolicy`].
    ///
    /// # Errors
    ///
    /// - [`TokenError::Parse`] if the bytes are not a JSON object of the expected shape
    /// - [`TokenError::UnknownCredentialType`] if `type` is missing or unsupported
    /// - [`TokenError::IncompleteCredentials`] if a required field is empty
    pub fn from_json(raw: &[u8]) -> Result<Self, TokenError> {
        Self::from_json_with(raw, &ParsePolicy::default())
    }

    /// Parses a document with an explicit policy.
    ///
    /// # Errors
    ///
    /// See [`CredentialsDocument::from_json`].
    pub fn from_json_with(raw: &[u8], policy: &ParsePolicy) -> Result<Self, TokenError> {
        let value: Value = serde_json::from_slice(raw).map_err(parse_error)?;
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(TokenError::Parse {
                    reason: format!("expected a JSON object, got {}", json_kind(&other)),
                });
            }
        };

        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(Value::Null) | None => String::new(),
            Some(other) => {
                return Err(TokenError::Parse {
                    reason: format!("'type' must be a string, got {other}"),
                });
            }
        };

        match kind.as_str() {
            SERVICE_ACCOUNT_KEY => Self::service_account(CredentialsFile::decode(fields)?),
            USER_CREDENTIALS_KEY => {
                Self::user_credentials(CredentialsFile::decode(fields)?, policy)
            }
            EXTERNAL_ACCOUNT_KEY => Self::external_account(CredentialsFile::decode(fields)?),
            "" => Err(TokenError::UnknownCredentialType { found: None }),
            other => Err(TokenError::UnknownCredentialType {
                found: Some(other.to_string()),
            }),
        }
    }

    /// The flow this document selects.
    pub fn flow(&self) -> Flow {
        match self {
            Self::ServiceAccount(_) => Flow::ServiceAccount,
            Self::UserCredentials(_) => Flow::AuthorizedUser,
            Self::ExternalAccount(_) => Flow::ExternalAccount,
        }
    }

    fn service_account(file: CredentialsFile) -> Result<Self, TokenError> {
        let kind = Flow::ServiceAccount;
        require(&file.client_email, kind, "client_email")?;
        require(file.private_key.expose(), kind, "private_key")?;

        Ok(Self::ServiceAccount(ServiceAccountKey {
            client_email: file.client_email,
            private_key: file.private_key,
            private_key_id: file.private_key_id,
            token_url: non_empty(file.token_uri),
            project_id: non_empty(file.project_id),
        }))
    }

    fn user_credentials(file: CredentialsFile, policy: &ParsePolicy) -> Result<Self, TokenError> {
        let kind = Flow::AuthorizedUser;
        require(file.refresh_token.expose(), kind, "refresh_token")?;
        if !policy.allow_public_clients {
            require(&file.client_id, kind, "client_id")?;
            require(file.client_secret.expose(), kind, "client_secret")?;
        }

        Ok(Self::UserCredentials(UserCredentials {
            client_id: file.client_id,
            client_secret: file.client_secret,
            refresh_token: file.refresh_token,
            auth_url: non_empty(file.auth_uri),
            token_url: non_empty(file.token_uri),
            quota_project_id: non_empty(file.quota_project_id),
        }))
    }

    fn external_account(file: CredentialsFile) -> Result<Self, TokenError> {
        let kind = Flow::ExternalAccount;
        require(&file.audience, kind, "audience")?;
        require(&file.subject_token_type, kind, "subject_token_type")?;
        require(&file.token_url, kind, "token_url")?;

        let credential_source = match file.credential_source {
            Some(source @ Value::Object(_)) => source,
            Some(Value::Null) | None => {
                return Err(TokenError::IncompleteCredentials {
                    kind,
                    field: "credential_source",
                });
            }
            Some(other) => {
                return Err(TokenError::Parse {
                    reason: format!("'credential_source' must be an object, got {other}"),
                });
            }
        };

        Ok(Self::ExternalAccount(ExternalAccount {
            audience: file.audience,
            subject_token_type: file.subject_token_type,
            token_url: file.token_url,
            token_info_url: non_empty(file.token_info_url),
            service_account_impersonation_url: non_empty(file.service_account_impersonation_url),
            credential_source,
            client_id: non_empty(file.client_id),
            client_secret: (!file.client_secret.is_empty()).then_some(file.client_secret),
            quota_project_id: non_empty(file.quota_project_id),
        }))
    }
}

/// Everything the JWT bearer flow needs from a service-account key.
#[derive(Debug, Clone, PartialEq)]
pub struct JwtConfig {
    /// Assertion issuer.
    pub email: String,
    /// PEM encoded RSA private key.
    pub private_key: SecretString,
    /// JWT `kid` header.
    pub private_key_id: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Token endpoint; defaults to [`JWT_TOKEN_URL`].
    pub token_url: String,
    /// User to impersonate, sent as the `sub` claim.
    pub subject: Option<String>,
}

impl JwtConfig {
    /// Builds the configuration from a parsed key.
    pub fn from_key(key: &ServiceAccountKey, scopes: &[String], subject: Option<&str>) -> Self {
        Self {
            email: key.client_email.clone(),
            private_key: key.private_key.clone(),
            private_key_id: key.private_key_id.clone(),
            scopes: scopes.to_vec(),
            token_url: key
                .token_url
                .clone()
                .unwrap_or_else(|| JWT_TOKEN_URL.to_string()),
            subject: subject.map(ToString::to_string),
        }
    }

    /// Reads a service-account key file.
    ///
    /// # Errors
    ///
    /// Fails like [`CredentialsDocument::from_json`], and with
    /// [`TokenError::UnknownCredentialType`] if the document is valid but not a
    /// service-account key.
    pub fn from_json(raw: &[u8], scopes: &[String]) -> Result<Self, TokenError> {
        match CredentialsDocument::from_json(raw)? {
            CredentialsDocument::ServiceAccount(key) => Ok(Self::from_key(&key, scopes, None)),
            other => Err(TokenError::UnknownCredentialType {
                found: Some(format!("{} (expected {SERVICE_ACCOUNT_KEY})", other.flow())),
            }),
        }
    }
}
