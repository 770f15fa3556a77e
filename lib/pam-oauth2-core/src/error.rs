//! Error taxonomy shared by the parser, the flows and the token cache.

/// The authentication flow an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Flow {
    /// JWT bearer grant signed with a service-account key.
    #[display("service_account")]
    ServiceAccount,
    /// Refresh-token grant for user credentials.
    #[display("authorized_user")]
    AuthorizedUser,
    /// Subject-token exchange for workload identity federation.
    #[display("external_account")]
    ExternalAccount,
    /// Token read from the local instance-metadata server.
    #[display("compute_metadata")]
    ComputeMetadata,
}

/// The network hop of a flow that failed.
///
/// Most flows have a single hop; the external-account flow has up to three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Hop {
    /// Redemption of a grant at the token endpoint.
    #[display("token endpoint")]
    TokenEndpoint,
    /// Retrieval of the subject token from the credential source.
    #[display("subject token")]
    SubjectToken,
    /// RFC 8693 token exchange.
    #[display("token exchange")]
    Exchange,
    /// Service-account impersonation after the exchange.
    #[display("impersonation")]
    Impersonation,
    /// Request to the instance-metadata server.
    #[display("metadata server")]
    Metadata,
}

/// Why a fetch was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CancelCause {
    /// The caller cancelled the fetch context.
    #[display("cancelled by caller")]
    Cancelled,
    /// The fetch context deadline elapsed.
    #[display("deadline exceeded")]
    DeadlineExceeded,
}

/// Errors that can occur while resolving credentials or acquiring a token.
///
/// The type is `Clone` so a single failed refresh can be reported to every
/// caller that waited on it.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Error, derive_more::Display)]
pub enum TokenError {
    /// The credentials document is not valid JSON or has ill-typed fields.
    #[display("malformed credentials document: {reason}")]
    Parse {
        /// Decoder message.
        reason: String,
    },

    /// The `type` field is absent or names no supported flow.
    #[display("unknown credential type: {}", found.as_deref().map_or_else(|| "missing 'type' field".to_string(), |found| format!("{found:?}")))]
    UnknownCredentialType {
        /// The value found in the document, if any.
        found: Option<String>,
    },

    /// A well-formed document lacks a field its flow requires.
    #[display("incomplete {kind} credentials: '{field}' is required")]
    IncompleteCredentials {
        /// Flow selected by the document type.
        kind: Flow,
        /// Name of the missing JSON field.
        field: &'static str,
    },

    /// No token URL could be determined for a refresh flow.
    #[display("{flow}: no token endpoint configured and no provider fallback available")]
    MissingEndpoint {
        /// Flow that needed the endpoint.
        flow: Flow,
    },

    /// The metadata flow was used outside a compute environment.
    #[display("can't get a token from the metadata service: not running on the platform")]
    NotOnPlatform,

    /// The server answered but the token is unusable.
    #[display("{flow}: incomplete token received from {hop}: {reason}")]
    IncompleteToken {
        /// Flow that received the token.
        flow: Flow,
        /// Hop that produced it.
        hop: Hop,
        /// What was missing.
        reason: String,
    },

    /// The server response could not be decoded.
    #[display("{flow}: invalid response from {hop}: {reason}")]
    InvalidResponse {
        /// Flow that received the response.
        flow: Flow,
        /// Hop that produced it.
        hop: Hop,
        /// Decoder message.
        reason: String,
    },

    /// The server refused the grant (bad key, revoked token, wrong audience...).
    #[display("{flow}: {hop} rejected the request{}: {reason}", status.map(|status| format!(" with status {status}")).unwrap_or_default())]
    Rejected {
        /// Flow that issued the request.
        flow: Flow,
        /// Hop that rejected it.
        hop: Hop,
        /// HTTP status, when known.
        status: Option<u16>,
        /// Server supplied error description.
        reason: String,
    },

    /// The request did not complete at the network level.
    #[display("{flow}: network error during {hop}: {reason}")]
    Transport {
        /// Flow that issued the request.
        flow: Flow,
        /// Hop that failed.
        hop: Hop,
        /// Underlying client error.
        reason: String,
    },

    /// The credentials are well-formed but unusable as configured.
    #[display("{flow}: configuration error: {reason}")]
    Configuration {
        /// Flow being configured.
        flow: Flow,
        /// Description of the problem.
        reason: String,
    },

    /// The fetch was abandoned before completion.
    #[display("token fetch abandoned: {cause}")]
    Cancelled {
        /// Cancellation or deadline.
        cause: CancelCause,
    },
}

impl TokenError {
    /// Returns `true` when retrying the same request may succeed.
    ///
    /// Parse, classification and configuration failures are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Cancelled { .. })
    }

    pub(crate) fn transport(flow: Flow, hop: Hop, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            flow,
            hop,
            reason: err.to_string(),
        }
    }

    pub(crate) fn invalid_response(flow: Flow, hop: Hop, err: impl std::fmt::Display) -> Self {
        Self::InvalidResponse {
            flow,
            hop,
            reason: err.to_string(),
        }
    }

    pub(crate) fn configuration(flow: Flow, reason: impl Into<String>) -> Self {
        Self::Configuration {
            flow,
            reason: reason.into(),
        }
    }
}
