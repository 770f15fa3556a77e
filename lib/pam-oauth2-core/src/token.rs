//! Access tokens and the validity rule used by the cache.

use std::fmt;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// How long before its expiry a token stops being considered valid.
///
/// Absorbs clock skew and the latency of the request that will carry it.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(10);

/// An OAuth2 access token.
///
/// Tokens are immutable once issued: every `with_*` method consumes the value
/// and is meant for the flow that builds it.
#[derive(Clone, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct Token {
    access_token: String,
    token_type: String,
    refresh_token: Option<String>,
    #[zeroize(skip)]
    expiry: Option<Instant>,
    #[zeroize(skip)]
    extra: Map<String, Value>,
}

impl Token {
    /// Creates a token without expiry.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: String::new(),
            refresh_token: None,
            expiry: None,
            extra: Map::new(),
        }
    }

    /// Sets the token type as returned by the server.
    #[must_use]
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// Sets the refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Sets an absolute expiry.
    #[must_use]
    pub fn with_expiry(mut self, expiry: Instant) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Sets the expiry relative to now.
    #[must_use]
    pub fn with_expires_in(self, expires_in: Duration) -> Self {
        self.with_expiry(Instant::now() + expires_in)
    }

    /// Merges provenance or provider specific fields into `extra`.
    #[must_use]
    pub fn with_extra(mut self, extra: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.extra.extend(extra);
        self
    }

    /// Returns the access token value.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Returns the refresh token if available.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Returns the expiry, `None` meaning the token never expires.
    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    /// Returns the token type to use in an `Authorization` header.
    ///
    /// Servers send the type in any case, or not at all; an empty type means
    /// `Bearer`.
    pub fn token_type(&self) -> &str {
        if self.token_type.is_empty() || self.token_type.eq_ignore_ascii_case("bearer") {
            "Bearer"
        } else if self.token_type.eq_ignore_ascii_case("mac") {
            "MAC"
        } else if self.token_type.eq_ignore_ascii_case("basic") {
            "Basic"
        } else {
            &self.token_type
        }
    }

    /// Renders the `Authorization` header value, e.g. `Bearer ya29...`.
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.token_type(), self.access_token)
    }

    /// Looks up a field in `extra`.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Returns all extra fields.
    pub fn extras(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Checks validity with the default skew.
    pub fn is_valid(&self) -> bool {
        self.is_valid_with_skew(DEFAULT_EXPIRY_SKEW)
    }

    /// Checks validity: a non-empty access token that either never expires or
    /// expires strictly after `now + skew`.
    pub fn is_valid_with_skew(&self, skew: Duration) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expiry {
            None => true,
            Some(expiry) => expiry
                .checked_sub(skew)
                .is_some_and(|threshold| threshold > Instant::now()),
        }
    }

    /// Returns the time left before expiry, if known and not yet reached.
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expiry
            .and_then(|expiry| expiry.checked_duration_since(Instant::now()))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type())
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expiry", &self.expiry)
            .field("extra", &self.extra)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn should_create_token() {
        let token = Token::new("access-token-123");
        assert_eq!(token.access_token(), "access-token-123");
        assert!(token.refresh_token().is_none());
        assert!(token.expiry().is_none());
        assert!(token.is_valid());
    }

    #[test]
    fn should_treat_empty_access_token_as_invalid() {
        assert!(!Token::new("").is_valid());
    }

    #[test]
    fn should_apply_expiry_skew() {
        // expires in 5s, inside the 10s skew window
        let token = Token::new("token").with_expires_in(Duration::from_secs(5));
        assert!(!token.is_valid());
        assert!(token.is_valid_with_skew(Duration::from_secs(1)));

        let token = Token::new("token").with_expires_in(Duration::from_secs(60));
        assert!(token.is_valid());
    }

    #[test]
    fn should_detect_expired_token() {
        let token = Token::new("token").with_expires_in(Duration::ZERO);
        assert!(!token.is_valid_with_skew(Duration::ZERO));
        assert!(token.time_until_expiry().is_none());
    }

    #[test]
    fn should_normalize_token_type() {
        assert_eq!(Token::new("a").token_type(), "Bearer");
        assert_eq!(Token::new("a").with_token_type("bearer").token_type(), "Bearer");
        assert_eq!(Token::new("a").with_token_type("mac").token_type(), "MAC");
        assert_eq!(Token::new("a").with_token_type("DPoP").token_type(), "DPoP");
    }

    #[test]
    fn should_render_authorization_value() {
        let token = Token::new("ya29.abc").with_token_type("bearer");
        assert_eq!(token.authorization_value(), "Bearer ya29.abc");
    }

    #[test]
    fn should_merge_extra_fields() {
        let token = Token::new("a")
            .with_extra([("source".to_string(), json!("compute-metadata"))])
            .with_extra([("account".to_string(), json!("default"))]);

        assert_eq!(token.extra("source"), Some(&json!("compute-metadata")));
        assert_eq!(token.extra("account"), Some(&json!("default")));
        assert_eq!(token.extras().len(), 2);
    }

    #[test]
    fn should_redact_debug_output() {
        let token = Token::new("secret-token").with_refresh_token("secret-refresh");
        let debug_str = format!("{token:?}");
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret-token"));
        assert!(!debug_str.contains("secret-refresh"));
    }
}
