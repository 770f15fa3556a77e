//! Request and response plumbing shared by the HTTP collaborators.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Flow, Hop, TokenError};
use crate::token::Token;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const MAX_REASON_LEN: usize = 256;

/// Builds the client used by the default collaborators. Redirects are not
/// followed: a token endpoint that redirects is misconfigured.
pub(crate) fn client(flow: Flow) -> Result<reqwest::Client, TokenError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|err| TokenError::configuration(flow, format!("cannot build HTTP client: {err}")))
}

/// Attaches `form` as an `application/x-www-form-urlencoded` body.
pub(crate) fn with_form<T: Serialize + ?Sized>(
    builder: RequestBuilder,
    form: &T,
    flow: Flow,
    hop: Hop,
) -> Result<RequestBuilder, TokenError> {
    let body = serde_urlencoded::to_string(form).map_err(|err| {
        TokenError::configuration(flow, format!("cannot encode {hop} request: {err}"))
    })?;
    Ok(builder.header(CONTENT_TYPE, FORM_CONTENT_TYPE).body(body))
}

/// Sends the request and returns the body of a successful response.
///
/// Server errors and throttling are reported as [`TokenError::Transport`],
/// other failures as [`TokenError::Rejected`].
pub(crate) async fn execute(
    builder: RequestBuilder,
    flow: Flow,
    hop: Hop,
) -> Result<String, TokenError> {
    let response = builder
        .send()
        .await
        .map_err(|err| TokenError::transport(flow, hop, err))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| TokenError::transport(flow, hop, err))?;

    if status.is_success() {
        return Ok(body);
    }
    Err(status_error(flow, hop, status, &body))
}

fn status_error(flow: Flow, hop: Hop, status: StatusCode, body: &str) -> TokenError {
    let reason = error_reason(body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TokenError::Transport {
            flow,
            hop,
            reason: format!("status {}: {reason}", status.as_u16()),
        }
    } else {
        TokenError::Rejected {
            flow,
            hop,
            status: Some(status.as_u16()),
            reason,
        }
    }
}

/// Extracts a readable reason from an error body.
///
/// Understands the RFC 6749 `{"error", "error_description"}` shape and the
/// Google API `{"error": {"message"}}` shape; anything else is truncated.
pub(crate) fn error_reason(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        match (&value["error"], value["error_description"].as_str()) {
            (Value::String(code), Some(description)) => return format!("{code}: {description}"),
            (Value::String(code), None) => return code.clone(),
            (Value::Object(details), _) => {
                if let Some(message) = details.get("message").and_then(Value::as_str) {
                    return message.to_string();
                }
            }
            _ => {}
        }
    }

    let body = body.trim();
    if body.is_empty() {
        return "empty response body".to_string();
    }
    if body.chars().nth(MAX_REASON_LEN).is_some() {
        let truncated: String = body.chars().take(MAX_REASON_LEN).collect();
        format!("{truncated}...")
    } else {
        body.to_string()
    }
}

/// RFC 6749 section 5.1 access token response.
#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Some providers send `expires_in` as a string.
pub(crate) fn lenient_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
    }

    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Number(seconds)) => Ok(Some(seconds)),
        Some(Seconds::Text(text)) if text.is_empty() => Ok(None),
        Some(Seconds::Text(text)) => text.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Decodes a token response. A missing or zero `expires_in` means no expiry.
pub(crate) fn parse_token(body: &str, flow: Flow, hop: Hop) -> Result<Token, TokenError> {
    let response: TokenResponse =
        serde_json::from_str(body).map_err(|err| TokenError::invalid_response(flow, hop, err))?;

    if response.access_token.is_empty() {
        return Err(TokenError::IncompleteToken {
            flow,
            hop,
            reason: "server response missing access_token".to_string(),
        });
    }

    let mut token = Token::new(response.access_token)
        .with_token_type(response.token_type)
        .with_extra(response.extra);
    if let Some(seconds) = response.expires_in.filter(|seconds| *seconds > 0) {
        token = token.with_expires_in(Duration::from_secs(seconds));
    }
    if let Some(refresh_token) = response.refresh_token.filter(|value| !value.is_empty()) {
        token = token.with_refresh_token(refresh_token);
    }
    Ok(token)
}
