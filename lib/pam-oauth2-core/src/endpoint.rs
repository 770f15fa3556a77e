//! OAuth 2.0 endpoints of the supported identity providers.

use std::fmt;
use std::str::FromStr;

/// How client credentials are presented to the token endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AuthStyle {
    /// Try an HTTP Basic header first, then fall back to form parameters.
    #[default]
    AutoDetect,
    /// `client_id` and `client_secret` sent as form parameters.
    InParams,
    /// `client_id` and `client_secret` sent as an HTTP Basic header.
    InHeader,
}

/// Authorization and token URLs of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Endpoint {
    /// Authorization endpoint (browser flows only).
    pub auth_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// Client authentication style.
    pub auth_style: AuthStyle,
}

macro_rules! providers {
    ($( $variant:ident => $name:literal, $doc:literal, $auth:literal, $token:literal, $style:ident; )*) => {
        /// An identity provider with a well-known endpoint.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Provider {
            $(
                #[doc = $doc]
                $variant,
            )*
        }

        impl Provider {
            /// Every provider in the registry.
            pub const ALL: &'static [Provider] = &[$(Provider::$variant),*];

            /// Stable identifier, as accepted by [`FromStr`].
            pub fn id(self) -> &'static str {
                match self {
                    $(Provider::$variant => $name,)*
                }
            }

            /// Returns the provider's endpoint.
            pub fn endpoint(self) -> &'static Endpoint {
                match self {
                    $(Provider::$variant => {
                        static ENDPOINT: std::sync::LazyLock<Endpoint> = std::sync::LazyLock::new(|| Endpoint {
                            auth_url: $auth.to_string(),
                            token_url: $token.to_string(),
                            auth_style: AuthStyle::$style,
                        });
                        &ENDPOINT
                    })*
                }
            }
        }
    };
}

providers! {
    Google => "google", "Google accounts.", "https://accounts.google.com/o/oauth2/auth", "https://oauth2.googleapis.com/token", InParams;
    GitHub => "github", "GitHub.", "https://github.com/login/oauth/authorize", "https://github.com/login/oauth/access_token", AutoDetect;
    GitLab => "gitlab", "GitLab.com.", "https://gitlab.com/oauth/authorize", "https://gitlab.com/oauth/token", AutoDetect;
    Facebook => "facebook", "Facebook Graph API v3.2.", "https://www.facebook.com/v3.2/dialog/oauth", "https://graph.facebook.com/v3.2/oauth/access_token", AutoDetect;
    Heroku => "heroku", "Heroku.", "https://id.heroku.com/oauth/authorize", "https://id.heroku.com/oauth/token", AutoDetect;
    Kakao => "kakao", "Kakao.", "https://kauth.kakao.com/oauth/authorize", "https://kauth.kakao.com/oauth/token", AutoDetect;
    LinkedIn => "linkedin", "LinkedIn.", "https://www.linkedin.com/oauth/v2/authorization", "https://www.linkedin.com/oauth/v2/accessToken", InParams;
    Mailchimp => "mailchimp", "Mailchimp.", "https://login.mailchimp.com/oauth2/authorize", "https://login.mailchimp.com/oauth2/token", AutoDetect;
    MediaMath => "mediamath", "MediaMath production.", "https://api.mediamath.com/oauth2/v1.0/authorize", "https://api.mediamath.com/oauth2/v1.0/token", AutoDetect;
    MediaMathSandbox => "mediamath-sandbox", "MediaMath sandbox.", "https://t1sandbox.mediamath.com/oauth2/v1.0/authorize", "https://t1sandbox.mediamath.com/oauth2/v1.0/token", AutoDetect;
    Slack => "slack", "Slack.", "https://slack.com/oauth/authorize", "https://slack.com/api/oauth.access", AutoDetect;
    Spotify => "spotify", "Spotify.", "https://accounts.spotify.com/authorize", "https://accounts.spotify.com/api/token", AutoDetect;
    StackOverflow => "stackoverflow", "Stack Overflow.", "https://stackoverflow.com/oauth", "https://stackoverflow.com/oauth/access_token", AutoDetect;
    Twitch => "twitch", "Twitch.", "https://id.twitch.tv/oauth2/authorize", "https://id.twitch.tv/oauth2/token", AutoDetect;
    Vk => "vk", "VK.", "https://oauth.vk.com/authorize", "https://oauth.vk.com/access_token", AutoDetect;
    Yandex => "yandex", "Yandex.", "https://oauth.yandex.com/authorize", "https://oauth.yandex.com/token", AutoDetect;
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// The identifier did not match any registered provider.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Error, derive_more::Display)]
#[display("unknown identity provider '{name}'")]
pub struct UnknownProvider {
    /// The identifier that was looked up.
    pub name: String,
}

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|provider| provider.id().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownProvider {
                name: value.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_expose_google_endpoint() {
        let endpoint = Provider::Google.endpoint();
        assert_eq!(endpoint.auth_url, "https://accounts.google.com/o/oauth2/auth");
        assert_eq!(endpoint.token_url, "https://oauth2.googleapis.com/token");
        assert_eq!(endpoint.auth_style, AuthStyle::InParams);
    }

    #[test]
    fn should_default_to_auto_detect() {
        assert_eq!(Provider::GitHub.endpoint().auth_style, AuthStyle::AutoDetect);
        assert_eq!(Provider::LinkedIn.endpoint().auth_style, AuthStyle::InParams);
    }

    #[test]
    fn should_parse_provider_ids_case_insensitively() {
        assert_eq!("GitHub".parse::<Provider>(), Ok(Provider::GitHub));
        assert_eq!(
            " mediamath-sandbox ".parse::<Provider>(),
            Ok(Provider::MediaMathSandbox)
        );
    }

    #[test]
    fn should_reject_unknown_provider() {
        let err = "myspace".parse::<Provider>().expect_err("not registered");
        insta::assert_snapshot!(err, @"unknown identity provider 'myspace'");
    }

    #[test]
    fn should_round_trip_every_identifier() {
        for provider in Provider::ALL {
            assert_eq!(provider.to_string().parse::<Provider>(), Ok(*provider));
            assert!(provider.endpoint().token_url.starts_with("https://"));
        }
    }
}
