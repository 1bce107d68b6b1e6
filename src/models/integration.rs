//! Domain types for a tenant's Bling connection.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, Serializer};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::IntegrationError;

/// Placeholder shown wherever a client secret would otherwise be displayed.
pub const REDACTED_SECRET: &str = "********";

/// Bling environment a tenant's credentials belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Sandbox,
    #[default]
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = IntegrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(Environment::Sandbox),
            "production" => Ok(Environment::Production),
            other => Err(IntegrationError::ConfigInvalid(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

/// Write-only OAuth client secret. Never printed or serialized in clear.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientSecret(String);

impl ClientSecret {
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Self(secret.into())
    }

    /// Plaintext for the token endpoint and for sealing. Do not log.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSecret({})", REDACTED_SECRET)
    }
}

impl Serialize for ClientSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED_SECRET)
    }
}

macro_rules! opaque_token {
    ($name:ident) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(String);

        impl $name {
            pub fn new<S: Into<String>>(value: S) -> Self {
                Self(value.into())
            }

            pub fn expose(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), REDACTED_SECRET)
            }
        }
    };
}

opaque_token!(AccessToken);
opaque_token!(RefreshToken);

/// Stored OAuth client registration for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ConnectionConfig {
    pub tenant_id: Uuid,
    pub client_id: String,
    /// Always rendered as `********`
    #[schema(value_type = String, example = "********")]
    pub client_secret: ClientSecret,
    pub redirect_uri: String,
    pub environment: Environment,
    pub updated_at: DateTime<Utc>,
}

/// Settings form payload for saving a connection config.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ConnectionConfigInput {
    pub client_id: String,
    /// Required on first save; omit (or send blank) to keep the stored secret
    #[serde(default)]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    #[serde(default)]
    pub environment: Environment,
}

impl ConnectionConfigInput {
    /// Trims fields and checks they are usable; blank secrets count as omitted.
    pub fn normalized(self) -> Result<Self, IntegrationError> {
        let client_id = self.client_id.trim().to_string();
        if client_id.is_empty() {
            return Err(IntegrationError::ConfigInvalid(
                "client_id must not be empty".to_string(),
            ));
        }

        let redirect_uri = self.redirect_uri.trim().to_string();
        if redirect_uri.is_empty() {
            return Err(IntegrationError::ConfigInvalid(
                "redirect_uri must not be empty".to_string(),
            ));
        }
        match url::Url::parse(&redirect_uri) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {}
            _ => {
                return Err(IntegrationError::ConfigInvalid(
                    "redirect_uri must be an absolute http(s) URL".to_string(),
                ));
            }
        }

        let client_secret = self
            .client_secret
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            client_id,
            client_secret,
            redirect_uri,
            environment: self.environment,
        })
    }
}

/// Tokens currently held for a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState {
    pub tenant_id: Uuid,
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub expires_at: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl TokenState {
    /// Recomputed against `now` on every call.
    pub fn is_connected(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// True when the access token outlives `now + margin`.
    pub fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at > now + margin
    }
}

/// Outstanding authorize redirect awaiting its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub tenant_id: Uuid,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthorization {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Derived connection phase; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Unconfigured,
    Connecting,
    Connected,
    Refreshing,
    Disconnected,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Unconfigured => "unconfigured",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Refreshing => "refreshing",
            ConnectionPhase::Disconnected => "disconnected",
        }
    }

    /// Derives the phase from what is stored for a tenant at `now`.
    pub fn derive(
        configured: bool,
        tokens: Option<&TokenState>,
        pending_authorization: bool,
        refreshing: bool,
        now: DateTime<Utc>,
    ) -> Self {
        if !configured {
            return ConnectionPhase::Unconfigured;
        }
        if refreshing {
            return ConnectionPhase::Refreshing;
        }
        match tokens {
            Some(tokens) if tokens.is_connected(now) => ConnectionPhase::Connected,
            Some(_) => ConnectionPhase::Disconnected,
            None if pending_authorization => ConnectionPhase::Connecting,
            None => ConnectionPhase::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status as shown on the settings page.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConnectionStatus {
    pub tenant_id: Uuid,
    pub phase: ConnectionPhase,
    pub is_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_at: DateTime<Utc>) -> TokenState {
        TokenState {
            tenant_id: Uuid::new_v4(),
            access_token: AccessToken::new("at"),
            refresh_token: RefreshToken::new("rt"),
            expires_at,
            last_sync: None,
        }
    }

    #[test]
    fn test_secrets_are_redacted() {
        let secret = ClientSecret::new("super-secret");
        assert_eq!(format!("{:?}", secret), "ClientSecret(********)");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"********\"");
        assert_eq!(secret.expose(), "super-secret");

        let token = AccessToken::new("at-123");
        assert!(!format!("{:?}", token).contains("at-123"));
        let token = RefreshToken::new("rt-123");
        assert!(!format!("{:?}", token).contains("rt-123"));
    }

    #[test]
    fn test_config_serialization_hides_secret() {
        let config = ConnectionConfig {
            tenant_id: Uuid::new_v4(),
            client_id: "client".to_string(),
            client_secret: ClientSecret::new("hunter2"),
            redirect_uri: "https://vng.example.com/callback".to_string(),
            environment: Environment::Sandbox,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["client_secret"], REDACTED_SECRET);
        assert_eq!(json["environment"], "sandbox");
        assert!(!json.to_string().contains("hunter2"));
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("sandbox".parse::<Environment>().unwrap(), Environment::Sandbox);
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert!("staging".parse::<Environment>().is_err());
        assert!(serde_json::from_str::<Environment>("\"staging\"").is_err());
    }

    #[test]
    fn test_input_normalization() {
        let input = ConnectionConfigInput {
            client_id: "  client  ".to_string(),
            client_secret: Some("   ".to_string()),
            redirect_uri: " https://vng.example.com/cb ".to_string(),
            environment: Environment::Production,
        }
        .normalized()
        .unwrap();

        assert_eq!(input.client_id, "client");
        assert_eq!(input.client_secret, None);
        assert_eq!(input.redirect_uri, "https://vng.example.com/cb");
    }

    #[test]
    fn test_input_validation_rejects_bad_fields() {
        let base = ConnectionConfigInput {
            client_id: "client".to_string(),
            client_secret: Some("secret".to_string()),
            redirect_uri: "https://vng.example.com/cb".to_string(),
            environment: Environment::Sandbox,
        };

        let empty_id = ConnectionConfigInput {
            client_id: " ".to_string(),
            ..base.clone()
        };
        assert!(matches!(
            empty_id.normalized(),
            Err(IntegrationError::ConfigInvalid(_))
        ));

        for redirect_uri in ["", "not a url", "ftp://vng.example.com/cb", "mailto:a@b.c"] {
            let input = ConnectionConfigInput {
                redirect_uri: redirect_uri.to_string(),
                ..base.clone()
            };
            assert!(
                matches!(input.normalized(), Err(IntegrationError::ConfigInvalid(_))),
                "{redirect_uri} should be rejected"
            );
        }
    }

    #[test]
    fn test_connected_is_recomputed_against_clock() {
        let now = Utc::now();
        let state = tokens(now + Duration::seconds(30));

        assert!(state.is_connected(now));
        assert!(!state.is_connected(now + Duration::seconds(31)));
        assert!(!state.is_fresh(Duration::seconds(60), now));
        assert!(state.is_fresh(Duration::seconds(10), now));
    }

    #[test]
    fn test_phase_derivation() {
        let now = Utc::now();
        let live = tokens(now + Duration::hours(1));
        let expired = tokens(now - Duration::seconds(1));

        assert_eq!(
            ConnectionPhase::derive(false, Some(&live), true, true, now),
            ConnectionPhase::Unconfigured
        );
        assert_eq!(
            ConnectionPhase::derive(true, None, true, false, now),
            ConnectionPhase::Connecting
        );
        assert_eq!(
            ConnectionPhase::derive(true, Some(&live), false, false, now),
            ConnectionPhase::Connected
        );
        assert_eq!(
            ConnectionPhase::derive(true, Some(&live), false, true, now),
            ConnectionPhase::Refreshing
        );
        assert_eq!(
            ConnectionPhase::derive(true, Some(&expired), false, false, now),
            ConnectionPhase::Disconnected
        );
        assert_eq!(
            ConnectionPhase::derive(true, None, false, false, now),
            ConnectionPhase::Disconnected
        );
    }
}
