//! Bling ERP (API v3) OAuth adapter and REST helpers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

use super::{OAuthProvider, ProviderError, TokenGrant};
use crate::config::BlingConfig;
use crate::models::{AccessToken, ConnectionConfig, Environment, RefreshToken};

const PROBE_PATH: &str = "empresas/me/dados-basicos";
const SALES_ORDERS_PATH: &str = "pedidos/vendas";
const BODY_SNIPPET_CHARS: usize = 512;

#[derive(Debug, Deserialize)]
struct BlingTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Sales order summary as listed by `GET /pedidos/vendas`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SalesOrder {
    pub id: i64,
    #[serde(default)]
    pub numero: Option<i64>,
    /// Order date, `YYYY-MM-DD`
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub total: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SalesOrderPage {
    #[serde(default)]
    data: Vec<SalesOrder>,
}

/// Bling OAuth2 provider.
pub struct BlingProvider {
    config: BlingConfig,
    http: Client,
}

impl BlingProvider {
    /// Builds the provider with an HTTP client bounded by `request_timeout`.
    pub fn new(config: BlingConfig, request_timeout: Duration) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("vng-connect/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Configuration {
                details: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { config, http })
    }

    fn endpoint(base: &str, path: &str) -> Result<Url, ProviderError> {
        let joined = format!("{}/{}", base.trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|e| ProviderError::Configuration {
            details: format!("invalid Bling endpoint {}: {}", joined, e),
        })
    }

    async fn token_request(
        &self,
        config: &ConnectionConfig,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, ProviderError> {
        let url = Self::endpoint(self.config.oauth_base(config.environment), "oauth/token")?;

        let response = self
            .http
            .post(url)
            .basic_auth(&config.client_id, Some(config.client_secret.expose()))
            .header(header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_token_failure(response).await);
        }

        let body = response.text().await?;
        let parsed: BlingTokenResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::MalformedResponse {
                details: format!("token response could not be decoded: {}", e),
            })?;

        if parsed.access_token.trim().is_empty() {
            return Err(ProviderError::MalformedResponse {
                details: "token response carried an empty access_token".to_string(),
            });
        }

        Ok(TokenGrant {
            access_token: AccessToken::new(parsed.access_token),
            refresh_token: parsed
                .refresh_token
                .filter(|token| !token.is_empty())
                .map(RefreshToken::new),
            expires_in: parsed.expires_in,
        })
    }

    /// Lists one page of sales orders, newest filters applied by Bling.
    pub async fn list_sales_orders(
        &self,
        api_base: &str,
        access_token: &AccessToken,
        page: u32,
        limit: u32,
        since: Option<NaiveDate>,
    ) -> Result<Vec<SalesOrder>, ProviderError> {
        let mut url = Self::endpoint(api_base, SALES_ORDERS_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pagina", &page.to_string());
            query.append_pair("limite", &limit.to_string());
            if let Some(since) = since {
                query.append_pair("dataInicial", &since.format("%Y-%m-%d").to_string());
            }
        }

        let response = self
            .http
            .get(url)
            .bearer_auth(access_token.expose())
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(classify_api_failure(response).await);
        }

        let body = response.text().await?;
        let page: SalesOrderPage =
            serde_json::from_str(&body).map_err(|e| ProviderError::MalformedResponse {
                details: format!("sales order page could not be decoded: {}", e),
            })?;
        Ok(page.data)
    }
}

#[async_trait]
impl OAuthProvider for BlingProvider {
    fn slug(&self) -> &'static str {
        "bling"
    }

    fn authorize_url(&self, config: &ConnectionConfig, state: &str) -> Result<Url, ProviderError> {
        let mut url = Self::endpoint(self.config.oauth_base(config.environment), "oauth/authorize")?;
        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes)
            .append_pair("state", state);
        Ok(url)
    }

    fn api_base(&self, environment: Environment) -> String {
        self.config
            .api_base(environment)
            .trim_end_matches('/')
            .to_string()
    }

    async fn exchange_code(
        &self,
        config: &ConnectionConfig,
        code: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.token_request(
            config,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &config.redirect_uri),
            ],
        )
        .await
    }

    async fn refresh(
        &self,
        config: &ConnectionConfig,
        refresh_token: &RefreshToken,
    ) -> Result<TokenGrant, ProviderError> {
        self.token_request(
            config,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose()),
            ],
        )
        .await
    }

    async fn probe(
        &self,
        config: &ConnectionConfig,
        access_token: &AccessToken,
    ) -> Result<(), ProviderError> {
        let url = Self::endpoint(&self.api_base(config.environment), PROBE_PATH)?;

        let response = self
            .http
            .get(url)
            .bearer_auth(access_token.expose())
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(classify_api_failure(response).await)
        }
    }
}

fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

fn snippet(body: &str) -> String {
    if body.chars().count() > BODY_SNIPPET_CHARS {
        let truncated: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

/// Extracts the OAuth error code from either the RFC 6749 shape
/// (`{"error": "invalid_grant"}`) or Bling's nested shape
/// (`{"error": {"type": "invalid_grant", "message": ...}}`).
fn oauth_error_code(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .as_str()
        .or_else(|| error.get("type").and_then(|t| t.as_str()))
        .map(str::to_string)
}

async fn classify_token_failure(response: Response) -> ProviderError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited {
            retry_after: retry_after(&response),
        };
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        return ProviderError::Network {
            details: format!("token endpoint returned {}", status.as_u16()),
        };
    }

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Rejected {
                status: status.as_u16(),
                error_code: oauth_error_code(&body),
                details: snippet(&body),
            }
        }
        StatusCode::REQUEST_TIMEOUT => ProviderError::Network {
            details: "token endpoint returned 408".to_string(),
        },
        _ => ProviderError::Http {
            status: status.as_u16(),
            body: Some(snippet(&body)),
        },
    }
}

async fn classify_api_failure(response: Response) -> ProviderError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited {
            retry_after: retry_after(&response),
        };
    }

    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Rejected {
            status: status.as_u16(),
            error_code: oauth_error_code(&body),
            details: snippet(&body),
        },
        s if s.is_server_error() => ProviderError::Network {
            details: format!("Bling API returned {}", s.as_u16()),
        },
        s => ProviderError::Http {
            status: s.as_u16(),
            body: Some(snippet(&body)),
        },
    }
}
