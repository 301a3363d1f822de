use crate::context::FetchContext;
use crate::error::FetchError;
use crate::http::{self, HttpRequest, HttpTransport};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

/// Where and as whom a provider refreshes its tokens
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    pub token_url: String,
    pub client_id: &'static str,
    pub user_agent: Option<&'static str>,
}

/// Tokens handed back by a successful refresh
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<i64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// `refresh_token` grant against `endpoint`. A missing refresh token fails
/// before anything is sent.
pub async fn refresh_tokens(
    ctx: &FetchContext,
    transport: &dyn HttpTransport,
    endpoint: &RefreshEndpoint,
    refresh_token: Option<&str>,
) -> Result<TokenGrant, FetchError> {
    let refresh_token = refresh_token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(FetchError::NoRefreshToken)?;

    let mut request = HttpRequest::post_form(
        endpoint.token_url.as_str(),
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", endpoint.client_id),
        ],
    )
    .header("Accept", "application/json");
    if let Some(user_agent) = endpoint.user_agent {
        request = request.header("User-Agent", user_agent);
    }

    let response = http::send(ctx, transport, request).await?;
    if !response.status.is_success() {
        return Err(FetchError::refresh_failed(format!(
            "token refresh HTTP {}",
            response.status.as_u16()
        )));
    }

    let body: TokenResponse = response
        .json()
        .map_err(|e| FetchError::refresh_failed(e.to_string()))?;
    let access_token = non_empty(body.access_token)
        .ok_or_else(|| FetchError::refresh_failed("token refresh returned no access token"))?;

    let expires_at = body
        .expires_in
        .filter(|secs| *secs > 0)
        .map(|secs| Utc::now() + Duration::seconds(secs));

    debug!(url = %endpoint.token_url, rotated = body.refresh_token.is_some(), "token refreshed");

    Ok(TokenGrant {
        access_token,
        refresh_token: non_empty(body.refresh_token),
        id_token: non_empty(body.id_token),
        expires_at,
    })
}
