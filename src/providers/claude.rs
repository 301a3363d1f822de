use crate::context::FetchContext;
use crate::error::FetchError;
use crate::http::{self, HttpRequest, HttpTransport};
use crate::models::{RateWindow, SpendEntry, UsageData};
use crate::providers::credentials::{self, OAuthCredentials};
use crate::providers::oauth::{self, RefreshEndpoint};
use crate::providers::protocol::UsageProvider;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map};
use std::path::PathBuf;
use std::sync::Arc;

const USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";
const PROFILE_URL: &str = "https://api.anthropic.com/api/oauth/profile";
const TOKEN_URL: &str = "https://platform.claude.com/v1/oauth/token";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const USER_AGENT: &str = "claude-code/2.1.32";
const OAUTH_SECTION: &str = "claudeAiOauth";

/// Refresh this close to `expiresAt` rather than waiting for a 401.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Claude Code credentials from ~/.claude/.credentials.json
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    claude_ai_oauth: Option<OAuthSection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthSection {
    access_token: Option<String>,
    refresh_token: Option<String>,
    /// Unix timestamp in milliseconds
    expires_at: Option<i64>,
    subscription_type: Option<String>,
    rate_limit_tier: Option<String>,
}

/// API response from /api/oauth/usage
#[derive(Debug, Deserialize)]
pub struct UsageResponse {
    five_hour: Option<RateWindowResponse>,
    seven_day: Option<RateWindowResponse>,
    seven_day_opus: Option<RateWindowResponse>,
    seven_day_sonnet: Option<RateWindowResponse>,
    extra_usage: Option<ExtraUsageResponse>,
}

#[derive(Debug, Deserialize)]
struct RateWindowResponse {
    utilization: f64,
    resets_at: Option<String>,
}

/// Extra usage amounts are in cents
#[derive(Debug, Deserialize)]
struct ExtraUsageResponse {
    is_enabled: bool,
    monthly_limit: Option<f64>,
    used_credits: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    account: Option<ProfileAccount>,
}

#[derive(Debug, Deserialize)]
struct ProfileAccount {
    email: Option<String>,
}

pub struct ClaudeProvider {
    http: Arc<dyn HttpTransport>,
    credentials_path: PathBuf,
    refresh_endpoint: RefreshEndpoint,
}

impl ClaudeProvider {
    pub fn new(http: Arc<dyn HttpTransport>) -> Self {
        Self {
            http,
            credentials_path: Self::default_credentials_path(),
            refresh_endpoint: RefreshEndpoint {
                token_url: TOKEN_URL.to_string(),
                client_id: OAUTH_CLIENT_ID,
                user_agent: Some(USER_AGENT),
            },
        }
    }

    pub fn with_credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_path = path;
        self
    }

    pub fn default_credentials_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join(".credentials.json")
    }

    fn load(&self) -> Result<OAuthCredentials, FetchError> {
        let content = credentials::read_file(
            &self.credentials_path,
            "Run `claude login` first.",
        )?;

        let file: CredentialsFile = serde_json::from_str(&content).map_err(|e| {
            FetchError::credentials(format!("failed to parse Claude credentials JSON: {}", e))
        })?;

        let oauth = file.claude_ai_oauth.ok_or_else(|| {
            FetchError::credentials("no Claude OAuth credentials found. Run `claude login` first.")
        })?;

        let access_token = oauth
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| FetchError::credentials("no Claude OAuth access token found"))?;

        let plan = oauth
            .subscription_type
            .or(oauth.rate_limit_tier)
            .and_then(|tier| plan_name(&tier));

        Ok(OAuthCredentials {
            access_token,
            refresh_token: oauth.refresh_token.filter(|t| !t.is_empty()),
            expires_at: oauth
                .expires_at
                .filter(|ms| *ms > 0)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            plan,
            id_token: None,
            account_id: None,
        })
    }

    fn save(&self, creds: &OAuthCredentials) -> std::io::Result<()> {
        let mut fields = Map::new();
        fields.insert("accessToken".to_string(), json!(creds.access_token));
        if let Some(refresh_token) = &creds.refresh_token {
            fields.insert("refreshToken".to_string(), json!(refresh_token));
        }
        if let Some(expires_at) = creds.expires_at {
            fields.insert("expiresAt".to_string(), json!(expires_at.timestamp_millis()));
        }
        credentials::merge_token_fields(&self.credentials_path, OAUTH_SECTION, fields, Map::new())
    }

    fn request(url: &str, token: &str) -> HttpRequest {
        HttpRequest::get(url)
            .bearer(token)
            .header("Accept", "application/json")
            .header("anthropic-beta", OAUTH_BETA)
    }
}

#[async_trait]
impl UsageProvider for ClaudeProvider {
    type Credentials = OAuthCredentials;
    type Usage = UsageResponse;

    fn name(&self) -> &'static str {
        "Claude"
    }

    fn login_hint(&self) -> &'static str {
        "run `claude login`"
    }

    fn load_credentials(&self) -> Result<OAuthCredentials, FetchError> {
        self.load()
    }

    fn save_credentials(&self, creds: &OAuthCredentials) -> std::io::Result<()> {
        self.save(creds)
    }

    fn needs_early_refresh(&self, creds: &OAuthCredentials) -> bool {
        creds.expires_within(chrono::Duration::seconds(EXPIRY_MARGIN_SECS), Utc::now())
    }

    async fn refresh(
        &self,
        ctx: &FetchContext,
        creds: &mut OAuthCredentials,
    ) -> Result<(), FetchError> {
        let grant = oauth::refresh_tokens(
            ctx,
            self.http.as_ref(),
            &self.refresh_endpoint,
            creds.refresh_token.as_deref(),
        )
        .await?;
        creds.apply(grant);
        Ok(())
    }

    async fn fetch_usage(
        &self,
        ctx: &FetchContext,
        creds: &OAuthCredentials,
    ) -> Result<(StatusCode, Option<UsageResponse>), FetchError> {
        let request = Self::request(USAGE_URL, &creds.access_token);
        http::send(ctx, self.http.as_ref(), request)
            .await?
            .into_payload()
    }

    fn map_usage(&self, creds: &OAuthCredentials, usage: UsageResponse) -> UsageData {
        let mut data = UsageData {
            plan: creds.plan.clone(),
            ..Default::default()
        };

        let windows = [
            ("Session (5h)", usage.five_hour),
            ("Weekly (7d)", usage.seven_day),
            ("Weekly Sonnet", usage.seven_day_sonnet),
            ("Weekly Opus", usage.seven_day_opus),
        ];
        for (label, window) in windows {
            if let Some(w) = window {
                let reset = w.resets_at.as_deref().and_then(parse_iso8601);
                data.windows.push(RateWindow::new(label, w.utilization, reset));
            }
        }

        if let Some(extra) = usage.extra_usage.filter(|e| e.is_enabled) {
            let used = extra.used_credits.unwrap_or(0.0);
            let limit = extra.monthly_limit.unwrap_or(0.0);
            // going over the allotment leaves nothing, never a negative balance
            data.credits = Some(credits_to_dollars(limit - used).max(0.0));
            data.spend
                .push(SpendEntry::new("Extra usage (month)", credits_to_dollars(used)));
        }

        data
    }

    async fn lookup_identity(&self, ctx: &FetchContext, creds: &OAuthCredentials) -> Option<String> {
        let request = Self::request(PROFILE_URL, &creds.access_token);
        let response = http::send(ctx, self.http.as_ref(), request).await.ok()?;
        if !response.status.is_success() {
            return None;
        }
        let profile: ProfileResponse = response.json().ok()?;
        profile
            .account?
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
    }
}

fn credits_to_dollars(cents: f64) -> f64 {
    cents / 100.0
}

fn plan_name(tier: &str) -> Option<String> {
    let trimmed = tier.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    let label = if lower.contains("enterprise") {
        "Enterprise"
    } else if lower.contains("team") {
        "Team"
    } else if lower.contains("max") {
        "Max"
    } else if lower.contains("pro") {
        "Pro"
    } else if lower.contains("free") {
        "Free"
    } else {
        trimmed
    };
    Some(label.to_string())
}

fn parse_iso8601(s: &str) -> Option<DateTime<Utc>> {
    // Try with fractional seconds first, then without
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}
