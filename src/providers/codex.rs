use crate::context::FetchContext;
use crate::error::FetchError;
use crate::http::{self, HttpRequest, HttpTransport};
use crate::models::{RateWindow, UsageData};
use crate::providers::credentials::{self, OAuthCredentials};
use crate::providers::oauth::{self, RefreshEndpoint};
use crate::providers::protocol::UsageProvider;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CHATGPT_BASE_URL: &str = "https://chatgpt.com/backend-api";
const CHATGPT_USAGE_PATH: &str = "/wham/usage";
const CODEX_USAGE_PATH: &str = "/api/codex/usage";
const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const TOKENS_SECTION: &str = "tokens";

#[derive(Debug, Deserialize)]
struct AuthFile {
    tokens: Option<AuthTokens>,
}

#[derive(Debug, Deserialize)]
struct AuthTokens {
    access_token: Option<String>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UsageResponse {
    email: Option<String>,
    plan_type: Option<String>,
    rate_limit: Option<RateLimitDetails>,
    credits: Option<CreditDetails>,
}

#[derive(Debug, Deserialize)]
struct RateLimitDetails {
    #[serde(default)]
    limit_reached: bool,
    primary_window: Option<WindowSnapshot>,
    secondary_window: Option<WindowSnapshot>,
}

#[derive(Debug, Deserialize)]
struct WindowSnapshot {
    used_percent: f64,
    #[serde(default)]
    reset_at: i64,
    #[serde(default)]
    limit_window_seconds: i64,
}

#[derive(Debug, Deserialize)]
struct CreditDetails {
    has_credits: Option<bool>,
    unlimited: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_balance_opt")]
    balance: Option<f64>,
}

pub struct CodexProvider {
    http: Arc<dyn HttpTransport>,
    codex_home: PathBuf,
    credentials_path: PathBuf,
    refresh_endpoint: RefreshEndpoint,
}

impl CodexProvider {
    pub fn new(http: Arc<dyn HttpTransport>) -> Self {
        Self::with_home(http, Self::default_home())
    }

    /// Reads `auth.json` and `config.toml` from `codex_home`.
    pub fn with_home(http: Arc<dyn HttpTransport>, codex_home: PathBuf) -> Self {
        Self {
            http,
            credentials_path: codex_home.join("auth.json"),
            codex_home,
            refresh_endpoint: RefreshEndpoint {
                token_url: TOKEN_URL.to_string(),
                client_id: OAUTH_CLIENT_ID,
                user_agent: None,
            },
        }
    }

    pub fn with_credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_path = path;
        self
    }

    fn default_home() -> PathBuf {
        if let Ok(codex_home) = env::var("CODEX_HOME") {
            let trimmed = codex_home.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".codex")
    }

    fn load(&self) -> Result<OAuthCredentials, FetchError> {
        let content = credentials::read_file(&self.credentials_path, "Run `codex login` first.")?;

        let auth: AuthFile = serde_json::from_str(&content)
            .map_err(|e| FetchError::credentials(format!("failed to parse auth.json: {}", e)))?;

        let tokens = auth.tokens.ok_or_else(|| {
            FetchError::credentials("Codex auth.json missing tokens. Run `codex login` to log in.")
        })?;

        let access_token = tokens
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| FetchError::credentials("no Codex access token found"))?;

        Ok(OAuthCredentials {
            access_token,
            refresh_token: tokens.refresh_token.filter(|t| !t.is_empty()),
            expires_at: None,
            plan: None,
            id_token: tokens.id_token.filter(|t| !t.is_empty()),
            account_id: tokens
                .account_id
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        })
    }

    fn save(&self, creds: &OAuthCredentials) -> std::io::Result<()> {
        let mut fields = Map::new();
        fields.insert("access_token".to_string(), json!(creds.access_token));
        if let Some(refresh_token) = &creds.refresh_token {
            fields.insert("refresh_token".to_string(), json!(refresh_token));
        }
        if let Some(id_token) = &creds.id_token {
            fields.insert("id_token".to_string(), json!(id_token));
        }

        let mut top_level = Map::new();
        top_level.insert("last_refresh".to_string(), json!(Utc::now().to_rfc3339()));

        credentials::merge_token_fields(&self.credentials_path, TOKENS_SECTION, fields, top_level)
    }

    fn resolve_usage_url(&self) -> String {
        let base = Self::resolve_chatgpt_base_url(&self.codex_home.join("config.toml"));
        let normalized = normalize_chatgpt_base_url(&base);
        let path = if normalized.contains("/backend-api") {
            CHATGPT_USAGE_PATH
        } else {
            CODEX_USAGE_PATH
        };
        let full = format!("{}{}", normalized, path);
        match reqwest::Url::parse(&full) {
            Ok(_) => full,
            Err(_) => format!("{}{}", DEFAULT_CHATGPT_BASE_URL, CHATGPT_USAGE_PATH),
        }
    }

    fn resolve_chatgpt_base_url(config_path: &Path) -> String {
        std::fs::read_to_string(config_path)
            .ok()
            .and_then(|contents| parse_chatgpt_base_url(&contents))
            .unwrap_or_else(|| DEFAULT_CHATGPT_BASE_URL.to_string())
    }

    fn resolve_identity(creds: &OAuthCredentials, usage: &UsageResponse) -> (Option<String>, Option<String>) {
        let payload = creds.id_token.as_deref().and_then(parse_jwt_payload);

        let email = usage
            .email
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                let payload = payload.as_ref()?;
                payload
                    .get("email")
                    .and_then(Value::as_str)
                    .or_else(|| {
                        payload
                            .get("https://api.openai.com/profile")
                            .and_then(Value::as_object)
                            .and_then(|obj| obj.get("email"))
                            .and_then(Value::as_str)
                    })
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            });

        let plan = usage
            .plan_type
            .as_deref()
            .and_then(normalize_plan_name)
            .or_else(|| {
                payload
                    .as_ref()
                    .and_then(|p| p.get("https://api.openai.com/auth"))
                    .and_then(Value::as_object)
                    .and_then(|obj| obj.get("chatgpt_plan_type"))
                    .and_then(Value::as_str)
                    .and_then(normalize_plan_name)
            });

        (email, plan)
    }
}

#[async_trait]
impl UsageProvider for CodexProvider {
    type Credentials = OAuthCredentials;
    type Usage = UsageResponse;

    fn name(&self) -> &'static str {
        "Codex"
    }

    fn login_hint(&self) -> &'static str {
        "run `codex login`"
    }

    fn load_credentials(&self) -> Result<OAuthCredentials, FetchError> {
        self.load()
    }

    fn save_credentials(&self, creds: &OAuthCredentials) -> std::io::Result<()> {
        self.save(creds)
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
        let mut request = HttpRequest::get(self.resolve_usage_url())
            .bearer(&creds.access_token)
            .header("Accept", "application/json");
        if let Some(account_id) = &creds.account_id {
            request = request.header("ChatGPT-Account-Id", account_id.as_str());
        }

        http::send(ctx, self.http.as_ref(), request)
            .await?
            .into_payload()
    }

    fn map_usage(&self, creds: &OAuthCredentials, usage: UsageResponse) -> UsageData {
        let (identity, plan) = Self::resolve_identity(creds, &usage);
        let mut data = UsageData {
            identity,
            plan,
            ..Default::default()
        };

        if let Some(rate_limit) = &usage.rate_limit {
            let windows = [
                (rate_limit.primary_window.as_ref(), "Session (5h)"),
                (rate_limit.secondary_window.as_ref(), "Weekly (7d)"),
            ];
            for (window, fallback) in windows {
                if let Some(w) = window {
                    data.windows.push(make_window(w, fallback));
                }
            }
            data.limit_reached = rate_limit.limit_reached;
        }

        if let Some(credits) = &usage.credits {
            let usable = credits.has_credits.unwrap_or(false) && !credits.unlimited.unwrap_or(false);
            if usable {
                data.credits = credits.balance;
            }
        }

        data
    }
}

fn make_window(window: &WindowSnapshot, fallback: &str) -> RateWindow {
    let reset = if window.reset_at > 0 {
        Utc.timestamp_opt(window.reset_at, 0).single()
    } else {
        None
    };
    RateWindow::new(window_label(window.limit_window_seconds, fallback), window.used_percent, reset)
}

fn window_label(seconds: i64, fallback: &str) -> String {
    const HOUR: i64 = 3600;
    const DAY: i64 = 24 * HOUR;
    match seconds {
        s if s == 5 * HOUR => "Session (5h)".to_string(),
        s if s == 7 * DAY => "Weekly (7d)".to_string(),
        s if s > 0 && s % DAY == 0 => format!("Window ({}d)", s / DAY),
        s if s > 0 && s % HOUR == 0 => format!("Window ({}h)", s / HOUR),
        _ => fallback.to_string(),
    }
}

fn parse_chatgpt_base_url(contents: &str) -> Option<String> {
    let value: toml::Value = toml::from_str(contents).ok()?;
    value
        .get("chatgpt_base_url")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn normalize_chatgpt_base_url(value: &str) -> String {
    let mut trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        trimmed = DEFAULT_CHATGPT_BASE_URL.to_string();
    }
    while trimmed.ends_with('/') {
        trimmed.pop();
    }
    if (trimmed.starts_with("https://chatgpt.com") || trimmed.starts_with("https://chat.openai.com"))
        && !trimmed.contains("/backend-api")
    {
        trimmed.push_str("/backend-api");
    }
    trimmed
}

fn parse_jwt_payload(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    serde_json::from_slice(&decoded).ok()
}

fn normalize_plan_name(plan: &str) -> Option<String> {
    let trimmed = plan.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    let label = match lower.as_str() {
        "free" => "Free",
        "plus" => "Plus",
        "pro" => "Pro",
        "team" => "Team",
        "enterprise" => "Enterprise",
        "business" => "Business",
        "education" | "edu" => "Education",
        "go" => "Go",
        "free_workspace" => "Free Workspace",
        "k12" => "K-12",
        _ => trimmed,
    };
    Some(label.to_string())
}

fn deserialize_balance_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(num)) => num
            .as_f64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("invalid number value for credit balance")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom("invalid string value for credit balance")),
        Some(_) => Err(serde::de::Error::custom("invalid value type for credit balance")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderFetcher;
    use crate::http::testing::FakeTransport;
    use crate::models::StatusClass;
    use pretty_assertions::assert_eq;
    use reqwest::Method;
    use std::fs;
    use tempfile::TempDir;

    const USAGE_URL: &str = "https://chatgpt.com/backend-api/wham/usage";

    fn home_with_auth(content: &str) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("auth.json"), content).unwrap();
        dir
    }

    fn provider(fake: &Arc<FakeTransport>, home: &TempDir) -> CodexProvider {
        CodexProvider::with_home(fake.clone(), home.path().to_path_buf())
    }

    fn read_auth(home: &TempDir) -> Value {
        serde_json::from_str(&fs::read_to_string(home.path().join("auth.json")).unwrap()).unwrap()
    }

    fn jwt(claims: Value) -> String {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        format!("eyJhbGciOiJub25lIn0.{}.sig", payload)
    }

    #[test]
    fn test_load_requires_access_token() {
        let home = home_with_auth(r#"{"tokens":{}}"#);
        let fake = Arc::new(FakeTransport::new());

        let err = provider(&fake, &home).load().unwrap_err();
        assert_eq!(err, FetchError::credentials("no Codex access token found"));
    }

    #[test]
    fn test_load_missing_tokens_section() {
        let home = home_with_auth(r#"{"OPENAI_API_KEY":"sk-123"}"#);
        let fake = Arc::new(FakeTransport::new());

        let err = provider(&fake, &home).load().unwrap_err();
        assert!(matches!(err, FetchError::CredentialsMissingOrMalformed { .. }));
    }

    #[test]
    fn test_save_preserves_unknown_fields() {
        let home = home_with_auth(
            r#"{"meta":"keep-me","OPENAI_API_KEY":null,"tokens":{"access_token":"old","refresh_token":"old","account_id":"acct"}}"#,
        );
        let fake = Arc::new(FakeTransport::new());
        let codex = provider(&fake, &home);

        let mut creds = codex.load().unwrap();
        creds.access_token = "new-access".to_string();
        creds.refresh_token = Some("new-refresh".to_string());
        creds.id_token = Some("new-id".to_string());
        codex.save(&creds).unwrap();

        let parsed = read_auth(&home);
        assert_eq!(parsed["meta"], "keep-me");
        assert_eq!(parsed["OPENAI_API_KEY"], Value::Null);
        assert_eq!(parsed["tokens"]["access_token"], "new-access");
        assert_eq!(parsed["tokens"]["refresh_token"], "new-refresh");
        assert_eq!(parsed["tokens"]["id_token"], "new-id");
        assert_eq!(parsed["tokens"]["account_id"], "acct");
        assert!(parsed["last_refresh"].is_string());
    }

    #[test]
    fn test_normalize_chatgpt_base_url() {
        assert_eq!(normalize_chatgpt_base_url("https://chatgpt.com/"), DEFAULT_CHATGPT_BASE_URL);
        assert_eq!(normalize_chatgpt_base_url(""), DEFAULT_CHATGPT_BASE_URL);
        assert_eq!(
            normalize_chatgpt_base_url("https://proxy.internal/codex//"),
            "https://proxy.internal/codex"
        );
    }

    #[test]
    fn test_usage_url_from_config() {
        let home = home_with_auth("{}");
        let fake = Arc::new(FakeTransport::new());
        assert_eq!(provider(&fake, &home).resolve_usage_url(), USAGE_URL);

        fs::write(
            home.path().join("config.toml"),
            "model = \"o3\"\nchatgpt_base_url = \"https://proxy.internal/\"\n",
        )
        .unwrap();
        assert_eq!(
            provider(&fake, &home).resolve_usage_url(),
            "https://proxy.internal/api/codex/usage"
        );
    }

    #[test]
    fn test_window_label() {
        assert_eq!(window_label(18_000, "x"), "Session (5h)");
        assert_eq!(window_label(604_800, "x"), "Weekly (7d)");
        assert_eq!(window_label(86_400, "x"), "Window (1d)");
        assert_eq!(window_label(3_600, "x"), "Window (1h)");
        assert_eq!(window_label(0, "Weekly (7d)"), "Weekly (7d)");
    }

    #[test]
    fn test_normalize_plan_name() {
        assert_eq!(normalize_plan_name("plus").as_deref(), Some("Plus"));
        assert_eq!(normalize_plan_name("PRO").as_deref(), Some("Pro"));
        assert_eq!(normalize_plan_name("mystery").as_deref(), Some("mystery"));
        assert_eq!(normalize_plan_name(""), None);
    }

    #[test]
    fn test_balance_accepts_strings() {
        let credits: CreditDetails =
            serde_json::from_str(r#"{"has_credits":true,"unlimited":false,"balance":"12.5"}"#).unwrap();
        assert_eq!(credits.balance, Some(12.5));
        let credits: CreditDetails = serde_json::from_str(r#"{"balance":null}"#).unwrap();
        assert_eq!(credits.balance, None);
    }

    #[tokio::test]
    async fn test_fetch_maps_usage() {
        let body = r#"{
            "email": "user@example.com",
            "plan_type": "pro",
            "rate_limit": {
                "allowed": true,
                "limit_reached": false,
                "primary_window": {"used_percent": 40, "limit_window_seconds": 18000, "reset_after_seconds": 600, "reset_at": 1771408800},
                "secondary_window": {"used_percent": 12.5, "limit_window_seconds": 604800, "reset_at": 0}
            },
            "credits": {"has_credits": true, "unlimited": false, "balance": "4.20"}
        }"#;
        let fake = Arc::new(FakeTransport::new().reply(Method::GET, USAGE_URL, 200, body));
        let home = home_with_auth(r#"{"tokens":{"access_token":"token123","account_id":"acct-1"}}"#);

        let result = provider(&fake, &home).fetch(&FetchContext::background()).await;

        assert_eq!(result.error, None);
        assert_eq!(result.identity.as_deref(), Some("user@example.com"));
        assert_eq!(result.plan.as_deref(), Some("Pro"));
        assert_eq!(result.short.as_deref(), Some("40%"));
        assert_eq!(result.class, Some(StatusClass::Normal));
        assert_eq!(result.credits, Some(4.2));
        assert_eq!(result.windows.len(), 2);
        assert!(result.windows[0].has_reset);
        assert_eq!(result.windows[0].reset_at.unwrap().timestamp(), 1_771_408_800);
        assert!(!result.windows[1].has_reset);
        assert_eq!(result.windows[1].label, "Weekly (7d)");

        let request = &fake.requests()[0];
        assert_eq!(request.header_value("Authorization"), Some("Bearer token123"));
        assert_eq!(request.header_value("ChatGPT-Account-Id"), Some("acct-1"));
    }

    #[tokio::test]
    async fn test_limit_reached_is_critical() {
        let body = r#"{"rate_limit":{"limit_reached":true,"primary_window":{"used_percent":20}}}"#;
        let fake = Arc::new(FakeTransport::new().reply(Method::GET, USAGE_URL, 200, body));
        let home = home_with_auth(r#"{"tokens":{"access_token":"t"}}"#);

        let result = provider(&fake, &home).fetch(&FetchContext::background()).await;

        assert_eq!(result.class, Some(StatusClass::Critical));
        assert_eq!(result.windows[0].label, "Session (5h)");
    }

    #[tokio::test]
    async fn test_identity_falls_back_to_id_token() {
        let id_token = jwt(json!({
            "email": "jwt@example.com",
            "https://api.openai.com/auth": {"chatgpt_plan_type": "plus"}
        }));
        let fake = Arc::new(FakeTransport::new().reply(Method::GET, USAGE_URL, 200, "{}"));
        let home = home_with_auth(&format!(
            r#"{{"tokens":{{"access_token":"t","id_token":"{}"}}}}"#,
            id_token
        ));

        let result = provider(&fake, &home).fetch(&FetchContext::background()).await;

        assert_eq!(result.error, None);
        assert_eq!(result.identity.as_deref(), Some("jwt@example.com"));
        assert_eq!(result.plan.as_deref(), Some("Plus"));
        assert_eq!(result.short, None);
    }

    #[tokio::test]
    async fn test_forbidden_refreshes_and_retries() {
        let fake = Arc::new(
            FakeTransport::new()
                .reply(Method::GET, USAGE_URL, 403, "{}")
                .reply(
                    Method::POST,
                    TOKEN_URL,
                    200,
                    r#"{"access_token":"new-access","refresh_token":"new-refresh","id_token":"new-id"}"#,
                )
                .reply(Method::GET, USAGE_URL, 200, r#"{"rate_limit":{"primary_window":{"used_percent":91}}}"#),
        );
        let home = home_with_auth(
            r#"{"meta":"keep-me","tokens":{"access_token":"old-access","refresh_token":"old-refresh"}}"#,
        );

        let result = provider(&fake, &home).fetch(&FetchContext::background()).await;

        assert_eq!(result.error, None);
        assert_eq!(result.class, Some(StatusClass::Critical));
        assert_eq!(fake.calls(Method::GET, USAGE_URL), 2);
        assert_eq!(fake.calls(Method::POST, TOKEN_URL), 1);

        let refresh = fake
            .requests()
            .into_iter()
            .find(|r| r.url == TOKEN_URL)
            .unwrap();
        let form: Vec<(String, String)> =
            url::form_urlencoded::parse(refresh.body.unwrap().as_bytes()).into_owned().collect();
        assert!(form.contains(&("client_id".to_string(), OAUTH_CLIENT_ID.to_string())));
        assert!(form.contains(&("refresh_token".to_string(), "old-refresh".to_string())));

        let parsed = read_auth(&home);
        assert_eq!(parsed["meta"], "keep-me");
        assert_eq!(parsed["tokens"]["access_token"], "new-access");
        assert_eq!(parsed["tokens"]["refresh_token"], "new-refresh");
        assert_eq!(parsed["tokens"]["id_token"], "new-id");
    }

    #[tokio::test]
    async fn test_refresh_rejected_needs_login() {
        let fake = Arc::new(
            FakeTransport::new()
                .reply(Method::GET, USAGE_URL, 401, "{}")
                .reply(Method::POST, TOKEN_URL, 401, r#"{"error":"refresh_token_expired"}"#),
        );
        let home = home_with_auth(r#"{"tokens":{"access_token":"old","refresh_token":"old"}}"#);

        let result = provider(&fake, &home).fetch(&FetchContext::background()).await;

        assert_eq!(result.short.as_deref(), Some("!"));
        assert!(matches!(result.error, Some(FetchError::AuthRecoveryFailed { .. })));
        assert!(result.windows.is_empty());
        assert_eq!(fake.calls(Method::GET, USAGE_URL), 1);
        assert_eq!(read_auth(&home)["tokens"]["access_token"], "old");
    }

    #[tokio::test]
    async fn test_transport_error_is_transient() {
        let fake = Arc::new(FakeTransport::new().fail(
            Method::GET,
            USAGE_URL,
            FetchError::transport("connection refused"),
        ));
        let home = home_with_auth(r#"{"tokens":{"access_token":"t","refresh_token":"r"}}"#);

        let result = provider(&fake, &home).fetch(&FetchContext::background()).await;

        assert_eq!(result.error, Some(FetchError::transport("connection refused")));
        assert_eq!(result.short.as_deref(), Some("?"));
    }
}
