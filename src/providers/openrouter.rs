use crate::context::FetchContext;
use crate::error::FetchError;
use crate::http::{self, HttpRequest, HttpTransport};
use crate::models::{RateWindow, SpendEntry, UsageData};
use crate::providers::protocol::UsageProvider;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;

const KEY_URL: &str = "https://openrouter.ai/api/v1/key";
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Deserialize)]
pub struct KeyResponse {
    data: KeyData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeyData {
    label: Option<String>,
    limit: Option<f64>,
    limit_remaining: Option<f64>,
    usage: f64,
    usage_daily: f64,
    usage_weekly: f64,
    usage_monthly: f64,
    is_free_tier: bool,
}

/// API-key provider: there is nothing to refresh, so a rejected key goes
/// straight to "needs user action".
pub struct OpenRouterProvider {
    http: Arc<dyn HttpTransport>,
    api_key: Option<String>,
}

impl OpenRouterProvider {
    pub fn new(http: Arc<dyn HttpTransport>, api_key: Option<String>) -> Self {
        Self { http, api_key }
    }

    pub fn from_env(http: Arc<dyn HttpTransport>) -> Self {
        Self::new(http, std::env::var(API_KEY_ENV).ok())
    }
}

#[async_trait]
impl UsageProvider for OpenRouterProvider {
    type Credentials = String;
    type Usage = KeyResponse;

    fn name(&self) -> &'static str {
        "OpenRouter"
    }

    fn login_hint(&self) -> &'static str {
        "check OPENROUTER_API_KEY"
    }

    fn load_credentials(&self) -> Result<String, FetchError> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .ok_or_else(|| FetchError::credentials(format!("{} not set", API_KEY_ENV)))
    }

    fn save_credentials(&self, _creds: &String) -> std::io::Result<()> {
        Ok(())
    }

    async fn refresh(&self, _ctx: &FetchContext, _creds: &mut String) -> Result<(), FetchError> {
        Err(FetchError::NoRefreshToken)
    }

    async fn fetch_usage(
        &self,
        ctx: &FetchContext,
        api_key: &String,
    ) -> Result<(StatusCode, Option<KeyResponse>), FetchError> {
        let request = HttpRequest::get(KEY_URL).bearer(api_key);
        http::send(ctx, self.http.as_ref(), request)
            .await?
            .into_payload()
    }

    fn map_usage(&self, _api_key: &String, response: KeyResponse) -> UsageData {
        let d = response.data;
        let mut data = UsageData {
            // labels that look like the key itself are not worth showing
            identity: d
                .label
                .filter(|l| !l.is_empty() && !l.starts_with("sk-")),
            credits: d.limit_remaining,
            headline_amount: Some(d.usage_monthly),
            plan: d.is_free_tier.then(|| "free".to_string()),
            ..Default::default()
        };

        if let (Some(_), Some(limit)) = (d.limit_remaining, d.limit) {
            if limit > 0.0 {
                data.windows
                    .push(RateWindow::new("Budget", d.usage / limit * 100.0, None));
            }
        }

        data.spend = vec![
            SpendEntry::new("Today", d.usage_daily),
            SpendEntry::new("This week", d.usage_weekly),
            SpendEntry::new("This month", d.usage_monthly),
            SpendEntry::new("All time", d.usage),
        ];

        data
    }
}
