use crate::error::FetchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    OpenRouter,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Claude, Provider::Codex, Provider::OpenRouter];

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Claude => "Claude",
            Provider::Codex => "Codex",
            Provider::OpenRouter => "OpenRouter",
        }
    }
}

/// Severity derived from the primary quota window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusClass {
    Normal,
    Warning,
    Critical,
}

impl StatusClass {
    /// Closed-above thresholds: 75 is already a warning, 90 already critical.
    pub fn from_percent(used_percent: f64) -> Self {
        if used_percent >= 90.0 {
            StatusClass::Critical
        } else if used_percent >= 75.0 {
            StatusClass::Warning
        } else {
            StatusClass::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusClass::Normal => "normal",
            StatusClass::Warning => "warning",
            StatusClass::Critical => "critical",
        }
    }
}

/// A single quota window (e.g. 5-hour session, 7-day)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
    pub label: String,
    /// Usage percentage, expected 0-100 but not clamped
    pub used_pct: f64,
    pub reset_at: Option<DateTime<Utc>>,
    pub has_reset: bool,
}

impl RateWindow {
    pub fn new(label: impl Into<String>, used_pct: f64, reset_at: Option<DateTime<Utc>>) -> Self {
        Self {
            label: label.into(),
            used_pct,
            has_reset: reset_at.is_some(),
            reset_at,
        }
    }
}

/// Dollar-denominated usage bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendEntry {
    pub label: String,
    pub amount: f64,
}

impl SpendEntry {
    pub fn new(label: impl Into<String>, amount: f64) -> Self {
        Self {
            label: label.into(),
            amount,
        }
    }
}

/// Provider-mapped usage, before the display fields are derived
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageData {
    /// First entry is the primary window
    pub windows: Vec<RateWindow>,
    pub spend: Vec<SpendEntry>,
    pub credits: Option<f64>,
    pub plan: Option<String>,
    pub identity: Option<String>,
    /// Dollar figure shown when there is neither a window nor credits
    pub headline_amount: Option<f64>,
    /// Provider reports the quota as exhausted regardless of percentages
    pub limit_reached: bool,
}

/// Normalized outcome of one provider fetch cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<StatusClass>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub windows: Vec<RateWindow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spend: Vec<SpendEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FetchError>,
}

impl UsageResult {
    /// Error result: no windows, spend or credits are ever attached.
    pub fn failure(name: impl Into<String>, error: FetchError) -> Self {
        Self {
            name: name.into(),
            identity: None,
            short: Some(error.short_marker().to_string()),
            class: None,
            windows: Vec::new(),
            spend: Vec::new(),
            credits: None,
            plan: None,
            error: Some(error),
        }
    }

    pub fn success(name: impl Into<String>, data: UsageData) -> Self {
        let primary = data.windows.first().map(|w| w.used_pct);

        let short = match primary {
            Some(pct) => Some(format!("{:.0}%", pct)),
            None => data
                .credits
                .or(data.headline_amount)
                .map(|amount| format!("${:.2}", amount)),
        };

        let class = if data.limit_reached {
            Some(StatusClass::Critical)
        } else {
            primary.map(StatusClass::from_percent)
        };

        Self {
            name: name.into(),
            identity: data.identity,
            short,
            class,
            windows: data.windows,
            spend: data.spend,
            credits: data.credits,
            plan: data.plan,
            error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Highest used percentage across all windows
    pub fn max_used_pct(&self) -> Option<f64> {
        self.windows
            .iter()
            .map(|w| w.used_pct)
            .max_by(|a, b| a.total_cmp(b))
    }
}
