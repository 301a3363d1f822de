use crate::error::FetchError;
use crate::models::{RateWindow, SpendEntry, UsageData, UsageResult};
use chrono::{DateTime, Duration, Utc};

/// Deterministic sample results for styling the bar without credentials.
pub fn mock_results(now: DateTime<Utc>) -> Vec<UsageResult> {
    vec![
        // Claude: 72% session with weekly windows and extra usage
        UsageResult::success(
            "Claude",
            UsageData {
                windows: vec![
                    RateWindow::new("Session (5h)", 72.0, Some(now + Duration::hours(3))),
                    RateWindow::new("Weekly (7d)", 45.0, Some(now + Duration::days(3))),
                    RateWindow::new("Weekly Opus", 12.0, Some(now + Duration::days(3))),
                ],
                spend: vec![SpendEntry::new("Extra usage (month)", 42.50)],
                credits: Some(57.50),
                plan: Some("Max".to_string()),
                identity: Some("user@example.com".to_string()),
                ..Default::default()
            },
        ),
        // Codex: warning state
        UsageResult::success(
            "Codex",
            UsageData {
                windows: vec![
                    RateWindow::new("Session (5h)", 85.0, Some(now + Duration::minutes(47))),
                    RateWindow::new("Weekly (7d)", 30.0, Some(now + Duration::days(5))),
                ],
                plan: Some("Pro".to_string()),
                identity: Some("user@example.com".to_string()),
                ..Default::default()
            },
        ),
        UsageResult::failure("OpenRouter", FetchError::HttpStatus { status: 503 }),
    ]
}
