use crate::models::{RateWindow, StatusClass, UsageResult};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

const ICON: &str = "󱚣";

/// Custom-module payload for Waybar's `return-type: json`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaybarOutput {
    pub text: String,
    pub tooltip: String,
    pub class: String,
    pub percentage: u32,
}

pub fn format(results: &[UsageResult], now: DateTime<Utc>) -> WaybarOutput {
    let healthy = results.iter().filter(|r| !r.is_error());

    let worst_pct = healthy
        .clone()
        .filter_map(UsageResult::max_used_pct)
        .max_by(|a, b| a.total_cmp(b));

    let worst_class = healthy
        .filter_map(|r| r.class)
        .max()
        .unwrap_or(StatusClass::Normal);

    let tooltip = format_status(results, now);

    match worst_pct {
        Some(pct) => WaybarOutput {
            text: format!("{} {:.0}%", ICON, pct),
            tooltip,
            class: worst_class.as_str().to_string(),
            percentage: pct.max(0.0) as u32,
        },
        None => match results.iter().find_map(|r| r.error.as_ref()) {
            // a failed fetch must not read as 0% used
            Some(_) => {
                let needs_login = results
                    .iter()
                    .filter_map(|r| r.error.as_ref())
                    .any(|e| e.needs_login());
                WaybarOutput {
                    text: format!("{} {}", ICON, if needs_login { "!" } else { "?" }),
                    tooltip,
                    class: "error".to_string(),
                    percentage: 0,
                }
            }
            None => WaybarOutput {
                text: format!("{} 0%", ICON),
                tooltip,
                class: worst_class.as_str().to_string(),
                percentage: 0,
            },
        },
    }
}

/// One block per provider, blank-line separated. Shared by the tooltip and
/// the `status` command.
pub fn format_status(results: &[UsageResult], now: DateTime<Utc>) -> String {
    results
        .iter()
        .map(|r| format_block(r, now))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_block(result: &UsageResult, now: DateTime<Utc>) -> String {
    let mut out = result.name.clone();
    if let Some(plan) = result.plan.as_deref().filter(|p| !p.is_empty()) {
        out.push_str(&format!(" ({})", plan));
    }
    if let Some(identity) = &result.identity {
        out.push_str(&format!("\n  {}", identity));
    }

    if let Some(err) = &result.error {
        out.push_str(&format!("\n  Error: {}", err));
        return out;
    }

    for window in &result.windows {
        out.push_str(&format!(
            "\n  {}: {:.0}% used{}",
            window.label,
            window.used_pct,
            format_reset(window, now)
        ));
    }

    for entry in &result.spend {
        out.push_str(&format!("\n  {}: ${:.2}", entry.label, entry.amount));
    }

    if let Some(credits) = result.credits {
        out.push_str(&format!("\n  Credits: ${:.2} remaining", credits));
    }

    out
}

fn format_reset(window: &RateWindow, now: DateTime<Utc>) -> String {
    match window.reset_at {
        Some(reset_at) if window.has_reset => {
            let remaining = reset_at - now;
            if remaining > Duration::zero() {
                format!(" (resets in {})", format_reset_duration(remaining))
            } else {
                " (resetting now)".to_string()
            }
        }
        _ => String::new(),
    }
}

pub fn format_reset_duration(remaining: Duration) -> String {
    if remaining <= Duration::zero() {
        return "now".to_string();
    }
    let days = remaining.num_days();
    let hours = remaining.num_hours() % 24;
    let minutes = remaining.num_minutes() % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
