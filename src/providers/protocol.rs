//! The refresh-and-retry protocol shared by every provider.
//!
//! Providers only describe how to load and save their tokens, how to refresh
//! them and how to fetch and map usage; [`run`] owns the state machine:
//!
//! 1. load credentials
//! 2. optionally refresh early when the token is about to expire
//! 3. fetch usage
//! 4. on 401/403: refresh, persist, and fetch once more
//! 5. map the payload into a [`UsageResult`]

use crate::context::FetchContext;
use crate::error::FetchError;
use crate::http::is_auth_status;
use crate::models::{UsageData, UsageResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Budget for the cosmetic identity lookup after a successful fetch.
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(2);

/// The identity lookup must give up this long before the caller's deadline,
/// so the usage data already in hand is returned instead of a timeout.
const IDENTITY_DEADLINE_MARGIN: Duration = Duration::from_millis(100);

#[async_trait]
pub trait UsageProvider: Send + Sync {
    type Credentials: Send + Sync;
    type Usage: Send;

    fn name(&self) -> &'static str;

    /// What the user should do when refreshing cannot recover auth.
    fn login_hint(&self) -> &'static str;

    fn load_credentials(&self) -> Result<Self::Credentials, FetchError>;

    fn save_credentials(&self, creds: &Self::Credentials) -> std::io::Result<()>;

    /// Refresh before the first request, e.g. because the token is about to expire.
    fn needs_early_refresh(&self, _creds: &Self::Credentials) -> bool {
        false
    }

    /// Exchange the refresh token; `creds` is only modified on success.
    async fn refresh(
        &self,
        ctx: &FetchContext,
        creds: &mut Self::Credentials,
    ) -> Result<(), FetchError>;

    /// Status plus the decoded payload for 2xx. Only transport problems are errors.
    async fn fetch_usage(
        &self,
        ctx: &FetchContext,
        creds: &Self::Credentials,
    ) -> Result<(StatusCode, Option<Self::Usage>), FetchError>;

    fn map_usage(&self, creds: &Self::Credentials, usage: Self::Usage) -> UsageData;

    async fn lookup_identity(
        &self,
        _ctx: &FetchContext,
        _creds: &Self::Credentials,
    ) -> Option<String> {
        None
    }
}

#[instrument(skip_all, fields(provider = provider.name()))]
pub async fn run<P: UsageProvider>(provider: &P, ctx: &FetchContext) -> UsageResult {
    let name = provider.name();

    let mut creds = match provider.load_credentials() {
        Ok(creds) => creds,
        Err(err) => {
            warn!(error = %err, "could not load credentials");
            return UsageResult::failure(name, err);
        }
    };

    if provider.needs_early_refresh(&creds) {
        match provider.refresh(ctx, &mut creds).await {
            Ok(()) => {
                if let Err(err) = provider.save_credentials(&creds) {
                    warn!(error = %err, "early refresh succeeded but tokens were not saved");
                }
            }
            // the usage request will show whether the old token still works
            Err(err) => debug!(error = %err, "early refresh failed"),
        }
    }

    let (mut status, mut payload) = match provider.fetch_usage(ctx, &creds).await {
        Ok(fetched) => fetched,
        Err(err) => return UsageResult::failure(name, err),
    };

    if is_auth_status(status) {
        info!(status = status.as_u16(), "usage request rejected, refreshing token");

        if let Err(err) = provider.refresh(ctx, &mut creds).await {
            warn!(error = %err, "token refresh failed");
            let err = match err {
                FetchError::DeadlineExceeded => err,
                other => FetchError::AuthRecoveryFailed {
                    hint: provider.login_hint().to_string(),
                    source: Box::new(other),
                },
            };
            return UsageResult::failure(name, err);
        }

        if let Err(err) = provider.save_credentials(&creds) {
            warn!(error = %err, "refreshed tokens could not be saved");
            return UsageResult::failure(
                name,
                FetchError::PersistAfterRefreshFailed {
                    message: err.to_string(),
                },
            );
        }

        (status, payload) = match provider.fetch_usage(ctx, &creds).await {
            Ok(fetched) => fetched,
            Err(err) => return UsageResult::failure(name, err),
        };

        if is_auth_status(status) {
            return UsageResult::failure(
                name,
                FetchError::AuthStillFailing {
                    status: status.as_u16(),
                    hint: provider.login_hint().to_string(),
                },
            );
        }
    }

    if !status.is_success() {
        return UsageResult::failure(
            name,
            FetchError::HttpStatus {
                status: status.as_u16(),
            },
        );
    }

    let Some(payload) = payload else {
        return UsageResult::failure(name, FetchError::invalid_response("empty usage payload"));
    };

    let mut data = provider.map_usage(&creds, payload);
    if data.identity.is_none() {
        match identity_budget(ctx) {
            Some(budget) => {
                let identity_ctx = ctx.with_timeout(budget);
                data.identity = identity_ctx
                    .run(provider.lookup_identity(&identity_ctx, &creds))
                    .await
                    .ok()
                    .flatten();
            }
            None => debug!("no time left for identity lookup"),
        }
    }

    UsageResult::success(name, data)
}

/// `IDENTITY_TIMEOUT`, cut short so it ends strictly before `ctx`'s deadline.
fn identity_budget(ctx: &FetchContext) -> Option<Duration> {
    match ctx.remaining() {
        None => Some(IDENTITY_TIMEOUT),
        Some(left) => left
            .checked_sub(IDENTITY_DEADLINE_MARGIN)
            .filter(|budget| !budget.is_zero())
            .map(|budget| budget.min(IDENTITY_TIMEOUT)),
    }
}
