pub mod claude;
pub mod codex;
pub mod credentials;
pub mod oauth;
pub mod openrouter;
pub mod protocol;

use crate::context::FetchContext;
use crate::models::UsageResult;
use crate::providers::protocol::UsageProvider;
use async_trait::async_trait;
use futures::future::join_all;
use std::time::Duration;
use tracing::debug;

/// Per-provider budget derived from the caller's context.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ProviderFetcher: Send + Sync {
    /// Always returns a result; failures are carried in `UsageResult::error`.
    async fn fetch(&self, ctx: &FetchContext) -> UsageResult;
    fn name(&self) -> &str;
}

#[async_trait]
impl<P: UsageProvider> ProviderFetcher for P {
    async fn fetch(&self, ctx: &FetchContext) -> UsageResult {
        protocol::run(self, ctx).await
    }

    fn name(&self) -> &str {
        UsageProvider::name(self)
    }
}

/// Fetch every provider concurrently. The output has one result per provider,
/// in the same order as `providers`, however the requests finish.
pub async fn fetch_all(
    ctx: &FetchContext,
    providers: &[Box<dyn ProviderFetcher>],
    timeout: Duration,
) -> Vec<UsageResult> {
    let branches = providers.iter().map(|provider| {
        let branch_ctx = ctx.with_timeout(timeout);
        async move {
            debug!(provider = provider.name(), deadline = ?branch_ctx.deadline(), "fetching");
            let result = match branch_ctx.run(provider.fetch(&branch_ctx)).await {
                Ok(result) => result,
                Err(err) => UsageResult::failure(provider.name(), err),
            };
            debug!(
                provider = provider.name(),
                error = ?result.error,
                "provider finished"
            );
            result
        }
    });

    join_all(branches).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::models::UsageData;
    use std::time::Instant;

    struct Stub {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl ProviderFetcher for Stub {
        async fn fetch(&self, _ctx: &FetchContext) -> UsageResult {
            tokio::time::sleep(self.delay).await;
            UsageResult::success(self.name, UsageData::default())
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn stub(name: &'static str, delay_ms: u64) -> Box<dyn ProviderFetcher> {
        Box::new(Stub {
            name,
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn names(results: &[UsageResult]) -> Vec<&str> {
        results.iter().map(|r| r.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_fetch_all_preserves_provider_order() {
        let providers = vec![stub("first", 30), stub("second", 0), stub("third", 10)];

        let results = fetch_all(&FetchContext::background(), &providers, PROVIDER_TIMEOUT).await;

        assert_eq!(names(&results), vec!["first", "second", "third"]);
        assert!(results.iter().all(|r| r.error.is_none()));
    }

    #[tokio::test]
    async fn test_fetch_all_runs_concurrently() {
        let providers = vec![stub("a", 100), stub("b", 100), stub("c", 100)];

        let start = Instant::now();
        let results = fetch_all(&FetchContext::background(), &providers, PROVIDER_TIMEOUT).await;

        assert_eq!(results.len(), 3);
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_fetch_all_respects_parent_deadline() {
        let ctx = FetchContext::background().with_timeout(Duration::from_millis(60));
        let providers = vec![stub("fast", 0), stub("slow", 10_000), stub("also-fast", 5)];

        let start = Instant::now();
        let results = fetch_all(&ctx, &providers, PROVIDER_TIMEOUT).await;
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
        assert_eq!(names(&results), vec!["fast", "slow", "also-fast"]);
        assert_eq!(results[0].error, None);
        assert_eq!(results[1].error, Some(FetchError::DeadlineExceeded));
        assert_eq!(results[2].error, None);
    }

    #[tokio::test]
    async fn test_fetch_all_per_provider_timeout() {
        let providers = vec![stub("slow", 10_000), stub("fast", 0)];

        let results = fetch_all(
            &FetchContext::background(),
            &providers,
            Duration::from_millis(40),
        )
        .await;

        assert_eq!(results[0].error, Some(FetchError::DeadlineExceeded));
        assert_eq!(results[0].short.as_deref(), Some("?"));
        assert_eq!(results[1].error, None);
    }

    #[tokio::test]
    async fn test_fetch_all_parent_cancel() {
        let ctx = FetchContext::background();
        let providers = vec![stub("slow", 10_000), stub("slower", 20_000)];

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let results = fetch_all(&ctx, &providers, PROVIDER_TIMEOUT).await;

        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(results
            .iter()
            .all(|r| r.error == Some(FetchError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_fetch_all_empty() {
        let results = fetch_all(&FetchContext::background(), &[], PROVIDER_TIMEOUT).await;
        assert!(results.is_empty());
    }
}
