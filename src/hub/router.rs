//! # HubRouter: the guarded call path to a hub.
//!
//! ```text
//! call(req, op)
//!   select_hub(req) ──► breaker "hub:<id>" ──► retry(preset) ──► op(hub, ctx)
//! ```
//!
//! The breaker counts the whole retry loop as one call. Errors come back as
//! [`GatewayError`], so callers decide on a fallback with
//! [`GatewayError::is_retryable`].

use std::future::Future;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::hub::balancer::{HubBalancer, RouteRequest};
use crate::hub::breaker_name;
use crate::hub::record::HubRecord;
use crate::resilience::{ResilienceRegistry, RetryContext, guarded};

/// Routes calls to hubs through breakers and retries.
pub struct HubRouter {
    balancer: Arc<HubBalancer>,
    registry: Arc<ResilienceRegistry>,
    retry: String,
}

impl HubRouter {
    /// Router using the `network` retry preset.
    pub fn new(balancer: Arc<HubBalancer>, registry: Arc<ResilienceRegistry>) -> Self {
        Self {
            balancer,
            registry,
            retry: "network".to_string(),
        }
    }

    /// Uses the retry policy registered (or preset) under `name`.
    pub fn with_retry(mut self, name: impl Into<String>) -> Self {
        self.retry = name.into();
        self
    }

    /// Balancer this router selects from.
    pub fn balancer(&self) -> &Arc<HubBalancer> {
        &self.balancer
    }

    /// Selects a hub for `req` and runs `op` against it under the hub's breaker
    /// and the configured retry policy.
    pub async fn call<T, F, Fut>(&self, req: &RouteRequest, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut(&HubRecord, RetryContext) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let hub = self.balancer.select_hub(req).await?;
        let breaker = self.registry.breaker(&breaker_name(&hub.hub_id));
        let retry = self.registry.retry(&self.retry);
        let result = guarded(&breaker, &retry, |ctx| op(&hub, ctx))
            .await
            .map_err(GatewayError::from);
        if let Err(e) = &result {
            tracing::warn!(hub = %hub.hub_id, error = %e, retryable = e.is_retryable(), "hub call failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::hub::balancer::BalancerConfig;
    use crate::hub::record::HubType;
    use crate::resilience::{BreakerConfig, RetryConfig};
    use crate::policies::{BackoffPolicy, JitterPolicy};

    async fn router(threshold: u32) -> HubRouter {
        let balancer = Arc::new(HubBalancer::new(BalancerConfig::default()));
        balancer
            .add_hub(HubRecord::new("p1", HubType::Primary, "eu", 100))
            .await
            .unwrap();
        let registry = Arc::new(ResilienceRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            ..BreakerConfig::default()
        }));
        HubRouter::new(balancer, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let router = router(5).await;
        let calls = AtomicU32::new(0);
        let out = router
            .call(&RouteRequest::default(), |hub, ctx| {
                let id = hub.hub_id.clone();
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(GatewayError::Transport("connection reset".into()))
                    } else {
                        Ok(format!("{id}@{}", ctx.attempt))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "p1@2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_surfaces_as_circuit_open() {
        let router = router(1).await;
        router.registry.register_retry(
            "none",
            RetryConfig {
                max_retries: 0,
                backoff: BackoffPolicy {
                    jitter: JitterPolicy::None,
                    ..BackoffPolicy::default()
                },
                condition: None,
            },
        );
        let router = router.with_retry("none");

        let err = router
            .call(&RouteRequest::default(), |_, _| async {
                Err::<(), _>(GatewayError::Timeout(Duration::from_secs(1)))
            })
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout(Duration::from_secs(1)));

        let err = router
            .call(&RouteRequest::default(), |_, _| async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::CircuitOpen("hub:p1".into()));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_no_hub_is_terminal() {
        let router = router(5).await;
        router
            .balancer()
            .set_health("p1", crate::hub::HealthStatus::Maintenance)
            .await
            .unwrap();
        let err = router
            .call(&RouteRequest::default(), |_, _| async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::NoAvailableHubs);
        assert!(!err.is_retryable());
    }
}
