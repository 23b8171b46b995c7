use std::any::Any;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinError;
use tracing::{debug, error};

use crate::core::cache::CacheStore;
use crate::core::error::QuotaError;
use crate::core::models::usage::{AllQuotas, ProviderQuota};
use crate::core::providers::{QuotaProvider, Registry};

/// Fans quota requests out over a [`Registry`].
///
/// Each provider runs on its own task, so a panic inside one provider
/// turns into that provider's error record and the rest still report.
#[derive(Clone)]
pub struct Aggregator {
    registry: Registry,
    cache: CacheStore,
}

impl Aggregator {
    pub fn new(registry: Registry, cache: CacheStore) -> Self {
        Self { registry, cache }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// One record per registered provider, in registration order.
    pub async fn get_all_quotas(&self) -> AllQuotas {
        let handles: Vec<_> = self
            .registry
            .iter()
            .map(|provider| {
                let task = Arc::clone(provider);
                (
                    Arc::clone(provider),
                    tokio::spawn(async move { task.get_quota().await }),
                )
            })
            .collect();

        let mut providers = Vec::with_capacity(handles.len());
        for (provider, handle) in handles {
            providers.push(settle(provider.as_ref(), handle.await));
        }

        AllQuotas {
            providers,
            fetched_at: Utc::now(),
        }
    }

    /// Same isolation as [`get_all_quotas`](Self::get_all_quotas) for a
    /// single provider. `None` for an unknown id.
    pub async fn get_quota_for(&self, id: &str) -> Option<ProviderQuota> {
        let provider = self.registry.get(id)?;
        let task = Arc::clone(&provider);
        let joined = tokio::spawn(async move { task.get_quota().await }).await;
        Some(settle(provider.as_ref(), joined))
    }

    /// Drop cached data for one provider, or for all of them.
    pub async fn invalidate(&self, id: Option<&str>) {
        for provider in self.registry.iter() {
            if id.is_some_and(|id| !provider.id().eq_ignore_ascii_case(id)) {
                continue;
            }
            for prefix in provider.cache_keys() {
                debug!(provider = provider.id(), prefix, "Invalidating cache");
                self.cache.invalidate_prefix(prefix).await;
            }
        }
    }

    /// Availability of each provider, probed concurrently.
    pub async fn availability(&self) -> Vec<(Arc<dyn QuotaProvider>, bool)> {
        let handles: Vec<_> = self
            .registry
            .iter()
            .map(|provider| {
                let task = Arc::clone(provider);
                (
                    Arc::clone(provider),
                    tokio::spawn(async move { task.is_available().await }),
                )
            })
            .collect();

        let mut out = Vec::with_capacity(handles.len());
        for (provider, handle) in handles {
            out.push((provider, handle.await.unwrap_or(false)));
        }
        out
    }
}

fn settle(provider: &dyn QuotaProvider, joined: Result<ProviderQuota, JoinError>) -> ProviderQuota {
    match joined {
        Ok(quota) => quota,
        Err(e) => {
            let message = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                "Quota task cancelled".to_string()
            };
            error!(provider = provider.id(), %message, "Provider failed");
            ProviderQuota::failed(provider.id(), provider.display_name(), &QuotaError::Unknown(message))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fake {
        id: &'static str,
        delay: Duration,
        calls: AtomicUsize,
        behavior: Behavior,
    }

    enum Behavior {
        Ok(u8),
        Panic,
        Fail,
    }

    impl Fake {
        fn new(id: &'static str, delay_ms: u64, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                id,
                delay: Duration::from_millis(delay_ms),
                calls: AtomicUsize::new(0),
                behavior,
            })
        }
    }

    #[async_trait]
    impl QuotaProvider for Fake {
        fn id(&self) -> &str {
            self.id
        }

        fn display_name(&self) -> &str {
            self.id
        }

        fn cache_keys(&self) -> &'static [&'static str] {
            match self.id {
                "a" => &["a-cache"],
                _ => &["b-cache"],
            }
        }

        async fn is_available(&self) -> bool {
            !matches!(self.behavior, Behavior::Fail)
        }

        async fn get_quota(&self) -> ProviderQuota {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match self.behavior {
                Behavior::Ok(remaining) => {
                    let mut q = ProviderQuota::available(self.id, self.id);
                    q.primary = Some(crate::core::models::usage::QuotaWindow::from_remaining_percent(
                        remaining as f64,
                        None,
                    ));
                    q
                }
                Behavior::Panic => panic!("provider {} exploded", self.id),
                Behavior::Fail => ProviderQuota::failed(self.id, self.id, &QuotaError::not_logged_in()),
            }
        }
    }

    fn registry(fakes: Vec<Arc<Fake>>) -> Registry {
        Registry::new(
            fakes
                .into_iter()
                .map(|f| f as Arc<dyn QuotaProvider>)
                .collect(),
        )
    }

    fn aggregator(fakes: Vec<Arc<Fake>>, dir: &std::path::Path) -> Aggregator {
        Aggregator::new(
            registry(fakes),
            CacheStore::new(dir, Duration::from_millis(200)),
        )
    }

    #[tokio::test]
    async fn order_follows_registration_not_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let agg = aggregator(
            vec![
                Fake::new("slow", 150, Behavior::Ok(10)),
                Fake::new("fast", 0, Behavior::Ok(20)),
                Fake::new("mid", 50, Behavior::Ok(30)),
            ],
            tmp.path(),
        );
        let all = agg.get_all_quotas().await;
        let ids: Vec<&str> = all.providers.iter().map(|p| p.provider.as_str()).collect();
        assert_eq!(ids, ["slow", "fast", "mid"]);
    }

    #[tokio::test]
    async fn providers_run_concurrently() {
        let tmp = tempfile::tempdir().unwrap();
        let agg = aggregator(
            vec![
                Fake::new("a", 300, Behavior::Ok(1)),
                Fake::new("b", 300, Behavior::Ok(2)),
                Fake::new("c", 300, Behavior::Ok(3)),
            ],
            tmp.path(),
        );
        let started = std::time::Instant::now();
        agg.get_all_quotas().await;
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn panicking_provider_is_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let agg = aggregator(
            vec![
                Fake::new("a", 0, Behavior::Ok(55)),
                Fake::new("boom", 0, Behavior::Panic),
                Fake::new("c", 0, Behavior::Fail),
            ],
            tmp.path(),
        );
        let all = agg.get_all_quotas().await;
        assert_eq!(all.providers.len(), 3);

        assert!(all.providers[0].available);
        assert_eq!(all.providers[0].primary.as_ref().unwrap().remaining, 55);

        let boom = &all.providers[1];
        assert_eq!(boom.provider, "boom");
        assert!(!boom.available);
        assert_eq!(boom.error.as_deref(), Some("provider boom exploded"));

        assert_eq!(all.providers[2].error.as_deref(), Some("Not logged in"));
    }

    #[tokio::test]
    async fn single_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = Fake::new("a", 0, Behavior::Ok(70));
        let agg = aggregator(vec![ok.clone(), Fake::new("boom", 0, Behavior::Panic)], tmp.path());

        let quota = agg.get_quota_for("A").await.unwrap();
        assert_eq!(quota.primary.unwrap().remaining, 70);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);

        let boom = agg.get_quota_for("boom").await.unwrap();
        assert!(!boom.available);
        assert!(boom.error.is_some());

        assert!(agg.get_quota_for("nope").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_targets_provider_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(tmp.path(), Duration::from_millis(200));
        cache.set("a-cache", &1u32, Duration::from_secs(60)).await;
        cache.set("a-cache-0123abcd", &3u32, Duration::from_secs(60)).await;
        cache.set("b-cache", &2u32, Duration::from_secs(60)).await;

        let agg = Aggregator::new(
            registry(vec![
                Fake::new("a", 0, Behavior::Ok(1)),
                Fake::new("b", 0, Behavior::Ok(2)),
            ]),
            cache.clone(),
        );

        agg.invalidate(Some("a")).await;
        assert_eq!(cache.get::<u32>("a-cache").await, None);
        assert_eq!(cache.get::<u32>("a-cache-0123abcd").await, None);
        assert_eq!(cache.get::<u32>("b-cache").await, Some(2));

        agg.invalidate(None).await;
        assert_eq!(cache.get::<u32>("b-cache").await, None);
    }

    #[tokio::test]
    async fn availability_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let agg = aggregator(
            vec![Fake::new("a", 0, Behavior::Ok(1)), Fake::new("c", 0, Behavior::Fail)],
            tmp.path(),
        );
        let avail: Vec<(String, bool)> = agg
            .availability()
            .await
            .into_iter()
            .map(|(p, ok)| (p.id().to_string(), ok))
            .collect();
        assert_eq!(avail, [("a".to_string(), true), ("c".to_string(), false)]);
    }
}
