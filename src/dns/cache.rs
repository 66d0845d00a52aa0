//! Bounded, TTL-aware caching decorator over an inner `Resolver`.
//!
//! Grounded on `segmentedproxy.resolver.CachingResolver`: same
//! lock-around-the-map-only discipline (the inner resolve call happens
//! without the lock held), same FIFO-on-insertion eviction, generalized
//! to clamp TTLs into `[MIN_TTL, MAX_TTL]` and to skip caching a
//! zero-TTL answer.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use mea::mutex::Mutex;

use super::{MAX_TTL, MIN_TTL, ResolveResult, Resolver, ResolverError};

struct CacheEntry {
    expires_at: Instant,
    addrs: Vec<(u8, String)>,
}

struct CacheState {
    map: HashMap<(String, u16), CacheEntry>,
    order: VecDeque<(String, u16)>,
}

pub struct CachingResolver {
    inner: Arc<dyn Resolver>,
    max_entries: usize,
    state: Mutex<CacheState>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn Resolver>, max_entries: usize) -> Self {
        CachingResolver {
            inner,
            max_entries,
            state: Mutex::new(CacheState {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        smol::block_on(self.state.lock()).map.len()
    }
}

#[async_trait]
impl Resolver for CachingResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<ResolveResult, ResolverError> {
        if self.max_entries == 0 {
            return self.inner.resolve(host, port).await;
        }

        let key = (host.to_ascii_lowercase(), port);
        let now = Instant::now();

        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.map.get(&key) {
                if now < entry.expires_at {
                    let remaining = entry.expires_at.saturating_duration_since(now).as_secs() as u32;
                    return Ok(ResolveResult {
                        addrs: entry.addrs.clone(),
                        ttl_seconds: remaining,
                    });
                }
                state.map.remove(&key);
                state.order.retain(|k| k != &key);
            }
        }

        let result = self.inner.resolve(host, port).await?;

        if result.ttl_seconds > 0 {
            let clamped = result.ttl_seconds.clamp(MIN_TTL, MAX_TTL);
            let expires_at = now + std::time::Duration::from_secs(clamped as u64);

            let mut state = self.state.lock().await;
            if !state.map.contains_key(&key) && state.map.len() >= self.max_entries {
                if let Some(oldest) = state.order.pop_front() {
                    state.map.remove(&oldest);
                }
            }
            if !state.map.contains_key(&key) {
                state.order.push_back(key.clone());
            }
            state.map.insert(
                key,
                CacheEntry {
                    expires_at,
                    addrs: result.addrs.clone(),
                },
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        ttl: u32,
    }

    #[async_trait]
    impl Resolver for CountingResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> Result<ResolveResult, ResolverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolveResult {
                addrs: vec![(4, "1.2.3.4".into())],
                ttl_seconds: self.ttl,
            })
        }
    }

    #[test]
    fn caches_within_ttl() {
        smol::block_on(async {
            let inner = Arc::new(CountingResolver {
                calls: AtomicUsize::new(0),
                ttl: 60,
            });
            let cache = CachingResolver::new(inner.clone(), 10);
            cache.resolve("Example.com", 80).await.unwrap();
            cache.resolve("example.com", 80).await.unwrap();
            assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn zero_ttl_disables_caching() {
        smol::block_on(async {
            let inner = Arc::new(CountingResolver {
                calls: AtomicUsize::new(0),
                ttl: 0,
            });
            let cache = CachingResolver::new(inner.clone(), 10);
            cache.resolve("example.com", 80).await.unwrap();
            cache.resolve("example.com", 80).await.unwrap();
            assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn capacity_is_never_exceeded_and_evicts_fifo() {
        smol::block_on(async {
            let inner = Arc::new(CountingResolver {
                calls: AtomicUsize::new(0),
                ttl: 60,
            });
            let cache = CachingResolver::new(inner.clone(), 2);
            cache.resolve("a.com", 80).await.unwrap();
            cache.resolve("b.com", 80).await.unwrap();
            cache.resolve("c.com", 80).await.unwrap();
            assert_eq!(cache.len(), 2);
            // "a.com" was evicted first; re-resolving it must miss again.
            let before = inner.calls.load(Ordering::SeqCst);
            cache.resolve("a.com", 80).await.unwrap();
            assert_eq!(inner.calls.load(Ordering::SeqCst), before + 1);
        });
    }

    #[test]
    fn pass_through_when_max_entries_is_zero() {
        smol::block_on(async {
            let inner = Arc::new(CountingResolver {
                calls: AtomicUsize::new(0),
                ttl: 60,
            });
            let cache = CachingResolver::new(inner.clone(), 0);
            cache.resolve("example.com", 80).await.unwrap();
            cache.resolve("example.com", 80).await.unwrap();
            assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        });
    }
}
