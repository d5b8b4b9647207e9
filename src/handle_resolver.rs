//! Resolution of persistent identifiers over HTTP
//!
//! Every URI is probed with a single HEAD request; the final status code (after at
//! most a few redirects) or the failure kind is remembered for the lifetime of the
//! resolver. Concurrent probes of the same URI are collapsed into one request.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::cache::{CachePolicy, Fetcher, MaxAge, MemoryStore, SingleFlightFetchCache};
use crate::error::{FetchError, InitializationError};
use crate::http_client::{HttpClient, HttpClientConfig};

pub const DEFAULT_HANDLE_CACHE_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct HandleResolverConfig {
    pub http: HttpClientConfig,
    pub cache_size: usize,
}

impl Default for HandleResolverConfig {
    fn default() -> Self {
        Self {
            http: HttpClientConfig::for_handles(),
            cache_size: DEFAULT_HANDLE_CACHE_SIZE,
        }
    }
}

/// Issues the HEAD requests and keeps the request counters
pub struct HandleProbe {
    client: HttpClient,
    timeouts: AtomicU64,
    unknown_hosts: AtomicU64,
    errors: AtomicU64,
    current: AtomicUsize,
}

impl HandleProbe {
    pub fn new(config: HttpClientConfig) -> Result<Self, InitializationError> {
        Ok(Self {
            client: HttpClient::new(config)?,
            timeouts: AtomicU64::new(0),
            unknown_hosts: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            current: AtomicUsize::new(0),
        })
    }
}

impl Fetcher for HandleProbe {
    type Output = u16;

    fn fetch(&self, uri: &str) -> Result<u16, FetchError> {
        self.current.fetch_add(1, Ordering::Relaxed);
        let outcome = self.client.head(uri);
        self.current.fetch_sub(1, Ordering::Relaxed);

        match &outcome {
            Ok(status) => debug!("HEAD {} -> {}", uri, status),
            Err(FetchError::Timeout { .. }) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!("timeout while resolving '{}'", uri);
            }
            Err(FetchError::UnknownHost { host, .. }) => {
                self.unknown_hosts.fetch_add(1, Ordering::Relaxed);
                debug!("unknown host '{}' while resolving '{}'", host, uri);
            }
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                debug!("error while resolving '{}': {}", uri, err);
            }
        }
        outcome
    }
}

/// Resolver counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub timeouts: u64,
    pub unknown_hosts: u64,
    pub errors: u64,
    /// Calls to [`HandleResolver::resolve`]
    pub total_requests: u64,
    /// HEAD requests on the wire right now
    pub current_requests: usize,
    pub cache_size: usize,
}

pub struct HandleResolver {
    cache: SingleFlightFetchCache<HandleProbe, MemoryStore<u16>>,
    total: AtomicU64,
}

impl HandleResolver {
    pub fn new(config: HandleResolverConfig) -> Result<Self, InitializationError> {
        let probe = HandleProbe::new(config.http)?;
        let policy = CachePolicy {
            max_age: MaxAge::Unlimited,
            negative_max_age: MaxAge::Unlimited,
        };
        Ok(Self {
            cache: SingleFlightFetchCache::new(probe, MemoryStore::new(config.cache_size), policy),
            total: AtomicU64::new(0),
        })
    }

    /// Status code `uri` answers with, or why it could not be reached
    pub fn resolve(&self, uri: &str) -> Result<u16, FetchError> {
        trace!("resolving '{}'", uri);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.cache.resolve(uri)
    }

    pub fn statistics(&self) -> ResolverStats {
        let cache = self.cache.stats();
        let probe = self.cache.fetcher();
        ResolverStats {
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            timeouts: probe.timeouts.load(Ordering::Relaxed),
            unknown_hosts: probe.unknown_hosts.load(Ordering::Relaxed),
            errors: probe.errors.load(Ordering::Relaxed),
            total_requests: self.total.load(Ordering::Relaxed),
            current_requests: probe.current.load(Ordering::Relaxed),
            cache_size: cache.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tokio::runtime::Runtime;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver() -> HandleResolver {
        HandleResolver::new(HandleResolverConfig::default()).unwrap()
    }

    #[test]
    fn test_status_is_cached() {
        let runtime = Runtime::new().unwrap();
        let server = runtime.block_on(MockServer::start());
        runtime.block_on(
            Mock::given(method("HEAD"))
                .and(path("/1839/00-0000"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server),
        );

        let resolver = resolver();
        let uri = format!("{}/1839/00-0000", server.uri());
        assert_eq!(resolver.resolve(&uri), Ok(200));
        assert_eq!(resolver.resolve(&uri), Ok(200));

        let stats = resolver.statistics();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_size, 1);
        assert_eq!(stats.current_requests, 0);

        runtime.block_on(server.verify());
    }

    #[test]
    fn test_concurrent_probes_collapse() {
        let runtime = Runtime::new().unwrap();
        let server = runtime.block_on(MockServer::start());
        runtime.block_on(
            Mock::given(method("HEAD"))
                .and(path("/slow"))
                .respond_with(ResponseTemplate::new(404).set_delay(Duration::from_millis(200)))
                .expect(1)
                .mount(&server),
        );

        let resolver = Arc::new(resolver());
        let uri = format!("{}/slow", server.uri());
        let barrier = Arc::new(Barrier::new(6));
        let threads: Vec<_> = (0..6)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let barrier = Arc::clone(&barrier);
                let uri = uri.clone();
                thread::spawn(move || {
                    barrier.wait();
                    resolver.resolve(&uri)
                })
            })
            .collect();

        for t in threads {
            assert_eq!(t.join().unwrap(), Ok(404));
        }
        assert_eq!(resolver.statistics().total_requests, 6);
        runtime.block_on(server.verify());
    }

    #[test]
    fn test_failures_are_counted_and_kept() {
        let runtime = Runtime::new().unwrap();
        let server = runtime.block_on(MockServer::start());
        runtime.block_on(
            Mock::given(method("HEAD"))
                .and(path("/stuck"))
                .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
                .mount(&server),
        );

        let resolver = HandleResolver::new(HandleResolverConfig {
            http: HttpClientConfig {
                connect_timeout: Duration::from_millis(100),
                read_timeout: Duration::from_millis(100),
                ..HttpClientConfig::for_handles()
            },
            cache_size: 4,
        })
        .unwrap();

        let uri = format!("{}/stuck", server.uri());
        assert!(matches!(resolver.resolve(&uri), Err(FetchError::Timeout { .. })));
        assert!(matches!(resolver.resolve(&uri), Err(FetchError::Timeout { .. })));

        let stats = resolver.statistics();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.errors, 0);
    }
}
