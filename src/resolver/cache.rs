//! API server address cache
//!
//! Holds the addresses published in the Endpoints object and hands them to
//! lookups for the configured host. The cache moves through three states:
//!
//! - **empty**: lookups go to the system resolver; a successful answer
//!   seeds the first refresh.
//! - **unconsumed**: a refresh just stored a new set. The next lookup gets
//!   it in stored order (local address first) and stamps it fresh.
//! - **consumed**: a further lookup means the previous address did not
//!   work out, so the set is reshuffled and a refresh is started.
//!
//! Refreshes run as detached tasks, at most one at a time. Failed refreshes
//! keep the set until it has gone unrefreshed for longer than the stale
//! timeout, after which the cache empties and lookups fall back again.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::endpoints::EndpointSource;
use super::local::{local_addresses, move_first_local_to_front};
use crate::lookup::{IpFamily, LookupError, LookupIp};

/// Default time cached addresses survive without a successful refresh
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(100);

/// Returns the addresses bound to this host
pub type LocalProbe = Arc<dyn Fn() -> HashSet<IpAddr> + Send + Sync>;

/// Host and port the cache answers for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.trim_end_matches('.').to_ascii_lowercase(),
            port,
        }
    }

    /// Case-insensitive, trailing dot ignored
    pub fn matches(&self, host: &str) -> bool {
        host.trim_end_matches('.').eq_ignore_ascii_case(&self.host)
    }
}

/// Tuning knobs for [`AddressCache`]
#[derive(Clone)]
pub struct CacheOptions {
    pub stale_timeout: Duration,

    /// Seed for the shuffles; entropy when unset
    pub seed: Option<u64>,

    pub local_probe: LocalProbe,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            seed: None,
            local_probe: Arc::new(local_addresses),
        }
    }
}

impl CacheOptions {
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_local_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> HashSet<IpAddr> + Send + Sync + 'static,
    {
        self.local_probe = Arc::new(probe);
        self
    }
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("stale_timeout", &self.stale_timeout)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub addresses: Vec<IpAddr>,
    /// Whether a lookup consumed the current set already
    pub consumed: bool,
    pub refreshing: bool,
}

struct CacheState {
    addrs: Vec<IpAddr>,
    /// Set by the first lookup after the set changed
    fresh_since: Option<Instant>,
    rng: StdRng,
}

impl CacheState {
    fn replace(&mut self, addrs: Vec<IpAddr>) {
        self.addrs = addrs;
        self.fresh_since = None;
    }
}

struct Inner {
    target: Target,
    stale_timeout: Duration,
    state: Mutex<CacheState>,
    refreshing: AtomicBool,
    system: Arc<dyn LookupIp>,
    source: Arc<dyn EndpointSource>,
    local_probe: LocalProbe,
}

/// Clears the in-flight flag when the refresh ends, however it ends
struct RefreshGuard {
    inner: Arc<Inner>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.inner.refreshing.store(false, Ordering::Release);
    }
}

/// Shared handle to the address cache
#[derive(Clone)]
pub struct AddressCache {
    inner: Arc<Inner>,
}

impl AddressCache {
    pub fn new(
        target: Target,
        system: Arc<dyn LookupIp>,
        source: Arc<dyn EndpointSource>,
        options: CacheOptions,
    ) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            inner: Arc::new(Inner {
                target,
                stale_timeout: options.stale_timeout,
                state: Mutex::new(CacheState {
                    addrs: Vec::new(),
                    fresh_since: None,
                    rng,
                }),
                refreshing: AtomicBool::new(false),
                system,
                source,
                local_probe: options.local_probe,
            }),
        }
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.state();
        CacheSnapshot {
            addresses: state.addrs.clone(),
            consumed: state.fresh_since.is_some(),
            refreshing: self.is_refreshing(),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refreshing.load(Ordering::Acquire)
    }

    /// Resolve `host`. Only the target host is served from the cache.
    pub async fn lookup_ip(&self, family: IpFamily, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        if !self.inner.target.matches(host) {
            trace!("Host {} is not {}, using system resolver", host, self.inner.target.host);
            return self.inner.system.lookup_ip(family, host).await;
        }

        match self.consume() {
            Some((addrs, refresh)) => {
                if refresh {
                    self.spawn_refresh();
                }
                trace!("Host {} resolves to {:?}", host, addrs);
                Ok(addrs.into_iter().filter(|ip| family.matches(ip)).collect())
            }
            None => {
                debug!("Address cache empty, using system resolver for {}", host);
                let addrs = self.inner.system.lookup_ip(family, host).await?;
                if !addrs.is_empty() {
                    self.spawn_refresh();
                }
                Ok(addrs)
            }
        }
    }

    /// Hand out the current set. Returns whether a refresh is due.
    fn consume(&self) -> Option<(Vec<IpAddr>, bool)> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.addrs.is_empty() {
            return None;
        }

        let refresh = match state.fresh_since {
            None => {
                state.fresh_since = Some(Instant::now());
                false
            }
            Some(_) => {
                reshuffle(&mut state.addrs, &mut state.rng);
                true
            }
        };
        Some((state.addrs.clone(), refresh))
    }

    /// Fetch the Endpoints and update the cache. Returns `false` without
    /// doing anything when another refresh is already running.
    pub async fn refresh(&self) -> bool {
        let Some(_guard) = self.try_begin_refresh() else {
            debug!("Refresh already in flight");
            return false;
        };
        self.run_refresh().await;
        true
    }

    fn spawn_refresh(&self) {
        if let Some(guard) = self.try_begin_refresh() {
            let cache = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                cache.run_refresh().await;
            });
        }
    }

    fn try_begin_refresh(&self) -> Option<RefreshGuard> {
        self.inner
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard {
                inner: self.inner.clone(),
            })
    }

    async fn run_refresh(&self) {
        let endpoints = match self.inner.source.fetch_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                let mut state = self.state();
                if state.addrs.is_empty() {
                    debug!("Endpoints fetch failed with empty cache: {}", e);
                    return;
                }

                let stale = state
                    .fresh_since
                    .map_or(false, |since| since.elapsed() > self.inner.stale_timeout);
                if stale {
                    warn!(
                        "No successful refresh of {}:{} for {:?}, falling back to system resolver: {}",
                        self.inner.target.host, self.inner.target.port, self.inner.stale_timeout, e
                    );
                    state.replace(Vec::new());
                } else {
                    debug!("Endpoints fetch failed, keeping {:?}: {}", state.addrs, e);
                }
                return;
            }
        };

        let mut ips = match endpoints.addresses_for_port(self.inner.target.port) {
            Ok(ips) => ips,
            Err(e) => {
                warn!("Unsupported endpoints for {}: {}", self.inner.target.host, e);
                self.state().replace(Vec::new());
                return;
            }
        };

        let mut seen = HashSet::new();
        ips.retain(|ip| seen.insert(*ip));

        if ips.is_empty() {
            debug!("Endpoints publish no addresses, cache unchanged");
            return;
        }

        if ips.len() == 1 {
            debug!("Address cache updated: {:?}", ips);
            self.state().replace(ips);
            return;
        }

        let local = (self.inner.local_probe)();
        let mut state = self.state();
        ips.shuffle(&mut state.rng);
        if move_first_local_to_front(&mut ips, &local) {
            trace!("Local address {} moved to front", ips[0]);
        }
        debug!("Address cache updated: {:?}", ips);
        state.replace(ips);
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LookupIp for AddressCache {
    async fn lookup_ip(&self, family: IpFamily, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        AddressCache::lookup_ip(self, family, host).await
    }
}

impl std::fmt::Debug for AddressCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressCache")
            .field("target", &self.inner.target)
            .field("stale_timeout", &self.inner.stale_timeout)
            .field("addresses", &self.state().addrs)
            .finish()
    }
}

/// Shuffle into an order different from the current one.
/// Entries must be distinct.
fn reshuffle(addrs: &mut [IpAddr], rng: &mut StdRng) {
    if addrs.len() < 2 {
        return;
    }
    let before = addrs.to_vec();
    addrs.shuffle(rng);
    if addrs == before.as_slice() {
        addrs.rotate_left(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::endpoints::{Endpoints, FetchError};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn sorted(mut ips: Vec<IpAddr>) -> Vec<IpAddr> {
        ips.sort();
        ips
    }

    struct FakeSystem {
        ips: Vec<IpAddr>,
        calls: AtomicUsize,
    }

    impl FakeSystem {
        fn new(ips: Vec<IpAddr>) -> Arc<Self> {
            Arc::new(Self {
                ips,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LookupIp for FakeSystem {
        async fn lookup_ip(&self, family: IpFamily, host: &str) -> Result<Vec<IpAddr>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ips: Vec<IpAddr> = self.ips.iter().copied().filter(|ip| family.matches(ip)).collect();
            if ips.is_empty() {
                return Err(LookupError::NotFound {
                    host: host.to_string(),
                });
            }
            Ok(ips)
        }
    }

    struct FakeSource {
        endpoints: Mutex<Option<Endpoints>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(endpoints: Option<Endpoints>) -> Arc<Self> {
            Self::with_delay(endpoints, Duration::ZERO)
        }

        fn with_delay(endpoints: Option<Endpoints>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                endpoints: Mutex::new(endpoints),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        /// `None` makes every fetch fail
        fn set(&self, endpoints: Option<Endpoints>) {
            *self.endpoints.lock().unwrap() = endpoints;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EndpointSource for FakeSource {
        async fn fetch_endpoints(&self) -> Result<Endpoints, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.endpoints
                .lock()
                .unwrap()
                .clone()
                .ok_or(FetchError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE))
        }
    }

    fn cache_with(
        system: Arc<FakeSystem>,
        source: Arc<FakeSource>,
        options: CacheOptions,
    ) -> AddressCache {
        AddressCache::new(Target::new("cluster.local", 6443), system, source, options)
    }

    fn no_local() -> CacheOptions {
        CacheOptions::default().with_local_probe(HashSet::new)
    }

    async fn wait_for_refreshes(cache: &AddressCache, source: &FakeSource, calls: usize) {
        for _ in 0..200 {
            if source.calls() >= calls && !cache.is_refreshing() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("refresh did not complete");
    }

    #[test]
    fn test_target_matching() {
        let target = Target::new("Cluster.Local.", 6443);
        assert_eq!(target.host, "cluster.local");
        assert!(target.matches("cluster.local"));
        assert!(target.matches("CLUSTER.local."));
        assert!(!target.matches("api.cluster.local"));
        assert!(!target.matches("cluster.local.example"));
    }

    #[test]
    fn test_reshuffle_always_changes_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut addrs = vec![ip(1), ip(2)];
        for _ in 0..50 {
            let before = addrs.clone();
            reshuffle(&mut addrs, &mut rng);
            assert_ne!(addrs, before);
            assert_eq!(sorted(addrs.clone()), sorted(before));
        }

        let mut single = vec![ip(1)];
        reshuffle(&mut single, &mut rng);
        assert_eq!(single, vec![ip(1)]);
    }

    #[tokio::test]
    async fn test_other_hosts_pass_through() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(1)], 6443)])));
        let cache = cache_with(system.clone(), source.clone(), no_local());

        let ips = cache.lookup_ip(IpFamily::Any, "example.com").await.unwrap();
        assert_eq!(ips, vec![ip(99)]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(source.calls(), 0);
        assert!(cache.snapshot().addresses.is_empty());
    }

    #[tokio::test]
    async fn test_empty_cache_falls_back_and_seeds_refresh() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(1), ip(2)], 6443)])));
        let cache = cache_with(system.clone(), source.clone(), no_local());

        let ips = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
        assert_eq!(ips, vec![ip(99)]);
        assert_eq!(system.calls.load(Ordering::SeqCst), 1);

        wait_for_refreshes(&cache, &source, 1).await;
        let snapshot = cache.snapshot();
        assert_eq!(sorted(snapshot.addresses), vec![ip(1), ip(2)]);
        assert!(!snapshot.consumed);

        let ips = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
        assert_eq!(sorted(ips), vec![ip(1), ip(2)]);
        assert_eq!(system.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_error_propagates() {
        let system = FakeSystem::new(Vec::new());
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(1)], 6443)])));
        let cache = cache_with(system, source.clone(), no_local());

        let err = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap_err();
        assert!(matches!(err, LookupError::NotFound { .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_first_read_keeps_order_then_reshuffles() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(
            vec![ip(1), ip(2), ip(3)],
            6443,
        )])));
        let cache = cache_with(system, source.clone(), no_local().with_seed(Some(42)));

        assert!(cache.refresh().await);
        let stored = cache.snapshot().addresses;

        let first = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
        assert_eq!(first, stored);
        assert!(cache.snapshot().consumed);
        assert_eq!(source.calls(), 1);

        let second = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
        assert_ne!(second, first);
        assert_eq!(sorted(second), sorted(first));

        // The second read starts a refresh, which resets freshness
        wait_for_refreshes(&cache, &source, 2).await;
        assert!(!cache.snapshot().consumed);
    }

    #[tokio::test]
    async fn test_family_filter() {
        let v6: IpAddr = "fd00::1".parse().unwrap();
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(1), v6], 6443)])));
        let cache = cache_with(system, source, no_local());
        cache.refresh().await;

        let ips = cache.lookup_ip(IpFamily::V6, "cluster.local").await.unwrap();
        assert_eq!(ips, vec![v6]);
    }

    #[tokio::test]
    async fn test_fresh_cache_survives_fetch_errors() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(1), ip(2)], 6443)])));
        let cache = cache_with(system, source.clone(), no_local());

        cache.refresh().await;
        cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();

        source.set(None);
        assert!(cache.refresh().await);
        assert_eq!(sorted(cache.snapshot().addresses), vec![ip(1), ip(2)]);
    }

    #[tokio::test]
    async fn test_stale_cache_falls_back_to_system() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(1), ip(2)], 6443)])));
        let options = no_local().with_stale_timeout(Duration::from_millis(50));
        let cache = cache_with(system.clone(), source.clone(), options);

        cache.refresh().await;
        cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
        assert!(cache.snapshot().consumed);

        source.set(None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.refresh().await);
        assert!(cache.snapshot().addresses.is_empty());

        let ips = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
        assert_eq!(ips, vec![ip(99)]);
        assert_eq!(system.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unconsumed_cache_never_goes_stale() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(1)], 6443)])));
        let options = no_local().with_stale_timeout(Duration::from_millis(10));
        let cache = cache_with(system, source.clone(), options);

        cache.refresh().await;
        source.set(None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.refresh().await;
        assert_eq!(cache.snapshot().addresses, vec![ip(1)]);
    }

    #[tokio::test]
    async fn test_fetch_error_with_empty_cache_is_noop() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(None);
        let cache = cache_with(system, source.clone(), no_local());

        assert!(cache.refresh().await);
        assert_eq!(source.calls(), 1);
        assert!(cache.snapshot().addresses.is_empty());
    }

    #[tokio::test]
    async fn test_port_mismatch_clears_cache() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(1), ip(2)], 6443)])));
        let cache = cache_with(system, source.clone(), no_local());

        cache.refresh().await;
        cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
        assert!(!cache.snapshot().addresses.is_empty());

        source.set(Some(Endpoints::from_subsets([
            (vec![ip(1)], 6443),
            (vec![ip(2)], 8443),
        ])));
        cache.refresh().await;

        let snapshot = cache.snapshot();
        assert!(snapshot.addresses.is_empty());
        assert!(!snapshot.consumed);

        let ips = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
        assert_eq!(ips, vec![ip(99)]);
    }

    #[tokio::test]
    async fn test_empty_endpoints_keep_cache() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(1)], 6443)])));
        let cache = cache_with(system, source.clone(), no_local());

        cache.refresh().await;
        source.set(Some(Endpoints::default()));
        cache.refresh().await;
        assert_eq!(cache.snapshot().addresses, vec![ip(1)]);
    }

    #[tokio::test]
    async fn test_single_address() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(vec![ip(7), ip(7)], 6443)])));
        let cache = cache_with(system, source, no_local());

        cache.refresh().await;
        for _ in 0..3 {
            let ips = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
            assert_eq!(ips, vec![ip(7)]);
        }
    }

    #[tokio::test]
    async fn test_local_address_first() {
        let ips = vec![ip(1), ip(2), ip(3), ip(4)];
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(ips.clone(), 6443)])));

        let local = CacheOptions::default().with_local_probe(|| [ip(3)].into_iter().collect());
        let cache = cache_with(system.clone(), source.clone(), local);
        let mut seconds = HashMap::new();
        for _ in 0..200 {
            cache.refresh().await;
            let order = cache.snapshot().addresses;
            assert_eq!(order[0], ip(3));
            assert_eq!(sorted(order.clone()), ips);
            *seconds.entry(order[1]).or_insert(0) += 1;
        }
        // The rest stay shuffled behind the local address
        assert_eq!(seconds.len(), 3);

        let cache = cache_with(system, source, no_local());
        let mut firsts = HashMap::new();
        for _ in 0..200 {
            cache.refresh().await;
            *firsts.entry(cache.snapshot().addresses[0]).or_insert(0) += 1;
        }
        assert_eq!(firsts.len(), 4);
        assert!(firsts.values().all(|&n| n >= 10), "skewed distribution {:?}", firsts);
    }

    #[tokio::test]
    async fn test_repeated_lookups_with_local_address() {
        let ips = vec![ip(1), ip(2), ip(3), ip(4)];
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(ips.clone(), 6443)])));
        let local = CacheOptions::default().with_local_probe(|| [ip(3)].into_iter().collect());
        let cache = cache_with(system.clone(), source, local);
        assert!(cache.refresh().await);

        let mut orders = HashSet::new();
        let mut local_first = 0;
        for _ in 0..30 {
            let order = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
            assert_eq!(sorted(order.clone()), ips);
            if order[0] == ip(3) {
                local_first += 1;
            }
            orders.insert(order);

            for _ in 0..200 {
                if !cache.is_refreshing() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(!cache.is_refreshing(), "refresh did not complete");
        }

        assert!(local_first > 0, "local address never came first");
        assert!(orders.len() > 1, "order never changed: {:?}", orders);
        assert_eq!(system.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_resolution() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::new(Some(Endpoints::from_subsets([(
            vec![ip(1), ip(2)],
            6443,
        )])));
        let cache = cache_with(system.clone(), source, no_local().with_seed(Some(7)));

        cache.refresh().await;
        let ips = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
        assert_eq!(sorted(ips.clone()), vec![ip(1), ip(2)]);

        let again = cache.lookup_ip(IpFamily::Any, "CLUSTER.LOCAL.").await.unwrap();
        assert_eq!(again, vec![ips[1], ips[0]]);
        assert_eq!(system.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_refresh_is_exclusive() {
        let system = FakeSystem::new(vec![ip(99)]);
        let source = FakeSource::with_delay(
            Some(Endpoints::from_subsets([(vec![ip(1), ip(2)], 6443)])),
            Duration::from_millis(100),
        );
        let cache = cache_with(system, source.clone(), no_local());

        let (a, b) = tokio::join!(cache.refresh(), cache.refresh());
        assert!(a ^ b);
        assert_eq!(source.calls(), 1);
        assert!(!cache.is_refreshing());

        // Lookups during a refresh neither block nor start another one
        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.is_refreshing());
        for _ in 0..5 {
            let ips = cache.lookup_ip(IpFamily::Any, "cluster.local").await.unwrap();
            assert_eq!(ips.len(), 2);
        }
        assert!(slow.await.unwrap());
        assert_eq!(source.calls(), 2);
    }
}
