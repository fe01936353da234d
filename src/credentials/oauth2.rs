//! The OAuth2 token cache core.
//!
//! [`OAuth2Core`] is the concurrency engine shared by every concrete
//! credential kind: an expiration-based state machine over a cached
//! [`AccessToken`], single-flight asynchronous refresh, and change-listener
//! fan-out. It holds no knowledge of *how* to refresh — that is supplied by
//! a [`TokenRefresher`] implementation per credential kind, embedded for
//! cache semantics rather than reached via a shared base type.
//!
//! Grounded on the single-flight `OnceCell`-in-`RwLock` pattern used by
//! `aws-smithy-runtime`'s `ExpiringCache`, adapted to a
//! `futures::future::Shared` so a three-way (fresh/stale/expired) staleness
//! model can let the STALE path fire-and-forget a refresh while the EXPIRED
//! path joins it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::clock::{Clock, SharedClock};
use crate::error::{ConfigError, Error, Result};
use crate::token::AccessToken;

/// Default margin (225s) below which a non-expired token is considered
/// STALE and an async refresh is scheduled.
pub const DEFAULT_REFRESH_MARGIN: ChronoDuration = ChronoDuration::seconds(225);

/// Default margin (300s) below which a token is considered EXPIRED
///.
pub const DEFAULT_EXPIRATION_MARGIN: ChronoDuration = ChronoDuration::seconds(300);

/// The derived freshness state of a cached token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No refresh needed.
    Fresh,
    /// Usable, but an async refresh should be kicked off.
    Stale,
    /// Not usable; a caller must join (or start) a refresh before it can
    /// use the result.
    Expired,
}

/// Implemented by each concrete credential kind to perform the actual
/// network round-trip that mints a new [`AccessToken`]. Invoked by
/// [`OAuth2Core`] under single-flight, never directly by a `Credentials`
/// caller.
#[async_trait]
pub trait TokenRefresher: Send + Sync + std::fmt::Debug {
    /// Performs the refresh. Implementations may consult `clock` for
    /// computing the new token's expiration but must not consult a
    /// different clock than the one their owning [`OAuth2Core`] uses, or
    /// the staleness math drifts.
    async fn refresh_access_token(&self, clock: &dyn Clock) -> Result<AccessToken>;
}

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<AccessToken, Arc<Error>>>>;

/// A change-listener callback, invoked once per successful refresh with the
/// new token.
pub type ChangeListener = Arc<dyn Fn(&AccessToken) + Send + Sync>;

/// An opaque handle returned by [`OAuth2Core::add_change_listener`], used to
/// remove that specific registration later. Rust closures have no stable
/// identity to key removal on, so registrations are tracked by a monotonic
/// handle instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

struct CoreState {
    token: Option<AccessToken>,
    inflight: Option<SharedRefresh>,
    listeners: Vec<(u64, ChangeListener)>,
}

/// The single-flight, expiration-aware token cache shared by reference
/// (`Arc<OAuth2Core>`) between the owning credential and any in-flight
/// refresh task.
#[derive(Debug)]
pub struct OAuth2Core {
    refresher: Arc<dyn TokenRefresher>,
    clock: SharedClock,
    refresh_margin: ChronoDuration,
    expiration_margin: ChronoDuration,
    state: Mutex<CoreState>,
    next_listener_id: AtomicU64,
}

impl std::fmt::Debug for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreState")
            .field("token", &self.token)
            .field("inflight", &self.inflight.is_some())
            .field("listener_count", &self.listeners.len())
            .finish()
    }
}

impl OAuth2Core {
    /// Builds a core with the default margins (225s/300s).
    pub fn new(refresher: Arc<dyn TokenRefresher>, clock: SharedClock) -> Arc<Self> {
        Self::with_margins(refresher, clock, DEFAULT_REFRESH_MARGIN, DEFAULT_EXPIRATION_MARGIN)
            .expect("default margins always satisfy refresh_margin > expiration_margin")
    }

    /// Builds a core with custom margins, enforcing `refresh_margin >
    /// expiration_margin`.
    pub fn with_margins(
        refresher: Arc<dyn TokenRefresher>,
        clock: SharedClock,
        refresh_margin: ChronoDuration,
        expiration_margin: ChronoDuration,
    ) -> Result<Arc<Self>> {
        if refresh_margin <= expiration_margin {
            return Err(Error::Config(ConfigError::InvalidCacheMargins {
                refresh_margin_secs: refresh_margin.num_seconds(),
                expiration_margin_secs: expiration_margin.num_seconds(),
            }));
        }
        Ok(Arc::new(Self {
            refresher,
            clock,
            refresh_margin,
            expiration_margin,
            state: Mutex::new(CoreState {
                token: None,
                inflight: None,
                listeners: Vec::new(),
            }),
            next_listener_id: AtomicU64::new(0),
        }))
    }

    /// The cached token, with no I/O.
    pub fn cached_token(&self) -> Option<AccessToken> {
        self.state.lock().unwrap().token.clone()
    }

    /// Resets the cached token, forcing the next call to refresh. Used by
    /// `createScoped`.
    pub fn invalidate(&self) {
        self.state.lock().unwrap().token = None;
    }

    /// Seeds the cache with an already-known token without performing a
    /// refresh or firing change listeners. Used by builders that accept a
    /// caller-supplied initial token (e.g.
    /// [`crate::credentials::with_refresh::OAuth2CredentialsWithRefresh`]).
    pub fn seed(&self, token: AccessToken) {
        self.state.lock().unwrap().token = Some(token);
    }

    /// Registers a change listener, returning a handle for later removal.
    /// Registration order is preserved; duplicates are permitted.
    pub fn add_change_listener(&self, listener: ChangeListener) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().listeners.push((id, listener));
        ListenerHandle(id)
    }

    /// Removes a previously registered listener. No-op if already removed.
    pub fn remove_change_listener(&self, handle: ListenerHandle) {
        self.state.lock().unwrap().listeners.retain(|(id, _)| *id != handle.0);
    }

    fn token_state(&self, token: &Option<AccessToken>) -> TokenState {
        let Some(token) = token else {
            return TokenState::Expired;
        };
        let Some(expiration) = token.expiration() else {
            return TokenState::Fresh;
        };
        let now = self.clock.now();
        if now >= expiration - self.expiration_margin {
            TokenState::Expired
        } else if now >= expiration - self.refresh_margin {
            TokenState::Stale
        } else {
            TokenState::Fresh
        }
    }

    /// Returns the in-flight refresh future, creating one under the lock if
    /// none exists. Returns whether a new one was created so callers on the
    /// STALE path know whether they need to spawn a driver task.
    fn get_or_start_refresh(self: &Arc<Self>) -> (SharedRefresh, bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = &state.inflight {
            return (existing.clone(), false);
        }
        let core = Arc::clone(self);
        let fut: BoxFuture<'static, std::result::Result<AccessToken, Arc<Error>>> = async move {
            let result = core.refresher.refresh_access_token(core.clock.as_ref()).await;
            match result {
                Ok(token) => {
                    let listeners = {
                        let mut state = core.state.lock().unwrap();
                        state.token = Some(token.clone());
                        state.listeners.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>()
                    };
                    for listener in &listeners {
                        listener(&token);
                    }
                    core.state.lock().unwrap().inflight = None;
                    Ok(token)
                }
                Err(e) => {
                    core.state.lock().unwrap().inflight = None;
                    Err(Arc::new(e))
                }
            }
        }
        .boxed();
        let shared = fut.shared();
        state.inflight = Some(shared.clone());
        (shared, true)
    }

    /// Returns a usable token: FRESH returns immediately, STALE schedules a
    /// background refresh and returns the still-valid token, EXPIRED joins
    /// (or starts) a refresh and retries once it settles.
    pub async fn ensure_fresh(self: &Arc<Self>) -> Result<AccessToken> {
        loop {
            let token = self.state.lock().unwrap().token.clone();
            match self.token_state(&token) {
                TokenState::Fresh => return Ok(token.expect("FRESH implies a cached token")),
                TokenState::Stale => {
                    let (shared, created) = self.get_or_start_refresh();
                    if created {
                        tokio::spawn(async move {
                            let _ = shared.await;
                        });
                    }
                    return Ok(token.expect("STALE implies a cached token"));
                }
                TokenState::Expired => {
                    let (shared, _created) = self.get_or_start_refresh();
                    match shared.await {
                        Ok(_) => continue,
                        Err(e) => return Err(Error::Shared(e)),
                    }
                }
            }
        }
    }

    /// Forces an unconditional refresh, still single-flighted against any
    /// refresh already in progress.
    pub async fn refresh(self: &Arc<Self>) -> Result<AccessToken> {
        let (shared, _created) = self.get_or_start_refresh();
        shared.await.map_err(Error::Shared)
    }

    /// Refreshes only if the cached token is currently EXPIRED.
    pub async fn refresh_if_expired(self: &Arc<Self>) -> Result<()> {
        let token = self.state.lock().unwrap().token.clone();
        if self.token_state(&token) == TokenState::Expired {
            self.refresh().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::MockClock;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration as StdDuration;
    use tokio::sync::Notify;

    #[derive(Debug)]
    struct CountingRefresher {
        calls: AtomicUsize,
        gate: Arc<Notify>,
        scopes: Vec<String>,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh_access_token(&self, clock: &dyn Clock) -> Result<AccessToken> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.gate.notified().await;
            Ok(AccessToken::new(
                "fresh-token",
                Some(clock.now() + ChronoDuration::seconds(3600)),
                self.scopes.clone(),
            ))
        }
    }

    fn make_core(clock: Arc<MockClock>, gate: Arc<Notify>) -> (Arc<OAuth2Core>, Arc<CountingRefresher>) {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            gate,
            scopes: vec!["s".into()],
        });
        let core = OAuth2Core::new(refresher.clone(), clock as SharedClock);
        (core, refresher)
    }

    #[tokio::test]
    async fn single_flight_collapses_concurrent_expired_callers() {
        let clock = MockClock::new(Utc::now());
        let gate = Arc::new(Notify::new());
        let (core, refresher) = make_core(clock.clone(), gate.clone());

        let mut joins = Vec::new();
        for _ in 0..100 {
            let core = core.clone();
            joins.push(tokio::spawn(async move { core.ensure_fresh().await }));
        }
        // Give every task a chance to observe EXPIRED and join the single flight.
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        gate.notify_waiters();

        let mut tokens = Vec::new();
        for j in joins {
            tokens.push(j.await.unwrap().unwrap());
        }
        assert_eq!(refresher.calls.load(AtomicOrdering::SeqCst), 1);
        for t in &tokens {
            assert_eq!(t, &tokens[0]);
        }
    }

    #[tokio::test]
    async fn stale_refresh_never_blocks_caller() {
        let clock = MockClock::new(Utc::now());
        let gate = Arc::new(Notify::new());
        let (core, refresher) = make_core(clock.clone(), gate.clone());

        // Seed a token that is STALE but not EXPIRED.
        {
            let mut state = core.state.lock().unwrap();
            state.token = Some(AccessToken::new(
                "old-token",
                Some(clock.now() + ChronoDuration::seconds(200)),
                vec!["s".into()],
            ));
        }

        let start = tokio::time::Instant::now();
        let token = core.ensure_fresh().await.unwrap();
        assert!(start.elapsed() < StdDuration::from_millis(50));
        assert_eq!(token.value(), "old-token");

        gate.notify_waiters();
        // Let the background refresh complete.
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(refresher.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(core.cached_token().unwrap().value(), "fresh-token");
    }

    #[tokio::test]
    async fn listener_fanout_preserves_order_and_count() {
        let clock = MockClock::new(Utc::now());
        let gate = Arc::new(Notify::new());
        gate.notify_waiters();
        let (core, _refresher) = make_core(clock.clone(), gate);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            core.add_change_listener(Arc::new(move |_t: &AccessToken| {
                order.lock().unwrap().push(i);
            }));
        }

        for _ in 0..2 {
            core.invalidate();
            core.refresh().await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn expiration_math_matches_spec_example() {
        let base = Utc::now();
        let clock = MockClock::new(base);
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            gate: Arc::new(Notify::new()),
            scopes: vec![],
        });
        let core = OAuth2Core::new(refresher, clock.clone() as SharedClock);
        let token = Some(AccessToken::new("t", Some(base + ChronoDuration::seconds(301)), vec![]));

        clock.set(base);
        assert_eq!(core.token_state(&token), TokenState::Expired);

        clock.set(base + ChronoDuration::seconds(21)); // t - 280
        assert_eq!(core.token_state(&token), TokenState::Stale);

        clock.set(base + ChronoDuration::seconds(75)); // t - 226
        assert_eq!(core.token_state(&token), TokenState::Stale);

        clock.set(base + ChronoDuration::seconds(77)); // t - 224
        assert_eq!(core.token_state(&token), TokenState::Fresh);
    }

    #[tokio::test]
    async fn scoping_invalidation_forces_next_refresh() {
        let clock = MockClock::new(Utc::now());
        let gate = Arc::new(Notify::new());
        gate.notify_waiters();
        let (core, refresher) = make_core(clock, gate);

        core.refresh().await.unwrap();
        assert_eq!(refresher.calls.load(AtomicOrdering::SeqCst), 1);
        assert!(core.cached_token().is_some());

        core.invalidate();
        assert!(core.cached_token().is_none());

        core.ensure_fresh().await.unwrap();
        assert_eq!(refresher.calls.load(AtomicOrdering::SeqCst), 2);
    }
}
