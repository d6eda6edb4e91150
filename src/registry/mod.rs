//! Routing registry subsystem.
//!
//! # Data Flow
//! ```text
//! Bus (router.register / router.unregister)
//!     → subscriber.rs (decode RegistryMessage)
//!     → Registry::register / Registry::unregister
//!     → by_uri / by_backend_id / stale tracker
//!
//! Proxy
//!     → Registry::lookup / lookup_by_private_instance_id
//!     → Arc<Backend>
//! ```
//!
//! # Design Decisions
//! - `by_backend_id` owns each backend slot; `by_uri` only indexes ids
//! - One `RwLock` guards both maps and the tracker
//! - Stale pruning is suspended while the bus is unreachable

pub mod backend;
pub mod subscriber;
pub mod tracker;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use rand::seq::SliceRandom;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::config::RegistryConfig;
use crate::lifecycle::ticker::Ticker;
use crate::mbus::MessageBus;
use crate::stats::{ActiveApps, TopApps};

pub use backend::{Backend, BackendId, RegistryMessage, Uri};
pub use subscriber::RouteSubscriber;
use tracker::StaleTracker;

struct Slot {
    backend: Arc<Backend>,
    uris: Vec<Uri>,
    updated_at: Instant,
}

#[derive(Default)]
struct Inner {
    by_backend_id: HashMap<BackendId, Slot>,
    by_uri: HashMap<Uri, Vec<BackendId>>,
    tracker: StaleTracker,
}

impl Inner {
    fn unregister_uri(&mut self, id: &BackendId, uri: &Uri) {
        if let Some(pool) = self.by_uri.get_mut(uri) {
            pool.retain(|member| member != id);
            if pool.is_empty() {
                self.by_uri.remove(uri);
            }
        }

        let emptied = match self.by_backend_id.get_mut(id) {
            Some(slot) => {
                slot.uris.retain(|u| u != uri);
                slot.uris.is_empty()
            }
            None => false,
        };

        if emptied {
            self.by_backend_id.remove(id);
            self.tracker.remove(id);
        }
    }

    fn unregister_backend(&mut self, id: &BackendId) {
        let uris = match self.by_backend_id.get(id) {
            Some(slot) => slot.uris.clone(),
            None => {
                self.tracker.remove(id);
                return;
            }
        };
        for uri in &uris {
            self.unregister_uri(id, uri);
        }
    }
}

/// Live routing table of registered backends.
pub struct Registry {
    /// Both indexes and the stale tracker.
    inner: RwLock<Inner>,
    /// Pinged before pruning, never while `inner` is held.
    bus: Arc<dyn MessageBus>,
    prune_interval: Duration,
    /// A backend not refreshed within this is stale.
    stale_threshold: Duration,
    active_apps: Arc<ActiveApps>,
    /// Usage statistics fed by `capture_backend_request`.
    top_apps: Arc<TopApps>,
    span: tracing::Span,
}

impl Registry {
    /// Empty registry. `bus` is only pinged, to decide whether pruning is safe.
    pub fn new(config: &RegistryConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            bus,
            prune_interval: config.prune_interval(),
            stale_threshold: config.stale_threshold(),
            active_apps: Arc::new(ActiveApps::new()),
            top_apps: Arc::new(TopApps::new()),
            span: tracing::info_span!("registry"),
        }
    }

    /// Add the message's uris to its backend, creating the backend if needed.
    ///
    /// Every registration refreshes the backend's stale deadline, even when
    /// it adds no new uri. Messages without an address or uris are ignored.
    pub fn register(&self, message: &RegistryMessage) {
        let _enter = self.span.enter();

        let Some(id) = message.backend_id() else {
            tracing::debug!(host = %message.host, port = message.port, "Ignoring registration without address");
            return;
        };
        if message.uris.is_empty() {
            tracing::debug!(backend = %id, "Ignoring registration without uris");
            return;
        }

        let now = Instant::now();
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let inner = &mut *inner;

        let slot = inner.by_backend_id.entry(id.clone()).or_insert_with(|| {
            tracing::info!(backend = %id, app = %message.app, "Registering backend");
            Slot {
                backend: Arc::new(Backend::from_message(id.clone(), message)),
                uris: Vec::new(),
                updated_at: now,
            }
        });

        for raw in &message.uris {
            let uri = Uri::new(raw);
            if !slot.uris.contains(&uri) {
                slot.uris.push(uri.clone());
            }

            let pool = inner.by_uri.entry(uri).or_default();
            if !pool.contains(&id) {
                pool.push(id.clone());
            }
        }

        slot.updated_at = now;
        inner.tracker.touch(&id);
    }

    /// Remove the message's uris from its backend. Unknown backends or uris
    /// are ignored.
    pub fn unregister(&self, message: &RegistryMessage) {
        let _enter = self.span.enter();

        let Some(id) = message.backend_id() else {
            return;
        };

        let mut inner = self.inner.write().expect("registry lock poisoned");
        if !inner.by_backend_id.contains_key(&id) {
            tracing::debug!(backend = %id, "Unregister for unknown backend");
            return;
        }

        for raw in &message.uris {
            inner.unregister_uri(&id, &Uri::new(raw));
        }

        if !inner.by_backend_id.contains_key(&id) {
            tracing::info!(backend = %id, "Backend removed");
        }
    }

    /// Pick a backend for `host` uniformly at random.
    ///
    /// `host` is matched case-insensitively and must not carry a port.
    pub fn lookup(&self, host: &str) -> Option<Arc<Backend>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let pool = inner.by_uri.get(&Uri::new(host))?;
        let id = pool.choose(&mut rand::thread_rng())?;
        inner.by_backend_id.get(id).map(|slot| slot.backend.clone())
    }

    /// Find the backend for `host` whose private instance id matches.
    pub fn lookup_by_private_instance_id(&self, host: &str, private_instance_id: &str) -> Option<Arc<Backend>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let pool = inner.by_uri.get(&Uri::new(host))?;
        pool.iter()
            .filter_map(|id| inner.by_backend_id.get(id))
            .find(|slot| slot.backend.private_instance_id == private_instance_id)
            .map(|slot| slot.backend.clone())
    }

    /// Evict backends that have not re-registered within the stale threshold.
    ///
    /// While the bus is unreachable nothing is evicted. The stale tracker is
    /// reset instead, so backends get a full threshold to re-register once the
    /// bus comes back.
    pub fn prune_stale_droplets(&self) {
        self.prune_as_of(Instant::now());
    }

    /// Prune with `now` as the current time.
    pub(crate) fn prune_as_of(&self, now: Instant) {
        let _enter = self.span.enter();

        // Ping before locking: a bus adapter may answer over the network.
        if !self.bus.ping() {
            tracing::info!("Message bus unreachable, resetting stale tracker");
            self.inner.write().expect("registry lock poisoned").tracker.clear();
            return;
        }

        let mut inner = self.inner.write().expect("registry lock poisoned");
        while let Some(id) = inner.tracker.front().cloned() {
            let stale = match inner.by_backend_id.get(&id) {
                Some(slot) => slot
                    .updated_at
                    .checked_add(self.stale_threshold)
                    .is_some_and(|deadline| deadline <= now),
                None => true,
            };
            if !stale {
                break;
            }

            tracing::info!(backend = %id, "Pruning stale backend");
            inner.unregister_backend(&id);
        }
    }

    /// Start the periodic pruning ticker. A zero interval disables pruning.
    ///
    /// Each cycle runs on the blocking pool since it pings the bus. A cycle
    /// is skipped while the previous one is still running.
    pub fn start_pruning_cycle(self: &Arc<Self>) -> Option<Ticker> {
        if self.prune_interval.is_zero() {
            tracing::info!("Stale droplet pruning disabled");
            return None;
        }

        let registry = Arc::clone(self);
        let running = Arc::new(AtomicBool::new(false));
        Some(Ticker::start("registry_prune", self.prune_interval, move || {
            if running.swap(true, Ordering::AcqRel) {
                tracing::debug!("Previous prune still running, skipping cycle");
                return;
            }
            let registry = Arc::clone(&registry);
            let running = Arc::clone(&running);
            tokio::task::spawn_blocking(move || {
                registry.prune_stale_droplets();
                running.store(false, Ordering::Release);
            });
        }))
    }

    /// Record that a request was routed to `backend` at `at`.
    pub fn capture_backend_request(&self, backend: &Backend, at: SystemTime) {
        if backend.application_id.is_empty() {
            return;
        }
        self.active_apps.mark(&backend.application_id, at);
        self.top_apps.mark(&backend.application_id, at);
    }

    /// Apps that served a request recently.
    pub fn active_apps(&self) -> &Arc<ActiveApps> {
        &self.active_apps
    }

    /// Per-app request counts, bucketed by second.
    pub fn top_apps(&self) -> &Arc<TopApps> {
        &self.top_apps
    }

    /// Number of distinct routable uris.
    pub fn num_uris(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").by_uri.len()
    }

    /// Number of registered backends, however many uris each serves.
    pub fn num_backends(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").by_backend_id.len()
    }
}

impl Serialize for Registry {
    /// `{uri: ["host:port", ...]}`, uris sorted.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let routes: BTreeMap<&Uri, Vec<&Backend>> = inner
            .by_uri
            .iter()
            .map(|(uri, pool)| {
                let backends = pool
                    .iter()
                    .filter_map(|id| inner.by_backend_id.get(id))
                    .map(|slot| slot.backend.as_ref())
                    .collect();
                (uri, backends)
            })
            .collect();

        let mut map = serializer.serialize_map(Some(routes.len()))?;
        for (uri, backends) in &routes {
            map.serialize_entry(uri, backends)?;
        }
        map.end()
    }
}
