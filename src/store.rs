//! Repository abstraction over the backing store.
//!
//! All engine state lives behind [`Repository`]: route plans, traveler
//! records, route rooms and area clusters. The trait exposes `get`/`put`
//! plus closure-based `update` operations; an `update` applies its closure
//! under the store's own synchronization, which is the only transaction
//! primitive the managers rely on.
//!
//! [`MemoryStore`] is the bundled implementation, a set of mutex-guarded
//! maps. Write retries for transient failures are handled uniformly by
//! [`with_retries`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use log::warn;

use crate::error::{Result, SentinelError};
use crate::{AreaCluster, RoutePlan, RouteRoom, Traveler};

/// Storage seam for all engine state.
///
/// Implementations must be internally synchronized: concurrent `update_*`
/// calls against the same record must not lose writes.
pub trait Repository: Send + Sync {
    fn get_route(&self, route_id: &str) -> Result<Option<RoutePlan>>;
    fn put_route(&self, plan: RoutePlan) -> Result<()>;
    /// Apply `f` to the stored plan. Returns `Ok(false)` if no plan exists.
    fn update_route(&self, route_id: &str, f: &mut dyn FnMut(&mut RoutePlan)) -> Result<bool>;

    fn get_traveler(&self, user_id: &str) -> Result<Option<Traveler>>;
    fn put_traveler(&self, traveler: Traveler) -> Result<()>;
    fn update_traveler(&self, user_id: &str, f: &mut dyn FnMut(&mut Traveler)) -> Result<bool>;

    fn get_room(&self, route_id: &str) -> Result<Option<RouteRoom>>;
    fn put_room(&self, room: RouteRoom) -> Result<()>;
    fn update_room(&self, route_id: &str, f: &mut dyn FnMut(&mut RouteRoom)) -> Result<bool>;

    fn get_cluster(&self, cluster_key: &str) -> Result<Option<AreaCluster>>;
    fn put_cluster(&self, cluster: AreaCluster) -> Result<()>;
    fn update_cluster(&self, cluster_key: &str, f: &mut dyn FnMut(&mut AreaCluster))
        -> Result<bool>;

    /// Every known cluster. Cluster counts stay small (one per active
    /// area), so assignment scans all of them.
    fn clusters(&self) -> Result<Vec<AreaCluster>>;

    fn route_ids(&self) -> Result<Vec<String>>;
    fn room_ids(&self) -> Result<Vec<String>>;
}

/// In-memory [`Repository`] backed by mutex-guarded maps.
#[derive(Default)]
pub struct MemoryStore {
    routes: Mutex<HashMap<String, RoutePlan>>,
    travelers: Mutex<HashMap<String, Traveler>>,
    rooms: Mutex<HashMap<String, RouteRoom>>,
    // BTreeMap keeps cluster iteration deterministic
    clusters: Mutex<BTreeMap<String, AreaCluster>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<std::sync::MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| SentinelError::storage(format!("{} lock poisoned", what)))
}

impl Repository for MemoryStore {
    fn get_route(&self, route_id: &str) -> Result<Option<RoutePlan>> {
        Ok(lock(&self.routes, "routes")?.get(route_id).cloned())
    }

    fn put_route(&self, plan: RoutePlan) -> Result<()> {
        lock(&self.routes, "routes")?.insert(plan.route_id.clone(), plan);
        Ok(())
    }

    fn update_route(&self, route_id: &str, f: &mut dyn FnMut(&mut RoutePlan)) -> Result<bool> {
        let mut routes = lock(&self.routes, "routes")?;
        match routes.get_mut(route_id) {
            Some(plan) => {
                f(plan);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get_traveler(&self, user_id: &str) -> Result<Option<Traveler>> {
        Ok(lock(&self.travelers, "travelers")?.get(user_id).cloned())
    }

    fn put_traveler(&self, traveler: Traveler) -> Result<()> {
        lock(&self.travelers, "travelers")?.insert(traveler.user_id.clone(), traveler);
        Ok(())
    }

    fn update_traveler(&self, user_id: &str, f: &mut dyn FnMut(&mut Traveler)) -> Result<bool> {
        let mut travelers = lock(&self.travelers, "travelers")?;
        match travelers.get_mut(user_id) {
            Some(traveler) => {
                f(traveler);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get_room(&self, route_id: &str) -> Result<Option<RouteRoom>> {
        Ok(lock(&self.rooms, "rooms")?.get(route_id).cloned())
    }

    fn put_room(&self, room: RouteRoom) -> Result<()> {
        lock(&self.rooms, "rooms")?.insert(room.route_id.clone(), room);
        Ok(())
    }

    fn update_room(&self, route_id: &str, f: &mut dyn FnMut(&mut RouteRoom)) -> Result<bool> {
        let mut rooms = lock(&self.rooms, "rooms")?;
        match rooms.get_mut(route_id) {
            Some(room) => {
                f(room);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get_cluster(&self, cluster_key: &str) -> Result<Option<AreaCluster>> {
        Ok(lock(&self.clusters, "clusters")?.get(cluster_key).cloned())
    }

    fn put_cluster(&self, cluster: AreaCluster) -> Result<()> {
        lock(&self.clusters, "clusters")?.insert(cluster.cluster_key.clone(), cluster);
        Ok(())
    }

    fn update_cluster(
        &self,
        cluster_key: &str,
        f: &mut dyn FnMut(&mut AreaCluster),
    ) -> Result<bool> {
        let mut clusters = lock(&self.clusters, "clusters")?;
        match clusters.get_mut(cluster_key) {
            Some(cluster) => {
                f(cluster);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn clusters(&self) -> Result<Vec<AreaCluster>> {
        Ok(lock(&self.clusters, "clusters")?.values().cloned().collect())
    }

    fn route_ids(&self) -> Result<Vec<String>> {
        Ok(lock(&self.routes, "routes")?.keys().cloned().collect())
    }

    fn room_ids(&self) -> Result<Vec<String>> {
        Ok(lock(&self.rooms, "rooms")?.keys().cloned().collect())
    }
}

// ============================================================================
// Write retries
// ============================================================================

/// Retry budget for transient storage failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// Run `f`, retrying transient errors with exponential backoff until the
/// policy's budget is exhausted. Non-transient errors surface immediately.
pub fn with_retries<T, F>(policy: &RetryPolicy, op_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = policy.base_delay;
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    op_name, attempt, attempts, delay, err
                );
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }

    // attempts >= 1 guarantees the loop returned
    Err(SentinelError::internal(format!(
        "{}: retry loop exited without a result",
        op_name
    )))
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    //! A delegating store whose next N write operations fail transiently.
    //! Reused by the manager tests to exercise retry and rollback paths.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Which writes the injected failures apply to.
    #[derive(Clone, Copy, PartialEq)]
    pub(crate) enum FailTarget {
        AnyWrite,
        RouteWrites,
    }

    pub(crate) struct FlakyStore {
        inner: Arc<MemoryStore>,
        failures_left: AtomicU32,
        target: FailTarget,
    }

    impl FlakyStore {
        pub(crate) fn new(inner: Arc<MemoryStore>, failures: u32) -> Self {
            Self::with_target(inner, failures, FailTarget::AnyWrite)
        }

        /// Only route-plan writes fail; everything else goes through.
        pub(crate) fn failing_routes(inner: Arc<MemoryStore>, failures: u32) -> Self {
            Self::with_target(inner, failures, FailTarget::RouteWrites)
        }

        fn with_target(inner: Arc<MemoryStore>, failures: u32, target: FailTarget) -> Self {
            Self {
                inner,
                failures_left: AtomicU32::new(failures),
                target,
            }
        }

        fn trip(&self, is_route_write: bool) -> Result<()> {
            if self.target == FailTarget::RouteWrites && !is_route_write {
                return Ok(());
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0
                && self
                    .failures_left
                    .compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return Err(SentinelError::transient("injected write failure"));
            }
            Ok(())
        }
    }

    impl Repository for FlakyStore {
        fn get_route(&self, route_id: &str) -> Result<Option<RoutePlan>> {
            self.inner.get_route(route_id)
        }

        fn put_route(&self, plan: RoutePlan) -> Result<()> {
            self.trip(true)?;
            self.inner.put_route(plan)
        }

        fn update_route(&self, route_id: &str, f: &mut dyn FnMut(&mut RoutePlan)) -> Result<bool> {
            self.trip(true)?;
            self.inner.update_route(route_id, f)
        }

        fn get_traveler(&self, user_id: &str) -> Result<Option<Traveler>> {
            self.inner.get_traveler(user_id)
        }

        fn put_traveler(&self, traveler: Traveler) -> Result<()> {
            self.trip(false)?;
            self.inner.put_traveler(traveler)
        }

        fn update_traveler(&self, user_id: &str, f: &mut dyn FnMut(&mut Traveler)) -> Result<bool> {
            self.trip(false)?;
            self.inner.update_traveler(user_id, f)
        }

        fn get_room(&self, route_id: &str) -> Result<Option<RouteRoom>> {
            self.inner.get_room(route_id)
        }

        fn put_room(&self, room: RouteRoom) -> Result<()> {
            self.trip(false)?;
            self.inner.put_room(room)
        }

        fn update_room(&self, route_id: &str, f: &mut dyn FnMut(&mut RouteRoom)) -> Result<bool> {
            self.trip(false)?;
            self.inner.update_room(route_id, f)
        }

        fn get_cluster(&self, cluster_key: &str) -> Result<Option<AreaCluster>> {
            self.inner.get_cluster(cluster_key)
        }

        fn put_cluster(&self, cluster: AreaCluster) -> Result<()> {
            self.trip(false)?;
            self.inner.put_cluster(cluster)
        }

        fn update_cluster(
            &self,
            cluster_key: &str,
            f: &mut dyn FnMut(&mut AreaCluster),
        ) -> Result<bool> {
            self.trip(false)?;
            self.inner.update_cluster(cluster_key, f)
        }

        fn clusters(&self) -> Result<Vec<AreaCluster>> {
            self.inner.clusters()
        }

        fn route_ids(&self) -> Result<Vec<String>> {
            self.inner.route_ids()
        }

        fn room_ids(&self) -> Result<Vec<String>> {
            self.inner.room_ids()
        }
    }
}
