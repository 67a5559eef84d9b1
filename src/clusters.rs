//! Area cluster assignment.
//!
//! Routes whose start points lie within [`CLUSTER_RADIUS_KM`] of an
//! existing cluster's center join that cluster; otherwise a new cluster is
//! created, keyed by the spatial hash of the route's start point. A route
//! is assigned exactly once, at planning time, and the assignment never
//! changes afterwards.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::{Result, SentinelError};
use crate::store::{with_retries, Repository, RetryPolicy};
use crate::{geohash, AreaCluster, ClusterRouteEntry, GpsPoint};

/// Two routes belong to the same area when their start points are within
/// this many kilometers of the cluster center.
pub const CLUSTER_RADIUS_KM: f64 = 5.0;

/// Spatial-hash precision for cluster keys. Nine characters resolve to a
/// cell a few meters across, so the key doubles as the cluster center.
pub const CLUSTER_KEY_PRECISION: usize = 9;

/// Assigns routes to area clusters.
pub struct ClusterManager {
    store: Arc<dyn Repository>,
    retry: RetryPolicy,
    // Serializes scan-then-create within this process so two simultaneous
    // plans in the same fresh area share one cluster.
    assign_lock: Mutex<()>,
}

impl ClusterManager {
    pub fn new(store: Arc<dyn Repository>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            assign_lock: Mutex::new(()),
        }
    }

    /// Assign `route_id` to an area cluster and return the cluster key.
    ///
    /// Idempotent: if the route already belongs to a cluster, that key is
    /// returned unchanged. Otherwise the nearest cluster within
    /// [`CLUSTER_RADIUS_KM`] wins (ties broken by lexicographically
    /// smallest key); with none in range a new cluster is created at the
    /// route's start point.
    pub fn assign_cluster(&self, route_id: &str, start: GpsPoint, end: GpsPoint) -> Result<String> {
        if !start.is_valid() || !end.is_valid() {
            return Err(SentinelError::InvalidCoordinates {
                message: format!("route '{}' endpoints", route_id),
            });
        }

        let _guard = self
            .assign_lock
            .lock()
            .map_err(|_| SentinelError::internal("cluster assignment lock poisoned"))?;

        let clusters = self.store.clusters()?;

        // Idempotence scan first: an existing membership always wins.
        for cluster in &clusters {
            if cluster.routes.contains_key(route_id) {
                debug!(
                    "route '{}' already in cluster '{}'",
                    route_id, cluster.cluster_key
                );
                return Ok(cluster.cluster_key.clone());
            }
        }

        // Nearest cluster center within the radius, by decoded key.
        let mut best: Option<(String, f64)> = None;
        for cluster in &clusters {
            let center = match geohash::decode(&cluster.cluster_key) {
                Ok(center) => center,
                Err(err) => {
                    warn!("skipping undecodable cluster key: {}", err);
                    continue;
                }
            };
            let dist = geohash::haversine_km(&start, &center);
            if dist > CLUSTER_RADIUS_KM {
                continue;
            }
            let closer = match &best {
                None => true,
                Some((best_key, best_dist)) => {
                    dist < *best_dist || (dist == *best_dist && cluster.cluster_key < *best_key)
                }
            };
            if closer {
                best = Some((cluster.cluster_key.clone(), dist));
            }
        }

        let cluster_key = match best {
            Some((key, dist)) => {
                debug!(
                    "route '{}' joins cluster '{}' at {:.2}km",
                    route_id, key, dist
                );
                key
            }
            None => {
                let key = geohash::encode(start.latitude, start.longitude, CLUSTER_KEY_PRECISION);
                debug!("route '{}' starts new cluster '{}'", route_id, key);
                key
            }
        };

        // Write the route entry, creating the cluster record on first use.
        let entry = ClusterRouteEntry::new(start, end);
        with_retries(&self.retry, "write cluster entry", || {
            let rid = route_id.to_string();
            let e = entry.clone();
            let updated = self.store.update_cluster(&cluster_key, &mut |cluster| {
                cluster.routes.entry(rid.clone()).or_insert_with(|| e.clone());
            })?;
            if !updated {
                let mut cluster = AreaCluster::new(cluster_key.clone());
                cluster.routes.insert(rid, e);
                self.store.put_cluster(cluster)?;
            }
            Ok(())
        })?;

        // Back-reference on the plan so score ingestion finds the cluster
        // without scanning.
        let key = cluster_key.clone();
        let plan_found = with_retries(&self.retry, "record cluster on plan", || {
            self.store.update_route(route_id, &mut |plan| {
                plan.cluster_key = Some(key.clone());
            })
        })?;
        if !plan_found {
            warn!(
                "no plan for route '{}', cluster '{}' not back-referenced",
                route_id, cluster_key
            );
        }

        Ok(cluster_key)
    }
}
