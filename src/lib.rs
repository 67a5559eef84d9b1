//! # Route Sentinel
//!
//! Route-based safety rooms with geospatial clustering and threat escalation.
//!
//! This library provides:
//! - A spatial hash codec and haversine distance for area clustering
//! - Route room lifecycle with live member-location fan-out
//! - Area clusters grouping routes that start within 5 km of each other
//! - A per-message threat-score pipeline driving an escalation state
//!   machine (Normal -> Caution -> Critical/SosActive)
//!
//! ## Features
//!
//! - **`http`** - HTTP implementations of the external scoring/notification
//!   collaborators (reqwest)
//! - **`persistence`** - SQLite sink for the compliance audit log
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_sentinel::{geohash, EscalationState, GpsPoint};
//!
//! // Cluster keys are fixed-precision spatial hashes of the route origin.
//! let key = geohash::encode(28.61, 77.20, 9);
//! let center = geohash::decode(&key).unwrap();
//! assert!(geohash::haversine_km(&GpsPoint::new(28.61, 77.20), &center) < 0.005);
//!
//! // Escalation state derives from the latest score and the SOS counter.
//! assert_eq!(EscalationState::derive(Some(8.5), 0), EscalationState::Normal);
//! assert_eq!(EscalationState::derive(Some(5.0), 0), EscalationState::Caution);
//! assert_eq!(EscalationState::derive(Some(3.0), 0), EscalationState::Critical);
//! assert_eq!(EscalationState::derive(Some(9.9), 2), EscalationState::SosActive);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, SentinelError};

// Spatial hash codec and haversine distance
pub mod geohash;

// Injected repository abstraction and write-retry helper
pub mod store;
pub use store::{MemoryStore, Repository, RetryPolicy};

// Route room lifecycle and live snapshot feed
pub mod rooms;
pub use rooms::{RoomFeed, RoomManager};

// Area cluster assignment
pub mod clusters;
pub use clusters::{ClusterManager, CLUSTER_KEY_PRECISION, CLUSTER_RADIUS_KM};

// Live location synchronizer
pub mod tracker;
pub use tracker::{LocationProvider, LocationSync, PositionSample, SyncHandle, WatchConfig};

// External collaborator contracts (message/area scorers, emergency notifier)
pub mod scorer;
pub use scorer::{
    AreaAdvisory, AreaScoreRequest, AreaScorer, ChatLine, DisabledScorer, EmergencyAlert,
    EmergencyNotifier, LogOnlyNotifier, MessageScoreRequest, MessageScoreResponse, MessageScorer,
};

// Score aggregation and escalation state machine
pub mod escalation;
pub use escalation::{
    EscalationEngine, EscalationOutcome, ThrottleOutcome, CAUTION_THRESHOLD, CRITICAL_THRESHOLD,
};

// Compliance audit log
pub mod audit;
pub use audit::{AuditEntry, AuditLog, MemoryAuditLog};

// Engine façade tying the managers together
pub mod engine;
pub use engine::{
    ChatOutcome, Collaborators, EngineConfig, EngineStats, RoomSession, RoutePlanRequest,
    SafetyEngine,
};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use route_sentinel::GpsPoint;
/// let point = GpsPoint::new(28.61, 77.20); // New Delhi
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// How the traveler covers the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TravelMode {
    Driving,
    Transit,
    Bicycling,
    Walking,
}

/// One planned trip. The record is never deleted once created: historical
/// routes may be rejoined, so only the counters and the cluster assignment
/// mutate afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePlan {
    /// Stable key derived from the destination identity (place id).
    pub route_id: String,
    pub start: GpsPoint,
    pub end: GpsPoint,
    pub travel_mode: TravelMode,
    pub destination_address: String,
    /// Number of active travelers on this exact route.
    pub user_count: u32,
    /// Millis since epoch, touched on every join/leave.
    pub last_updated: u64,
    /// Assigned area cluster, set exactly once by the cluster manager.
    pub cluster_key: Option<String>,
}

/// Per-user active-trip record, maintained alongside room membership.
/// The live location synchronizer keeps `current` fresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Traveler {
    pub user_id: String,
    pub route_id: String,
    pub start: GpsPoint,
    pub end: GpsPoint,
    pub current: GpsPoint,
    pub status: MemberStatus,
}

/// Member liveness inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Inactive,
}

/// Per-user state inside a room. `current` is mutated continuously by that
/// member's own location synchronizer and read by everyone else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub joined_at: u64,
    pub current: GpsPoint,
    pub status: MemberStatus,
}

/// One chat message. The timestamp is assigned by the room manager at write
/// time, never taken from the client clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: u64,
}

/// One AI-produced threat rating on a 0-10 scale, lower = more dangerous.
/// Append-only; the unique `entry_id` makes duplicate deliveries detectable
/// by id rather than by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub entry_id: String,
    /// Message this score was produced for, when known.
    pub message_id: Option<String>,
    pub value: f64,
    pub timestamp: u64,
}

/// The live collaboration surface for one RoutePlan.
///
/// Invariant: a room exists iff its RoutePlan has `user_count > 0`; when the
/// last member leaves, the transient fields are cleared but the shell is
/// retained for future joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRoom {
    pub route_id: String,
    pub created_at: u64,
    pub members: HashMap<String, Member>,
    pub messages: Vec<Message>,
    pub score_history: Vec<Score>,
    pub sos_trigger_count: u32,
    /// Who last triggered SOS, if anyone.
    pub sos_user_id: Option<String>,
    /// Every user who has triggered SOS this session; backs the per-user
    /// throttle idempotence guard.
    pub sos_triggered_by: BTreeSet<String>,
}

impl RouteRoom {
    /// A fresh room shell with empty transient state.
    pub fn new(route_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            created_at: now_millis(),
            members: HashMap::new(),
            messages: Vec::new(),
            score_history: Vec::new(),
            sos_trigger_count: 0,
            sos_user_id: None,
            sos_triggered_by: BTreeSet::new(),
        }
    }

    /// Latest score value, if any score has been ingested this session.
    pub fn latest_score(&self) -> Option<f64> {
        self.score_history.last().map(|s| s.value)
    }

    /// Derived escalation state for this room.
    pub fn escalation_state(&self) -> EscalationState {
        EscalationState::derive(self.latest_score(), self.sos_trigger_count)
    }

    /// Clear messages, scores and SOS state; the shell survives for the
    /// next travelers on this route.
    pub(crate) fn reset_session(&mut self) {
        self.messages.clear();
        self.score_history.clear();
        self.sos_trigger_count = 0;
        self.sos_user_id = None;
        self.sos_triggered_by.clear();
    }
}

/// One route's entry inside an area cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRouteEntry {
    pub start: GpsPoint,
    pub end: GpsPoint,
    pub score_history: Vec<Score>,
}

impl ClusterRouteEntry {
    pub fn new(start: GpsPoint, end: GpsPoint) -> Self {
        Self {
            start,
            end,
            score_history: Vec::new(),
        }
    }
}

/// A geography-keyed grouping of routes whose start points lie within the
/// cluster radius of each other. Membership is permanent once established;
/// clusters are never merged or re-evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaCluster {
    /// Spatial-hash string; decoding it yields the approximate center.
    pub cluster_key: String,
    pub routes: BTreeMap<String, ClusterRouteEntry>,
}

impl AreaCluster {
    pub fn new(cluster_key: impl Into<String>) -> Self {
        Self {
            cluster_key: cluster_key.into(),
            routes: BTreeMap::new(),
        }
    }
}

/// Derived danger level for a room. Never stored; always a pure function of
/// the latest score and the SOS counter. SosActive dominates everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationState {
    Normal,
    Caution,
    Critical,
    SosActive,
}

impl EscalationState {
    /// Derive the state from the latest score and the SOS trigger count.
    ///
    /// Thresholds: score >= 7 is Normal, 4 <= score < 7 is Caution,
    /// score < 4 is Critical. Any SOS trigger forces SosActive regardless
    /// of score.
    pub fn derive(latest_score: Option<f64>, sos_trigger_count: u32) -> Self {
        if sos_trigger_count > 0 {
            return EscalationState::SosActive;
        }
        match latest_score {
            None => EscalationState::Normal,
            Some(s) if s < escalation::CRITICAL_THRESHOLD => EscalationState::Critical,
            Some(s) if s < escalation::CAUTION_THRESHOLD => EscalationState::Caution,
            Some(_) => EscalationState::Normal,
        }
    }
}

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================
