//! Score ingestion and the threat-escalation state machine.
//!
//! Every scored message flows through [`EscalationEngine::on_message_scored`]:
//! the score is appended to the room (and mirrored into the route's area
//! cluster), the cluster's combined history is shipped to the area scorer
//! on a background worker, and the room's escalation state is re-evaluated.
//!
//! Escalation is one-way in practice: a score below the critical threshold
//! auto-triggers the throttle for the message author, and a triggered
//! throttle (SOS) dominates every later score. The throttle itself is
//! idempotent per user per session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::error::{Result, SentinelError};
use crate::rooms::RoomManager;
use crate::scorer::{AreaScoreRequest, AreaScorer, EmergencyAlert, EmergencyNotifier};
use crate::store::{with_retries, Repository, RetryPolicy};
use crate::{now_millis, EscalationState, Message, Score};

/// Scores below this are Critical and auto-trigger the throttle.
pub const CRITICAL_THRESHOLD: f64 = 4.0;

/// Scores below this (but at or above critical) are Caution.
pub const CAUTION_THRESHOLD: f64 = 7.0;

/// How many recent messages accompany an emergency alert.
const ALERT_CONTEXT_MESSAGES: usize = 10;

/// What a scored message did to the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// No state transition.
    Unchanged,
    /// First drop into Caution; the author should be asked whether they
    /// feel safe.
    CautionPrompt { user_id: String },
    /// Critical score auto-triggered the throttle for the author.
    AutoThrottled { user_id: String },
    /// The score's entry id was already ingested; nothing happened.
    Duplicate,
}

/// Result of a throttle attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleOutcome {
    /// This user's first trigger this session; the alert went out.
    Triggered,
    /// This user already triggered; counter and notifier untouched.
    AlreadyTriggered,
}

/// Background worker shipping cluster histories to the area scorer.
/// Assessment is advisory, so results are only logged; a dead or failing
/// scorer never blocks ingestion.
struct AreaScoreWorker {
    tx: Option<mpsc::Sender<AreaScoreRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl AreaScoreWorker {
    fn spawn(scorer: Arc<dyn AreaScorer>) -> Self {
        let (tx, rx) = mpsc::channel::<AreaScoreRequest>();
        let handle = std::thread::spawn(move || {
            while let Ok(request) = rx.recv() {
                match scorer.assess_area(&request) {
                    Ok(advisory) => {
                        if advisory.flagged_routes.is_empty() {
                            debug!("area assessment: {}", advisory.summary);
                        } else {
                            warn!(
                                "area assessment flags {:?}: {}",
                                advisory.flagged_routes, advisory.summary
                            );
                        }
                    }
                    Err(err) => debug!("area assessment unavailable: {}", err),
                }
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn submit(&self, request: AreaScoreRequest) {
        if let Some(tx) = &self.tx {
            if tx.send(request).is_err() {
                warn!("area score worker is gone, dropping assessment request");
            }
        }
    }
}

impl Drop for AreaScoreWorker {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("area score worker panicked");
            }
        }
    }
}

/// Drives the escalation state machine for all rooms.
pub struct EscalationEngine {
    store: Arc<dyn Repository>,
    rooms: Arc<RoomManager>,
    notifier: Arc<dyn EmergencyNotifier>,
    retry: RetryPolicy,
    next_entry_seq: AtomicU64,
    area_worker: AreaScoreWorker,
}

impl EscalationEngine {
    pub fn new(
        store: Arc<dyn Repository>,
        rooms: Arc<RoomManager>,
        area_scorer: Arc<dyn AreaScorer>,
        notifier: Arc<dyn EmergencyNotifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            rooms,
            notifier,
            retry,
            next_entry_seq: AtomicU64::new(1),
            area_worker: AreaScoreWorker::spawn(area_scorer),
        }
    }

    /// Mint a score record with a unique entry id.
    pub fn new_score(&self, message_id: Option<String>, value: f64) -> Score {
        let seq = self.next_entry_seq.fetch_add(1, Ordering::SeqCst);
        Score {
            entry_id: format!("score-{}", seq),
            message_id,
            value,
            timestamp: now_millis(),
        }
    }

    /// Ingest one score for a room and re-evaluate escalation.
    ///
    /// `user_id` is the author of the scored message; a Critical score
    /// triggers the throttle on their behalf. Redelivery of an already
    /// ingested entry id is a no-op.
    pub fn on_message_scored(
        &self,
        route_id: &str,
        user_id: &str,
        score: Score,
    ) -> Result<EscalationOutcome> {
        let mut duplicate = false;
        let mut prior = EscalationState::Normal;

        let found = with_retries(&self.retry, "append score", || {
            duplicate = false;
            let s = score.clone();
            self.store.update_room(route_id, &mut |room| {
                if room.score_history.iter().any(|e| e.entry_id == s.entry_id) {
                    duplicate = true;
                    return;
                }
                prior = room.escalation_state();
                room.score_history.push(s.clone());
            })
        })?;
        if !found {
            return Err(SentinelError::RoomNotFound {
                route_id: route_id.to_string(),
            });
        }
        if duplicate {
            debug!(
                "score entry '{}' already ingested for route '{}'",
                score.entry_id, route_id
            );
            return Ok(EscalationOutcome::Duplicate);
        }

        self.mirror_into_cluster(route_id, &score);

        let outcome = if prior == EscalationState::SosActive {
            // SOS dominates; later scores change nothing
            EscalationOutcome::Unchanged
        } else if score.value < CRITICAL_THRESHOLD {
            match self.throttle(route_id, user_id)? {
                ThrottleOutcome::Triggered => EscalationOutcome::AutoThrottled {
                    user_id: user_id.to_string(),
                },
                ThrottleOutcome::AlreadyTriggered => EscalationOutcome::Unchanged,
            }
        } else if score.value < CAUTION_THRESHOLD && prior == EscalationState::Normal {
            EscalationOutcome::CautionPrompt {
                user_id: user_id.to_string(),
            }
        } else {
            EscalationOutcome::Unchanged
        };

        self.rooms.publish(route_id);
        Ok(outcome)
    }

    /// Trigger the throttle (SOS) for a user: bump the room's counter,
    /// record the trigger and alert emergency services, exactly once per
    /// user per session. Repeat triggers are absorbed silently.
    pub fn throttle(&self, route_id: &str, user_id: &str) -> Result<ThrottleOutcome> {
        let mut already = false;
        let mut context: Vec<Message> = Vec::new();

        let found = with_retries(&self.retry, "throttle", || {
            already = false;
            context.clear();
            let uid = user_id.to_string();
            self.store.update_room(route_id, &mut |room| {
                if room.sos_triggered_by.contains(&uid) {
                    already = true;
                    return;
                }
                room.sos_triggered_by.insert(uid.clone());
                room.sos_trigger_count += 1;
                room.sos_user_id = Some(uid.clone());
                let skip = room.messages.len().saturating_sub(ALERT_CONTEXT_MESSAGES);
                context = room.messages[skip..].to_vec();
            })
        })?;
        if !found {
            return Err(SentinelError::RoomNotFound {
                route_id: route_id.to_string(),
            });
        }
        if already {
            debug!(
                "throttle for '{}' on route '{}' already triggered",
                user_id, route_id
            );
            return Ok(ThrottleOutcome::AlreadyTriggered);
        }

        // State is committed; the alert goes out exactly once. A notifier
        // failure is logged, never rolled back: the room must stay in
        // SosActive either way.
        let alert = EmergencyAlert {
            route_id: route_id.to_string(),
            user_id: user_id.to_string(),
            messages: context,
        };
        if let Err(err) = self.notifier.notify(&alert) {
            warn!(
                "emergency alert delivery failed for route '{}': {}",
                route_id, err
            );
        }

        self.rooms.publish(route_id);
        Ok(ThrottleOutcome::Triggered)
    }

    /// Mirror a score into the route's area cluster and hand the cluster's
    /// combined history to the area scorer. Both are best-effort.
    fn mirror_into_cluster(&self, route_id: &str, score: &Score) {
        let cluster_key = match self.store.get_route(route_id) {
            Ok(Some(plan)) => match plan.cluster_key {
                Some(key) => key,
                None => {
                    debug!("route '{}' has no cluster, score not mirrored", route_id);
                    return;
                }
            },
            Ok(None) => {
                debug!("no plan for route '{}', score not mirrored", route_id);
                return;
            }
            Err(err) => {
                warn!("plan lookup failed for route '{}': {}", route_id, err);
                return;
            }
        };

        let write = with_retries(&self.retry, "mirror score into cluster", || {
            let rid = route_id.to_string();
            let s = score.clone();
            self.store.update_cluster(&cluster_key, &mut |cluster| {
                if let Some(entry) = cluster.routes.get_mut(&rid) {
                    if !entry.score_history.iter().any(|e| e.entry_id == s.entry_id) {
                        entry.score_history.push(s.clone());
                    }
                }
            })
        });
        if let Err(err) = write {
            warn!(
                "cluster history write failed for '{}': {}",
                cluster_key, err
            );
            return;
        }

        match self.store.get_cluster(&cluster_key) {
            Ok(Some(cluster)) => {
                let routes = cluster
                    .routes
                    .iter()
                    .map(|(rid, entry)| {
                        (
                            rid.clone(),
                            entry.score_history.iter().map(|s| s.value).collect(),
                        )
                    })
                    .collect();
                self.area_worker.submit(AreaScoreRequest { routes });
            }
            Ok(None) => {}
            Err(err) => warn!("cluster fetch failed for '{}': {}", cluster_key, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::scorer::DisabledScorer;
    use crate::store::MemoryStore;
    use crate::{AreaCluster, ClusterRouteEntry, GpsPoint, RoutePlan, TravelMode};

    struct RecordingNotifier {
        alerts: Mutex<Vec<EmergencyAlert>>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                alerts: Mutex::new(Vec::new()),
            }
        }

        fn count(&self) -> usize {
            self.alerts.lock().unwrap().len()
        }
    }

    impl EmergencyNotifier for RecordingNotifier {
        fn notify(&self, alert: &EmergencyAlert) -> Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: EscalationEngine,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture(route_id: &str, users: &[&str]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let rooms = Arc::new(RoomManager::new(
            Arc::clone(&store) as Arc<dyn Repository>,
            retry,
        ));
        store
            .put_route(RoutePlan {
                route_id: route_id.to_string(),
                start: GpsPoint::new(28.61, 77.20),
                end: GpsPoint::new(28.70, 77.10),
                travel_mode: TravelMode::Walking,
                destination_address: "somewhere".to_string(),
                user_count: 0,
                last_updated: 0,
                cluster_key: None,
            })
            .unwrap();
        for user in users {
            rooms.join(route_id, user, GpsPoint::new(28.61, 77.20)).unwrap();
        }
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = EscalationEngine::new(
            Arc::clone(&store) as Arc<dyn Repository>,
            rooms,
            Arc::new(DisabledScorer),
            Arc::clone(&notifier) as Arc<dyn EmergencyNotifier>,
            retry,
        );
        Fixture {
            store,
            engine,
            notifier,
        }
    }

    #[test]
    fn test_high_score_stays_normal() {
        let f = fixture("r1", &["alice"]);
        let score = f.engine.new_score(None, 8.5);
        let outcome = f.engine.on_message_scored("r1", "alice", score).unwrap();
        assert_eq!(outcome, EscalationOutcome::Unchanged);

        let room = f.store.get_room("r1").unwrap().unwrap();
        assert_eq!(room.escalation_state(), EscalationState::Normal);
        assert_eq!(f.notifier.count(), 0);
    }

    #[test]
    fn test_caution_prompts_once() {
        let f = fixture("r1", &["alice"]);

        let outcome = f
            .engine
            .on_message_scored("r1", "alice", f.engine.new_score(None, 5.5))
            .unwrap();
        assert_eq!(
            outcome,
            EscalationOutcome::CautionPrompt {
                user_id: "alice".to_string()
            }
        );

        // Already in Caution, no second prompt
        let outcome = f
            .engine
            .on_message_scored("r1", "alice", f.engine.new_score(None, 5.0))
            .unwrap();
        assert_eq!(outcome, EscalationOutcome::Unchanged);

        let room = f.store.get_room("r1").unwrap().unwrap();
        assert_eq!(room.escalation_state(), EscalationState::Caution);
        assert_eq!(f.notifier.count(), 0);
    }

    #[test]
    fn test_critical_score_auto_throttles_author() {
        let f = fixture("r1", &["alice", "bob"]);

        let outcome = f
            .engine
            .on_message_scored("r1", "alice", f.engine.new_score(None, 2.0))
            .unwrap();
        assert_eq!(
            outcome,
            EscalationOutcome::AutoThrottled {
                user_id: "alice".to_string()
            }
        );

        let room = f.store.get_room("r1").unwrap().unwrap();
        assert_eq!(room.escalation_state(), EscalationState::SosActive);
        assert_eq!(room.sos_trigger_count, 1);
        assert_eq!(room.sos_user_id.as_deref(), Some("alice"));
        assert_eq!(f.notifier.count(), 1);
    }

    #[test]
    fn test_sos_dominates_later_scores() {
        let f = fixture("r1", &["alice"]);
        f.engine
            .on_message_scored("r1", "alice", f.engine.new_score(None, 1.0))
            .unwrap();

        // A perfect score afterwards changes nothing
        let outcome = f
            .engine
            .on_message_scored("r1", "alice", f.engine.new_score(None, 10.0))
            .unwrap();
        assert_eq!(outcome, EscalationOutcome::Unchanged);

        let room = f.store.get_room("r1").unwrap().unwrap();
        assert_eq!(room.escalation_state(), EscalationState::SosActive);
        // And no repeat alert either
        assert_eq!(f.notifier.count(), 1);
    }

    #[test]
    fn test_duplicate_entry_is_skipped() {
        let f = fixture("r1", &["alice"]);
        let score = f.engine.new_score(None, 5.0);

        let first = f
            .engine
            .on_message_scored("r1", "alice", score.clone())
            .unwrap();
        assert_ne!(first, EscalationOutcome::Duplicate);

        let second = f.engine.on_message_scored("r1", "alice", score).unwrap();
        assert_eq!(second, EscalationOutcome::Duplicate);

        let room = f.store.get_room("r1").unwrap().unwrap();
        assert_eq!(room.score_history.len(), 1);
    }

    #[test]
    fn test_throttle_exactly_once_per_user() {
        let f = fixture("r1", &["alice"]);
        let engine = Arc::new(f.engine);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(std::thread::spawn(move || {
                engine.throttle("r1", "alice").unwrap()
            }));
        }
        let outcomes: Vec<ThrottleOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let triggered = outcomes
            .iter()
            .filter(|o| **o == ThrottleOutcome::Triggered)
            .count();
        assert_eq!(triggered, 1);

        let room = f.store.get_room("r1").unwrap().unwrap();
        assert_eq!(room.sos_trigger_count, 1);
        assert_eq!(f.notifier.count(), 1);
    }

    #[test]
    fn test_distinct_users_each_trigger() {
        let f = fixture("r1", &["alice", "bob"]);

        assert_eq!(
            f.engine.throttle("r1", "alice").unwrap(),
            ThrottleOutcome::Triggered
        );
        assert_eq!(
            f.engine.throttle("r1", "bob").unwrap(),
            ThrottleOutcome::Triggered
        );
        assert_eq!(
            f.engine.throttle("r1", "alice").unwrap(),
            ThrottleOutcome::AlreadyTriggered
        );

        let room = f.store.get_room("r1").unwrap().unwrap();
        assert_eq!(room.sos_trigger_count, 2);
        assert_eq!(room.sos_user_id.as_deref(), Some("bob"));
        assert_eq!(f.notifier.count(), 2);
    }

    #[test]
    fn test_score_mirrored_into_cluster() {
        let f = fixture("r1", &["alice"]);

        // Wire the route into a cluster by hand
        let key = "ttnfv2u0q".to_string();
        let mut cluster = AreaCluster::new(key.clone());
        cluster.routes.insert(
            "r1".to_string(),
            ClusterRouteEntry::new(GpsPoint::new(28.61, 77.20), GpsPoint::new(28.70, 77.10)),
        );
        f.store.put_cluster(cluster).unwrap();
        f.store
            .update_route("r1", &mut |plan| plan.cluster_key = Some(key.clone()))
            .unwrap();

        let score = f.engine.new_score(None, 6.0);
        let entry_id = score.entry_id.clone();
        f.engine.on_message_scored("r1", "alice", score).unwrap();

        let cluster = f.store.get_cluster("ttnfv2u0q").unwrap().unwrap();
        let history = &cluster.routes["r1"].score_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].entry_id, entry_id);
    }

    #[test]
    fn test_unknown_room_is_an_error() {
        let f = fixture("r1", &["alice"]);
        let score = f.engine.new_score(None, 5.0);
        let result = f.engine.on_message_scored("nope", "alice", score);
        assert!(matches!(result, Err(SentinelError::RoomNotFound { .. })));
    }
}
