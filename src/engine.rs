//! Engine façade.
//!
//! [`SafetyEngine`] ties the managers together behind a small API: plan a
//! route, join its room (optionally with live location), chat through the
//! scoring pipeline, confirm or trigger SOS, read stats. Applications hold
//! one engine for the life of the process and one [`RoomSession`] per
//! active trip.

use std::sync::Arc;

use log::warn;
use serde::Serialize;

use crate::audit::{AuditEntry, AuditLog, MemoryAuditLog};
use crate::clusters::ClusterManager;
use crate::error::{OptionExt, Result, SentinelError};
use crate::escalation::{EscalationEngine, EscalationOutcome, ThrottleOutcome};
use crate::rooms::{RoomFeed, RoomManager};
use crate::scorer::{
    AreaScorer, ChatLine, DisabledScorer, EmergencyNotifier, LogOnlyNotifier, MessageScoreRequest,
    MessageScorer,
};
use crate::store::{with_retries, Repository, RetryPolicy};
use crate::tracker::{LocationProvider, LocationSync, SyncHandle, WatchConfig};
use crate::{now_millis, GpsPoint, MemberStatus, Message, RoutePlan, TravelMode, Traveler};

/// How much room context accompanies each scoring request.
const SCORE_CONTEXT_MESSAGES: usize = 10;

/// Tunables shared by the managers.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub watch: WatchConfig,
}

/// The external services the engine talks to. Each slot has a no-op
/// default, so a bare engine works offline.
#[derive(Clone)]
pub struct Collaborators {
    pub message_scorer: Arc<dyn MessageScorer>,
    pub area_scorer: Arc<dyn AreaScorer>,
    pub notifier: Arc<dyn EmergencyNotifier>,
    pub audit: Arc<dyn AuditLog>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            message_scorer: Arc::new(DisabledScorer),
            area_scorer: Arc::new(DisabledScorer),
            notifier: Arc::new(LogOnlyNotifier),
            audit: Arc::new(MemoryAuditLog::new()),
        }
    }
}

/// Everything needed to plan one trip.
#[derive(Debug, Clone)]
pub struct RoutePlanRequest {
    pub user_id: String,
    /// Stable destination identity; becomes the route id.
    pub destination_place_id: String,
    pub destination_address: String,
    pub travel_mode: TravelMode,
    pub start: GpsPoint,
    pub end: GpsPoint,
}

/// What handling one chat message produced.
#[derive(Debug)]
pub struct ChatOutcome {
    pub message: Message,
    /// `None` when the scorer was unavailable and the message went
    /// through unscored.
    pub escalation: Option<EscalationOutcome>,
}

/// Counters for dashboards and tests.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub route_count: usize,
    pub room_count: usize,
    pub cluster_count: usize,
}

/// The central engine. Cheap to share behind an `Arc`.
pub struct SafetyEngine {
    store: Arc<dyn Repository>,
    rooms: Arc<RoomManager>,
    clusters: ClusterManager,
    escalation: EscalationEngine,
    message_scorer: Arc<dyn MessageScorer>,
    audit: Arc<dyn AuditLog>,
    retry: RetryPolicy,
    watch: WatchConfig,
}

impl SafetyEngine {
    pub fn new(store: Arc<dyn Repository>, collaborators: Collaborators) -> Self {
        Self::with_config(store, collaborators, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn Repository>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        let rooms = Arc::new(RoomManager::new(Arc::clone(&store), config.retry));
        let clusters = ClusterManager::new(Arc::clone(&store), config.retry);
        let escalation = EscalationEngine::new(
            Arc::clone(&store),
            Arc::clone(&rooms),
            collaborators.area_scorer,
            collaborators.notifier,
            config.retry,
        );
        Self {
            store,
            rooms,
            clusters,
            escalation,
            message_scorer: collaborators.message_scorer,
            audit: collaborators.audit,
            retry: config.retry,
            watch: config.watch,
        }
    }

    /// Plan a trip: record the traveler, upsert the route plan, assign the
    /// area cluster and make sure the room shell exists. Returns the route
    /// id (the destination place id).
    pub fn plan_route(&self, request: &RoutePlanRequest) -> Result<String> {
        if !request.start.is_valid() || !request.end.is_valid() {
            return Err(SentinelError::InvalidCoordinates {
                message: format!("plan for user '{}'", request.user_id),
            });
        }
        let route_id = request.destination_place_id.clone();

        let traveler = Traveler {
            user_id: request.user_id.clone(),
            route_id: route_id.clone(),
            start: request.start,
            end: request.end,
            current: request.start,
            status: MemberStatus::Active,
        };
        with_retries(&self.retry, "record traveler", || {
            self.store.put_traveler(traveler.clone())
        })?;

        // Upsert: replanning an existing route refreshes its endpoints but
        // never touches the active-user counter or cluster assignment.
        let existed = with_retries(&self.retry, "refresh plan", || {
            self.store.update_route(&route_id, &mut |plan| {
                plan.start = request.start;
                plan.end = request.end;
                plan.travel_mode = request.travel_mode;
                plan.destination_address = request.destination_address.clone();
                plan.last_updated = now_millis();
            })
        })?;
        if !existed {
            let plan = RoutePlan {
                route_id: route_id.clone(),
                start: request.start,
                end: request.end,
                travel_mode: request.travel_mode,
                destination_address: request.destination_address.clone(),
                user_count: 0,
                last_updated: now_millis(),
                cluster_key: None,
            };
            with_retries(&self.retry, "create plan", || {
                self.store.put_route(plan.clone())
            })?;
        }

        self.clusters
            .assign_cluster(&route_id, request.start, request.end)?;
        self.rooms.create_or_get_room(&route_id)?;

        Ok(route_id)
    }

    /// Join a route's room. With a location provider, live position sync
    /// starts alongside; if the provider refuses (denied permission), the
    /// session still opens, just without live location.
    pub fn join_route(
        &self,
        route_id: &str,
        user_id: &str,
        provider: Option<Box<dyn LocationProvider>>,
    ) -> Result<RoomSession> {
        let start = match self.store.get_traveler(user_id)? {
            Some(traveler) if traveler.route_id == route_id => traveler.current,
            _ => {
                self.store
                    .get_route(route_id)?
                    .ok_or_else(|| SentinelError::RouteNotFound {
                        route_id: route_id.to_string(),
                    })?
                    .start
            }
        };

        self.rooms.join(route_id, user_id, start)?;
        let feed = self.rooms.subscribe(route_id);

        let sync = match provider {
            Some(provider) => match LocationSync::start(
                provider,
                Arc::clone(&self.store),
                Arc::clone(&self.rooms),
                route_id,
                user_id,
                self.watch,
            ) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(
                        "live location unavailable for '{}' on route '{}': {}",
                        user_id, route_id, err
                    );
                    None
                }
            },
            None => None,
        };

        Ok(RoomSession {
            route_id: route_id.to_string(),
            user_id: user_id.to_string(),
            rooms: Arc::clone(&self.rooms),
            feed,
            sync,
            left: false,
        })
    }

    /// Run one chat message through the room and the scoring pipeline.
    ///
    /// The message always lands in the room and the audit log first. If
    /// the scorer is unreachable or returns garbage, the message stays
    /// unscored and `escalation` is `None`; room state is untouched.
    pub fn handle_chat_message(
        &self,
        route_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<ChatOutcome> {
        let message = self.rooms.send_message(route_id, user_id, text)?;

        let audit_entry = AuditEntry {
            room_id: route_id.to_string(),
            user_id: user_id.to_string(),
            message: text.to_string(),
            timestamp: message.timestamp,
        };
        if let Err(err) = self.audit.append(&audit_entry) {
            warn!("audit append failed for route '{}': {}", route_id, err);
        }

        let room = self
            .store
            .get_room(route_id)?
            .ok_or_missing_room(route_id)?;
        let context: Vec<ChatLine> = room
            .messages
            .iter()
            .filter(|m| m.id != message.id)
            .rev()
            .take(SCORE_CONTEXT_MESSAGES)
            .map(|m| ChatLine {
                user_id: m.user_id.clone(),
                message: m.text.clone(),
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let request = MessageScoreRequest {
            room_id: route_id.to_string(),
            messages: context,
            current_message: text.to_string(),
            current_user_id: user_id.to_string(),
        };

        let escalation = match self
            .message_scorer
            .score_message(&request)
            .and_then(|response| response.validate())
        {
            Ok(value) => {
                let score = self.escalation.new_score(Some(message.id.clone()), value);
                Some(self.escalation.on_message_scored(route_id, user_id, score)?)
            }
            Err(err) => {
                warn!("message unscored on route '{}': {}", route_id, err);
                None
            }
        };

        Ok(ChatOutcome {
            message,
            escalation,
        })
    }

    /// The user answered a caution prompt with "I don't feel safe".
    pub fn confirm_unsafe(&self, route_id: &str, user_id: &str) -> Result<ThrottleOutcome> {
        self.escalation.throttle(route_id, user_id)
    }

    /// Manual SOS button.
    pub fn trigger_sos(&self, route_id: &str, user_id: &str) -> Result<ThrottleOutcome> {
        self.escalation.throttle(route_id, user_id)
    }

    /// Current escalation state of a room.
    pub fn escalation_state(&self, route_id: &str) -> Result<crate::EscalationState> {
        Ok(self
            .store
            .get_room(route_id)?
            .ok_or_missing_room(route_id)?
            .escalation_state())
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            route_count: self.store.route_ids()?.len(),
            room_count: self.store.room_ids()?.len(),
            cluster_count: self.store.clusters()?.len(),
        })
    }
}

/// One user's presence in one room. Leaving (or dropping the session)
/// stops the location sync and releases membership.
pub struct RoomSession {
    route_id: String,
    user_id: String,
    rooms: Arc<RoomManager>,
    feed: RoomFeed,
    sync: Option<SyncHandle>,
    left: bool,
}

impl RoomSession {
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Snapshot feed for this room; one snapshot per committed change.
    pub fn feed(&self) -> &RoomFeed {
        &self.feed
    }

    /// Whether live location sync is running for this session.
    pub fn has_location_sync(&self) -> bool {
        self.sync.as_ref().map(|s| !s.is_stopped()).unwrap_or(false)
    }

    /// Leave the room explicitly. Equivalent to dropping the session but
    /// surfaces the error.
    pub fn leave(mut self) -> Result<()> {
        self.leave_inner()
    }

    fn leave_inner(&mut self) -> Result<()> {
        if self.left {
            return Ok(());
        }
        self.left = true;
        if let Some(sync) = &mut self.sync {
            sync.stop();
        }
        self.rooms.leave(&self.route_id, &self.user_id)
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if let Err(err) = self.leave_inner() {
            warn!(
                "leave failed for '{}' on route '{}': {}",
                self.user_id, self.route_id, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::scorer::{EmergencyAlert, MessageScoreResponse};
    use crate::store::MemoryStore;
    use crate::tracker::NoLocationProvider;
    use crate::EscalationState;

    /// Replays a scripted list of scores, then declines.
    struct ScriptedScorer {
        scores: Mutex<VecDeque<f64>>,
    }

    impl ScriptedScorer {
        fn new(scores: &[f64]) -> Self {
            Self {
                scores: Mutex::new(scores.iter().copied().collect()),
            }
        }
    }

    impl MessageScorer for ScriptedScorer {
        fn score_message(&self, _request: &MessageScoreRequest) -> Result<MessageScoreResponse> {
            match self.scores.lock().unwrap().pop_front() {
                Some(score) => Ok(MessageScoreResponse {
                    score,
                    reason: None,
                }),
                None => Err(SentinelError::collaborator("message scorer", "script done")),
            }
        }
    }

    struct RecordingNotifier {
        alerts: Mutex<Vec<EmergencyAlert>>,
    }

    impl EmergencyNotifier for RecordingNotifier {
        fn notify(&self, alert: &EmergencyAlert) -> Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    fn plan(user: &str, place: &str, start: GpsPoint) -> RoutePlanRequest {
        RoutePlanRequest {
            user_id: user.to_string(),
            destination_place_id: place.to_string(),
            destination_address: "Connaught Place".to_string(),
            travel_mode: TravelMode::Walking,
            start,
            end: GpsPoint::new(28.70, 77.10),
        }
    }

    fn engine_with(scores: &[f64]) -> (SafetyEngine, Arc<RecordingNotifier>, Arc<MemoryAuditLog>) {
        let notifier = Arc::new(RecordingNotifier {
            alerts: Mutex::new(Vec::new()),
        });
        let audit = Arc::new(MemoryAuditLog::new());
        let collaborators = Collaborators {
            message_scorer: Arc::new(ScriptedScorer::new(scores)),
            notifier: Arc::clone(&notifier) as Arc<dyn EmergencyNotifier>,
            audit: Arc::clone(&audit) as Arc<dyn AuditLog>,
            ..Collaborators::default()
        };
        let engine = SafetyEngine::new(Arc::new(MemoryStore::new()), collaborators);
        (engine, notifier, audit)
    }

    #[test]
    fn test_plan_join_chat_flow() {
        let (engine, _, audit) = engine_with(&[8.5]);

        let route_id = engine
            .plan_route(&plan("alice", "place-1", GpsPoint::new(28.61, 77.20)))
            .unwrap();
        assert_eq!(route_id, "place-1");

        let session = engine.join_route(&route_id, "alice", None).unwrap();
        assert!(!session.has_location_sync());

        let outcome = engine
            .handle_chat_message(&route_id, "alice", "on my way")
            .unwrap();
        assert_eq!(outcome.escalation, Some(EscalationOutcome::Unchanged));
        assert_eq!(
            engine.escalation_state(&route_id).unwrap(),
            EscalationState::Normal
        );
        assert_eq!(audit.len(), 1);
        assert_eq!(audit.entries()[0].message, "on my way");

        session.leave().unwrap();
    }

    #[test]
    fn test_scorer_failure_leaves_state_untouched() {
        // Empty script: every scoring attempt declines
        let (engine, notifier, _) = engine_with(&[]);
        let route_id = engine
            .plan_route(&plan("alice", "place-1", GpsPoint::new(28.61, 77.20)))
            .unwrap();
        let _session = engine.join_route(&route_id, "alice", None).unwrap();

        let outcome = engine
            .handle_chat_message(&route_id, "alice", "hello?")
            .unwrap();
        assert!(outcome.escalation.is_none());

        // Message landed, nothing else moved
        let room = engine.store.get_room(&route_id).unwrap().unwrap();
        assert_eq!(room.messages.len(), 1);
        assert!(room.score_history.is_empty());
        assert_eq!(room.escalation_state(), EscalationState::Normal);
        assert!(notifier.alerts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_escalation_through_chat() {
        let (engine, notifier, _) = engine_with(&[5.0, 2.5]);
        let route_id = engine
            .plan_route(&plan("alice", "place-1", GpsPoint::new(28.61, 77.20)))
            .unwrap();
        let _session = engine.join_route(&route_id, "alice", None).unwrap();

        let first = engine
            .handle_chat_message(&route_id, "alice", "this street feels off")
            .unwrap();
        assert_eq!(
            first.escalation,
            Some(EscalationOutcome::CautionPrompt {
                user_id: "alice".to_string()
            })
        );

        let second = engine
            .handle_chat_message(&route_id, "alice", "someone is following me")
            .unwrap();
        assert_eq!(
            second.escalation,
            Some(EscalationOutcome::AutoThrottled {
                user_id: "alice".to_string()
            })
        );

        assert_eq!(
            engine.escalation_state(&route_id).unwrap(),
            EscalationState::SosActive
        );
        let alerts = notifier.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].user_id, "alice");
        // Alert carries the room context
        assert_eq!(alerts[0].messages.len(), 2);
    }

    #[test]
    fn test_manual_sos_without_any_scores() {
        let (engine, notifier, _) = engine_with(&[]);
        let route_id = engine
            .plan_route(&plan("alice", "place-1", GpsPoint::new(28.61, 77.20)))
            .unwrap();
        let _session = engine.join_route(&route_id, "alice", None).unwrap();

        assert_eq!(
            engine.trigger_sos(&route_id, "alice").unwrap(),
            ThrottleOutcome::Triggered
        );
        assert_eq!(
            engine.trigger_sos(&route_id, "alice").unwrap(),
            ThrottleOutcome::AlreadyTriggered
        );
        assert_eq!(
            engine.escalation_state(&route_id).unwrap(),
            EscalationState::SosActive
        );
        assert_eq!(notifier.alerts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_nearby_plans_share_a_cluster() {
        let (engine, _, _) = engine_with(&[]);

        engine
            .plan_route(&plan("alice", "place-1", GpsPoint::new(28.6100, 77.2000)))
            .unwrap();
        engine
            .plan_route(&plan("bob", "place-2", GpsPoint::new(28.6150, 77.2050)))
            .unwrap();

        let key1 = engine
            .store
            .get_route("place-1")
            .unwrap()
            .unwrap()
            .cluster_key;
        let key2 = engine
            .store
            .get_route("place-2")
            .unwrap()
            .unwrap()
            .cluster_key;
        assert!(key1.is_some());
        assert_eq!(key1, key2);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.route_count, 2);
        assert_eq!(stats.cluster_count, 1);
    }

    #[test]
    fn test_session_drop_releases_membership() {
        let (engine, _, _) = engine_with(&[]);
        let route_id = engine
            .plan_route(&plan("alice", "place-1", GpsPoint::new(28.61, 77.20)))
            .unwrap();

        {
            let _session = engine.join_route(&route_id, "alice", None).unwrap();
            let plan = engine.store.get_route(&route_id).unwrap().unwrap();
            assert_eq!(plan.user_count, 1);
        }

        let plan = engine.store.get_route(&route_id).unwrap().unwrap();
        assert_eq!(plan.user_count, 0);
        assert!(engine
            .store
            .get_room(&route_id)
            .unwrap()
            .unwrap()
            .members
            .is_empty());
    }

    #[test]
    fn test_replanning_keeps_counter_and_cluster() {
        let (engine, _, _) = engine_with(&[]);
        let route_id = engine
            .plan_route(&plan("alice", "place-1", GpsPoint::new(28.61, 77.20)))
            .unwrap();
        let _session = engine.join_route(&route_id, "alice", None).unwrap();
        let key_before = engine
            .store
            .get_route(&route_id)
            .unwrap()
            .unwrap()
            .cluster_key;

        // Second traveler plans the same destination
        engine
            .plan_route(&plan("bob", "place-1", GpsPoint::new(28.6105, 77.2005)))
            .unwrap();

        let plan = engine.store.get_route(&route_id).unwrap().unwrap();
        assert_eq!(plan.user_count, 1, "replanning must not touch the counter");
        assert_eq!(plan.cluster_key, key_before);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.cluster_count, 1);
    }

    #[test]
    fn test_refusing_provider_degrades_to_no_live_location() {
        let (engine, _, _) = engine_with(&[]);
        let route_id = engine
            .plan_route(&plan("alice", "place-1", GpsPoint::new(28.61, 77.20)))
            .unwrap();

        let session = engine
            .join_route(&route_id, "alice", Some(Box::new(NoLocationProvider)))
            .unwrap();
        assert!(!session.has_location_sync());

        // Membership still opened normally
        let plan = engine.store.get_route(&route_id).unwrap().unwrap();
        assert_eq!(plan.user_count, 1);
        session.leave().unwrap();
    }

    #[test]
    fn test_join_unknown_route_fails() {
        let (engine, _, _) = engine_with(&[]);
        let result = engine.join_route("nowhere", "alice", None);
        assert!(matches!(result, Err(SentinelError::RouteNotFound { .. })));
    }
}
