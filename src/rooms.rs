//! Route room lifecycle and the live snapshot feed.
//!
//! One room per route. Members join and leave, push location updates and
//! chat messages; every committed change is fanned out to subscribers as a
//! full room snapshot. The room shell survives the last member leaving
//! (only the transient session state is cleared), so historical routes can
//! be rejoined cheaply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use log::{debug, warn};

use crate::error::{Result, SentinelError};
use crate::store::{with_retries, Repository, RetryPolicy};
use crate::{now_millis, GpsPoint, Member, MemberStatus, Message, RouteRoom};

/// Receiving end of a room's snapshot feed. The sender side is pruned
/// automatically once the receiver is dropped.
pub type RoomFeed = mpsc::Receiver<RouteRoom>;

/// Manages room membership, messaging and snapshot fan-out.
pub struct RoomManager {
    store: Arc<dyn Repository>,
    retry: RetryPolicy,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<RouteRoom>>>>,
    next_message_seq: AtomicU64,
}

impl RoomManager {
    pub fn new(store: Arc<dyn Repository>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            subscribers: Mutex::new(HashMap::new()),
            next_message_seq: AtomicU64::new(1),
        }
    }

    /// Fetch the room for a route, creating the shell if none exists yet.
    pub fn create_or_get_room(&self, route_id: &str) -> Result<RouteRoom> {
        if let Some(room) = self.store.get_room(route_id)? {
            return Ok(room);
        }
        let room = RouteRoom::new(route_id);
        with_retries(&self.retry, "create room", || {
            self.store.put_room(room.clone())
        })?;
        Ok(room)
    }

    /// Add a member to the room and bump the route's active-user counter.
    ///
    /// Rejoining is an upsert and does not bump the counter again. If the
    /// counter write fails permanently the member entry is rolled back so
    /// `user_count` never exceeds the member set because of a failed join.
    pub fn join(&self, route_id: &str, user_id: &str, start: GpsPoint) -> Result<()> {
        if !start.is_valid() {
            return Err(SentinelError::InvalidCoordinates {
                message: format!(
                    "join for '{}' at ({}, {})",
                    user_id, start.latitude, start.longitude
                ),
            });
        }

        self.create_or_get_room(route_id)?;

        let mut newly_joined = false;
        let found = with_retries(&self.retry, "join room", || {
            newly_joined = false;
            let uid = user_id.to_string();
            self.store.update_room(route_id, &mut |room| {
                newly_joined = !room.members.contains_key(&uid);
                room.members.insert(
                    uid.clone(),
                    Member {
                        user_id: uid.clone(),
                        joined_at: now_millis(),
                        current: start,
                        status: MemberStatus::Active,
                    },
                );
            })
        })?;
        if !found {
            return Err(SentinelError::RoomNotFound {
                route_id: route_id.to_string(),
            });
        }

        if newly_joined {
            let counter = with_retries(&self.retry, "increment user count", || {
                self.store.update_route(route_id, &mut |plan| {
                    plan.user_count += 1;
                    plan.last_updated = now_millis();
                })
            });
            match counter {
                Ok(true) => {}
                Ok(false) => {
                    debug!("no plan for route '{}', counter not tracked", route_id);
                }
                Err(err) => {
                    // Roll the member back before surfacing the error
                    let rollback = with_retries(&self.retry, "join rollback", || {
                        let uid = user_id.to_string();
                        self.store.update_room(route_id, &mut |room| {
                            room.members.remove(&uid);
                        })
                    });
                    if let Err(rb_err) = rollback {
                        warn!(
                            "join rollback failed for '{}' on route '{}': {}",
                            user_id, route_id, rb_err
                        );
                    }
                    return Err(err);
                }
            }
        }

        self.publish(route_id);
        Ok(())
    }

    /// Remove a member. When the last member leaves, the room's transient
    /// session state is cleared but the shell is retained.
    pub fn leave(&self, route_id: &str, user_id: &str) -> Result<()> {
        let mut removed = false;
        let found = with_retries(&self.retry, "leave room", || {
            removed = false;
            let uid = user_id.to_string();
            self.store.update_room(route_id, &mut |room| {
                removed = room.members.remove(&uid).is_some();
                if room.members.is_empty() {
                    room.reset_session();
                }
            })
        })?;
        if !found || !removed {
            // Leaving twice is a no-op
            return Ok(());
        }

        let counter = with_retries(&self.retry, "decrement user count", || {
            self.store.update_route(route_id, &mut |plan| {
                plan.user_count = plan.user_count.saturating_sub(1);
                plan.last_updated = now_millis();
            })
        });
        if let Err(err) = counter {
            warn!("user count decrement failed for route '{}': {}", route_id, err);
        }

        // The trip is over for this user; their traveler record goes
        // inactive. Best-effort, and only if it still points at this route.
        let traveler = with_retries(&self.retry, "mark traveler inactive", || {
            let rid = route_id.to_string();
            self.store.update_traveler(user_id, &mut |traveler| {
                if traveler.route_id == rid {
                    traveler.status = MemberStatus::Inactive;
                }
            })
        });
        if let Err(err) = traveler {
            warn!("traveler status update failed for '{}': {}", user_id, err);
        }

        self.publish(route_id);
        Ok(())
    }

    /// Overwrite a member's live position. Updates for users who already
    /// left are silently discarded (the watch loop may outlive membership
    /// by one tick).
    pub fn update_member_location(
        &self,
        route_id: &str,
        user_id: &str,
        point: GpsPoint,
    ) -> Result<()> {
        if !point.is_valid() {
            return Err(SentinelError::InvalidCoordinates {
                message: format!("location ({}, {})", point.latitude, point.longitude),
            });
        }

        let mut present = false;
        with_retries(&self.retry, "update member location", || {
            present = false;
            let uid = user_id.to_string();
            self.store.update_room(route_id, &mut |room| {
                if let Some(member) = room.members.get_mut(&uid) {
                    member.current = point;
                    present = true;
                }
            })
        })?;

        if present {
            self.publish(route_id);
        }
        Ok(())
    }

    /// Append a chat message. The timestamp is assigned here, never taken
    /// from the caller.
    pub fn send_message(&self, route_id: &str, user_id: &str, text: &str) -> Result<Message> {
        let seq = self.next_message_seq.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id: format!("{}-{}", route_id, seq),
            user_id: user_id.to_string(),
            text: text.to_string(),
            timestamp: now_millis(),
        };

        let found = with_retries(&self.retry, "send message", || {
            let msg = message.clone();
            self.store.update_room(route_id, &mut move |room| {
                // Closure may rerun on retry; id makes the append idempotent
                if !room.messages.iter().any(|m| m.id == msg.id) {
                    room.messages.push(msg.clone());
                }
            })
        })?;
        if !found {
            return Err(SentinelError::RoomNotFound {
                route_id: route_id.to_string(),
            });
        }

        self.publish(route_id);
        Ok(message)
    }

    /// Subscribe to room snapshots. Each committed change to the room
    /// produces one snapshot on the feed. Dropping the receiver ends the
    /// subscription.
    pub fn subscribe(&self, route_id: &str) -> RoomFeed {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.entry(route_id.to_string()).or_default().push(tx);
        }
        rx
    }

    /// Fan the current room snapshot out to subscribers, pruning any whose
    /// receiver has gone away.
    pub fn publish(&self, route_id: &str) {
        let room = match self.store.get_room(route_id) {
            Ok(Some(room)) => room,
            Ok(None) => return,
            Err(err) => {
                warn!("snapshot fetch failed for route '{}': {}", route_id, err);
                return;
            }
        };

        if let Ok(mut subs) = self.subscribers.lock() {
            if let Some(senders) = subs.get_mut(route_id) {
                senders.retain(|tx| tx.send(room.clone()).is_ok());
                if senders.is_empty() {
                    subs.remove(route_id);
                }
            }
        }
    }
}
