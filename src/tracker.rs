//! Live location synchronization.
//!
//! A [`LocationSync`] runs a background thread that polls a
//! [`LocationProvider`] and pushes each fresh fix into the traveler record
//! and the member's room entry. Both writes are best-effort: a failed tick
//! is logged and the loop moves on, because the next fix supersedes it
//! anyway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{Result, SentinelError};
use crate::rooms::RoomManager;
use crate::store::Repository;
use crate::GpsPoint;

/// Watch options, mirroring the usual geolocation API knobs.
#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    /// Ask the provider for GPS-grade fixes rather than cell/wifi ones.
    pub high_accuracy: bool,
    /// Cached fixes older than this are useless to other members.
    pub max_staleness: Duration,
    /// How long one `next_sample` call may block before the tick is
    /// abandoned.
    pub sample_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            max_staleness: Duration::from_secs(3),
            sample_timeout: Duration::from_secs(10),
        }
    }
}

/// One position fix from the provider.
#[derive(Debug, Clone, Copy)]
pub struct PositionSample {
    pub point: GpsPoint,
    /// Reported accuracy radius in meters, when the provider knows it.
    pub accuracy_m: Option<f64>,
    /// Millis since epoch at which the fix was taken.
    pub timestamp: u64,
}

/// Source of position fixes. Implementations wrap a platform geolocation
/// API or, in tests, a scripted sequence.
pub trait LocationProvider: Send + 'static {
    /// Acquire whatever permission or hardware the provider needs. An
    /// error here (denied permission, no receiver) aborts the sync before
    /// the background thread starts.
    fn start_watch(&mut self, _config: &WatchConfig) -> Result<()> {
        Ok(())
    }

    /// Block for up to `config.sample_timeout` and return the next fix.
    /// `Ok(None)` means no fix arrived this tick; `Err` ends the watch.
    fn next_sample(&mut self, config: &WatchConfig) -> Result<Option<PositionSample>>;
}

impl LocationProvider for Box<dyn LocationProvider> {
    fn start_watch(&mut self, config: &WatchConfig) -> Result<()> {
        (**self).start_watch(config)
    }

    fn next_sample(&mut self, config: &WatchConfig) -> Result<Option<PositionSample>> {
        (**self).next_sample(config)
    }
}

/// Handle to a running location sync. Stopping is idempotent; dropping the
/// handle stops the sync.
pub struct SyncHandle {
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Signal the watch loop to stop and wait for it to finish.
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("location sync thread panicked");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns and owns the watch loop for one member of one room.
pub struct LocationSync;

impl LocationSync {
    /// Start watching. Returns an error without spawning anything if the
    /// provider refuses to start (typically denied permission), so the
    /// caller can degrade to a session without live location.
    pub fn start(
        mut provider: impl LocationProvider,
        store: Arc<dyn Repository>,
        rooms: Arc<RoomManager>,
        route_id: &str,
        user_id: &str,
        config: WatchConfig,
    ) -> Result<SyncHandle> {
        provider.start_watch(&config)?;

        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stopped = Arc::clone(&stopped);
        let route_id = route_id.to_string();
        let user_id = user_id.to_string();

        let handle = std::thread::spawn(move || {
            while !thread_stopped.load(Ordering::SeqCst) {
                let sample = match provider.next_sample(&config) {
                    Ok(Some(sample)) => sample,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(
                            "location watch for '{}' on route '{}' ended: {}",
                            user_id, route_id, err
                        );
                        break;
                    }
                };

                if !sample.point.is_valid() {
                    debug!(
                        "discarding invalid fix ({}, {}) for '{}'",
                        sample.point.latitude, sample.point.longitude, user_id
                    );
                    continue;
                }

                // Two independent best-effort writes; a failure in one must
                // not block the other.
                let traveler_write = store.update_traveler(&user_id, &mut |traveler| {
                    traveler.current = sample.point;
                });
                if let Err(err) = traveler_write {
                    warn!("traveler position write failed for '{}': {}", user_id, err);
                }

                if let Err(err) =
                    rooms.update_member_location(&route_id, &user_id, sample.point)
                {
                    warn!(
                        "room position write failed for '{}' on route '{}': {}",
                        user_id, route_id, err
                    );
                }
            }
        });

        Ok(SyncHandle {
            stopped,
            handle: Some(handle),
        })
    }
}

// Convenience for callers that want an always-failing provider (platforms
// without geolocation).
pub struct NoLocationProvider;

impl LocationProvider for NoLocationProvider {
    fn start_watch(&mut self, _config: &WatchConfig) -> Result<()> {
        Err(SentinelError::LocationUnavailable {
            message: "no location provider on this platform".to_string(),
        })
    }

    fn next_sample(&mut self, _config: &WatchConfig) -> Result<Option<PositionSample>> {
        Err(SentinelError::LocationUnavailable {
            message: "no location provider on this platform".to_string(),
        })
    }
}
