//! Unified error handling for the route-sentinel library.
//!
//! This module provides a consistent error type for all safety-room
//! operations. Transient storage failures are distinguishable via
//! [`SentinelError::is_transient`] so the write-retry helper knows what is
//! worth retrying.

use std::fmt;

/// Unified error type for safety-room operations.
#[derive(Debug, Clone)]
pub enum SentinelError {
    /// Backing-store failure. `transient` marks errors worth retrying
    /// (network blips); permanent errors surface immediately.
    Storage { message: String, transient: bool },
    /// No RoutePlan exists for this route id
    RouteNotFound { route_id: String },
    /// No room shell exists for this route id
    RoomNotFound { route_id: String },
    /// No cluster exists under this key
    ClusterNotFound { cluster_key: String },
    /// A stored spatial-hash key could not be decoded
    InvalidGeohash { hash: String, message: String },
    /// Latitude/longitude outside valid ranges
    InvalidCoordinates { message: String },
    /// Geolocation permission denied, unavailable, or timed out
    LocationUnavailable { message: String },
    /// An external collaborator (scorer, notifier) failed or returned
    /// a malformed response
    Collaborator { service: String, message: String },
    /// Generic internal error
    Internal { message: String },
}

impl SentinelError {
    /// A retryable storage error.
    pub fn transient(message: impl Into<String>) -> Self {
        SentinelError::Storage {
            message: message.into(),
            transient: true,
        }
    }

    /// A permanent storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        SentinelError::Storage {
            message: message.into(),
            transient: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SentinelError::Internal {
            message: message.into(),
        }
    }

    pub fn collaborator(service: impl Into<String>, message: impl Into<String>) -> Self {
        SentinelError::Collaborator {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Whether a retry inside the managers' retry budget makes sense.
    pub fn is_transient(&self) -> bool {
        matches!(self, SentinelError::Storage { transient: true, .. })
    }
}

impl fmt::Display for SentinelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SentinelError::Storage { message, transient } => {
                if *transient {
                    write!(f, "Transient storage error: {}", message)
                } else {
                    write!(f, "Storage error: {}", message)
                }
            }
            SentinelError::RouteNotFound { route_id } => {
                write!(f, "Route '{}' not found", route_id)
            }
            SentinelError::RoomNotFound { route_id } => {
                write!(f, "Room for route '{}' not found", route_id)
            }
            SentinelError::ClusterNotFound { cluster_key } => {
                write!(f, "Cluster '{}' not found", cluster_key)
            }
            SentinelError::InvalidGeohash { hash, message } => {
                write!(f, "Invalid geohash '{}': {}", hash, message)
            }
            SentinelError::InvalidCoordinates { message } => {
                write!(f, "Invalid coordinates: {}", message)
            }
            SentinelError::LocationUnavailable { message } => {
                write!(f, "Location unavailable: {}", message)
            }
            SentinelError::Collaborator { service, message } => {
                write!(f, "Collaborator '{}' failed: {}", service, message)
            }
            SentinelError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for SentinelError {}

/// Result type alias for safety-room operations.
pub type Result<T> = std::result::Result<T, SentinelError>;

/// Extension trait for converting Option to SentinelError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a missing-room error.
    fn ok_or_missing_room(self, route_id: &str) -> Result<T>;

    /// Convert Option to Result with a generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_missing_room(self, route_id: &str) -> Result<T> {
        self.ok_or_else(|| SentinelError::RoomNotFound {
            route_id: route_id.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| SentinelError::Internal {
            message: message.to_string(),
        })
    }
}
