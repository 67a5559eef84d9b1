//! External collaborator contracts.
//!
//! Three services sit outside the engine: the per-message threat scorer,
//! the area-level scorer and the emergency notifier. The engine only sees
//! the traits defined here; the `http` feature provides blocking reqwest
//! implementations against the usual JSON endpoints.
//!
//! Scores run 0-10 with lower meaning more dangerous. Responses are
//! validated before they enter the engine: a non-finite or out-of-range
//! score is a collaborator error, never a stored value.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SentinelError};
use crate::Message;

/// One line of chat context for the message scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatLine {
    pub user_id: String,
    pub message: String,
}

/// Request to score a single message against its room context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageScoreRequest {
    pub room_id: String,
    /// Recent room context, oldest first.
    pub messages: Vec<ChatLine>,
    #[serde(rename = "currentUsermessage")]
    pub current_message: String,
    pub current_user_id: String,
}

/// Scorer verdict for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageScoreResponse {
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MessageScoreResponse {
    /// Reject non-finite or out-of-range scores before they reach the
    /// escalation pipeline.
    pub fn validate(&self) -> Result<f64> {
        if !self.score.is_finite() || !(0.0..=10.0).contains(&self.score) {
            return Err(SentinelError::collaborator(
                "message scorer",
                format!("score {} outside 0-10", self.score),
            ));
        }
        Ok(self.score)
    }
}

/// Request for an area-level assessment: every route in the cluster with
/// its full score history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaScoreRequest {
    pub routes: BTreeMap<String, Vec<f64>>,
}

/// Area scorer output. Advisory only; it never mutates engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaAdvisory {
    pub summary: String,
    #[serde(default)]
    pub flagged_routes: Vec<String>,
}

/// Payload delivered to emergency services on an SOS trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAlert {
    pub route_id: String,
    pub user_id: String,
    /// Recent room messages, for responder context.
    pub messages: Vec<Message>,
}

/// Scores individual messages.
pub trait MessageScorer: Send + Sync {
    fn score_message(&self, request: &MessageScoreRequest) -> Result<MessageScoreResponse>;
}

/// Assesses a whole area cluster.
pub trait AreaScorer: Send + Sync {
    fn assess_area(&self, request: &AreaScoreRequest) -> Result<AreaAdvisory>;
}

/// Delivers SOS alerts to the outside world.
pub trait EmergencyNotifier: Send + Sync {
    fn notify(&self, alert: &EmergencyAlert) -> Result<()>;
}

/// A scorer that always declines. Messages pass through unscored, which
/// the escalation pipeline treats as "no new signal".
pub struct DisabledScorer;

impl MessageScorer for DisabledScorer {
    fn score_message(&self, _request: &MessageScoreRequest) -> Result<MessageScoreResponse> {
        Err(SentinelError::collaborator("message scorer", "disabled"))
    }
}

impl AreaScorer for DisabledScorer {
    fn assess_area(&self, _request: &AreaScoreRequest) -> Result<AreaAdvisory> {
        Err(SentinelError::collaborator("area scorer", "disabled"))
    }
}

/// Notifier of last resort: writes the alert to the log and succeeds, so
/// SOS state still advances when no real channel is wired up.
pub struct LogOnlyNotifier;

impl EmergencyNotifier for LogOnlyNotifier {
    fn notify(&self, alert: &EmergencyAlert) -> Result<()> {
        warn!(
            "SOS on route '{}' by '{}' ({} context messages) - no emergency channel configured",
            alert.route_id,
            alert.user_id,
            alert.messages.len()
        );
        Ok(())
    }
}

// ============================================================================
// HTTP implementations (feature-gated)
// ============================================================================

#[cfg(feature = "http")]
pub use self::http::{HttpAreaScorer, HttpEmergencyNotifier, HttpMessageScorer};

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use log::{debug, warn};
    use reqwest::blocking::Client;
    use reqwest::StatusCode;
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    use super::*;

    const MAX_RETRIES: u32 = 3;
    const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

    fn build_client() -> Result<Client> {
        Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SentinelError::collaborator("http", format!("client build: {}", e)))
    }

    /// POST a JSON body and decode a JSON response, retrying 429 and 5xx
    /// with exponential backoff.
    fn post_json<B: Serialize, T: DeserializeOwned>(
        client: &Client,
        service: &str,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = String::new();

        for attempt in 1..=MAX_RETRIES {
            let response = match client.post(url).json(body).send() {
                Ok(response) => response,
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "{} request failed (attempt {}/{}): {}",
                        service, attempt, MAX_RETRIES, last_error
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_error = format!("status {}", status);
                warn!(
                    "{} returned {} (attempt {}/{}), backing off {:?}",
                    service, status, attempt, MAX_RETRIES, backoff
                );
                std::thread::sleep(backoff);
                backoff *= 2;
                continue;
            }
            if !status.is_success() {
                return Err(SentinelError::collaborator(
                    service,
                    format!("status {}", status),
                ));
            }

            debug!("{} responded {} on attempt {}", service, status, attempt);
            return response
                .json::<T>()
                .map_err(|e| SentinelError::collaborator(service, format!("decode: {}", e)));
        }

        Err(SentinelError::collaborator(
            service,
            format!("gave up after {} attempts: {}", MAX_RETRIES, last_error),
        ))
    }

    /// Message scorer against a `POST {base}/score` endpoint.
    pub struct HttpMessageScorer {
        client: Client,
        url: String,
    }

    impl HttpMessageScorer {
        pub fn new(base_url: &str) -> Result<Self> {
            Ok(Self {
                client: build_client()?,
                url: format!("{}/score", base_url.trim_end_matches('/')),
            })
        }
    }

    impl MessageScorer for HttpMessageScorer {
        fn score_message(&self, request: &MessageScoreRequest) -> Result<MessageScoreResponse> {
            post_json(&self.client, "message scorer", &self.url, request)
        }
    }

    /// Area scorer against a `POST {base}/agent2` endpoint. The payload is
    /// wrapped in a `payload` envelope.
    pub struct HttpAreaScorer {
        client: Client,
        url: String,
    }

    #[derive(Serialize)]
    struct AreaEnvelope<'a> {
        payload: &'a AreaScoreRequest,
    }

    impl HttpAreaScorer {
        pub fn new(base_url: &str) -> Result<Self> {
            Ok(Self {
                client: build_client()?,
                url: format!("{}/agent2", base_url.trim_end_matches('/')),
            })
        }
    }

    impl AreaScorer for HttpAreaScorer {
        fn assess_area(&self, request: &AreaScoreRequest) -> Result<AreaAdvisory> {
            post_json(
                &self.client,
                "area scorer",
                &self.url,
                &AreaEnvelope { payload: request },
            )
        }
    }

    /// Emergency notifier against a `POST {base}/throttle` endpoint.
    pub struct HttpEmergencyNotifier {
        client: Client,
        url: String,
    }

    #[derive(Deserialize)]
    struct Ack {
        #[serde(default)]
        #[allow(dead_code)]
        ok: bool,
    }

    impl HttpEmergencyNotifier {
        pub fn new(base_url: &str) -> Result<Self> {
            Ok(Self {
                client: build_client()?,
                url: format!("{}/throttle", base_url.trim_end_matches('/')),
            })
        }
    }

    impl EmergencyNotifier for HttpEmergencyNotifier {
        fn notify(&self, alert: &EmergencyAlert) -> Result<()> {
            let _: Ack = post_json(&self.client, "emergency notifier", &self.url, alert)?;
            Ok(())
        }
    }
}
