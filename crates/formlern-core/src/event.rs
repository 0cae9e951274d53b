//! Feedback events reported by the transport layer.
//!
//! A [`FeedbackEvent`] resolves exactly one decision record. The transport
//! delivers at least once and only roughly in order, so consumers must treat
//! `event_id` as the idempotency key.

use crate::cohort::Cohort;
use serde::{Deserialize, Serialize};

/// Observed outcome of a recommended session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Outcome {
    /// Whether the session was completed.
    pub completed: bool,
    /// Rate of perceived exertion, 1-10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpe: Option<f64>,
    /// Post-session mood, 1-5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<f64>,
    /// Satisfaction with the recommendation, 0-1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfaction: Option<f64>,
    /// Fraction of the planned session actually done, 0-1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adherence: Option<f64>,
    /// Injury reported during or after the session.
    #[serde(default)]
    pub injury: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    /// Unique id, used for deduplication.
    pub event_id: String,
    /// The decision record this event resolves.
    pub decision_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort: Option<Cohort>,
    pub outcome: Outcome,
}
