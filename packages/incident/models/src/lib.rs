#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Incident record types shared across the client stack.
//!
//! Defines the canonical [`Incident`] shape, its lifecycle [`IncidentState`],
//! the [`StreamEvent`] envelope carried over the live WebSocket feed, and the
//! [`ConnectionState`] reported by the sync store. The backend emits two
//! frame encodings (a typed `{type, payload}` envelope and bare incident
//! objects); [`StreamEvent::parse_frame`] accepts both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle state of an incident.
///
/// The progression `New → Travelling → Onsite → Finished` reflects the
/// field-responder workflow, but the backend does not enforce monotonic
/// transitions — any state may be assigned at any time.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IncidentState {
    /// Freshly detected, no responder assigned. Wire default when the
    /// field is absent.
    #[default]
    New,
    /// A responder is en route.
    Travelling,
    /// A responder is on site.
    Onsite,
    /// The incident has been resolved.
    Finished,
    /// Confirmed by a human operator as a real fire.
    ValidatedFire,
}

/// A reported incident as delivered by the REST API and the live stream.
///
/// Coordinates are optional — incidents whose geolocation has not resolved
/// yet still appear in the feed. Unknown wire fields (e.g. `description`,
/// `severity`) are ignored; this client only consumes what it renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    /// Stable unique identifier, preserved across updates.
    pub id: i64,
    /// Latitude (WGS84). `None` while geolocation is unresolved.
    #[serde(default)]
    pub lat: Option<f64>,
    /// Longitude (WGS84). `None` while geolocation is unresolved.
    #[serde(default)]
    pub lon: Option<f64>,
    /// Detection certainty. Either a fraction in `[0, 1]` or an integer
    /// percentage, depending on the detector version that produced it.
    #[serde(default)]
    pub confidence: f64,
    /// Lifecycle state; absent on the wire means [`IncidentState::New`].
    #[serde(default)]
    pub state: IncidentState,
    /// Creation timestamp. `None` on malformed or partial payloads.
    /// Both `createdAt` and `created_at` are observed on the wire.
    #[serde(default, alias = "created_at")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Returns the detection confidence normalized to a fraction in
    /// `[0, 1]`, treating values above 1 as percentages.
    #[must_use]
    pub fn confidence_fraction(&self) -> f64 {
        if self.confidence > 1.0 {
            self.confidence / 100.0
        } else {
            self.confidence
        }
    }

    /// Returns `(lat, lon)` when both coordinates are present.
    #[must_use]
    pub const fn position(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Typed `{type, payload}` frame as sent by the admin event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum Envelope {
    Create(Incident),
    Update(Incident),
    Delete(DeleteRef),
}

/// Delete payloads sometimes carry the full incident; only the id matters.
#[derive(Debug, Clone, Deserialize)]
struct DeleteRef {
    id: i64,
}

/// A single event applied to the incident feed.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A new incident appeared.
    Created(Incident),
    /// An existing incident changed.
    Updated(Incident),
    /// An incident was removed server-side.
    Deleted {
        /// Identifier of the removed incident.
        id: i64,
    },
}

impl StreamEvent {
    /// Parses a raw text frame from the live stream.
    ///
    /// Tries the typed `{type, payload}` envelope first, then falls back
    /// to a bare incident object, which carries create semantics.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error if the frame matches neither
    /// encoding. Callers drop such frames per-message; a parse failure
    /// never affects the connection.
    pub fn parse_frame(frame: &str) -> Result<Self, serde_json::Error> {
        if let Ok(envelope) = serde_json::from_str::<Envelope>(frame) {
            return Ok(match envelope {
                Envelope::Create(incident) => Self::Created(incident),
                Envelope::Update(incident) => Self::Updated(incident),
                Envelope::Delete(DeleteRef { id }) => Self::Deleted { id },
            });
        }
        serde_json::from_str::<Incident>(frame).map(Self::Created)
    }

    /// Returns the incident id this event refers to.
    #[must_use]
    pub const fn id(&self) -> i64 {
        match self {
            Self::Created(incident) | Self::Updated(incident) => incident.id,
            Self::Deleted { id } => *id,
        }
    }
}

/// Health of the live connection, owned by the sync store and read-only
/// to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Initial state and every reconnection attempt.
    Connecting,
    /// The socket is open and frames are flowing.
    Connected,
    /// The socket dropped; a reconnect may be pending, or retries are
    /// exhausted.
    Disconnected,
    /// Terminal: the store was shut down intentionally.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_wire_names() {
        let json = serde_json::to_string(&IncidentState::ValidatedFire).unwrap();
        assert_eq!(json, "\"validated_fire\"");
        let back: IncidentState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, IncidentState::ValidatedFire);
    }

    #[test]
    fn state_display_matches_wire() {
        assert_eq!(IncidentState::Onsite.to_string(), "onsite");
        assert_eq!("travelling".parse::<IncidentState>().unwrap(), IncidentState::Travelling);
    }

    #[test]
    fn parses_camel_case_incident() {
        let incident: Incident = serde_json::from_str(
            r#"{"id": 7, "lat": 43.6, "lon": 1.44, "confidence": 0.92,
                "state": "onsite", "createdAt": "2025-06-19T01:59:00Z"}"#,
        )
        .unwrap();
        assert_eq!(incident.id, 7);
        assert_eq!(incident.state, IncidentState::Onsite);
        assert!(incident.created_at.is_some());
    }

    #[test]
    fn accepts_snake_case_timestamp_alias() {
        let incident: Incident = serde_json::from_str(
            r#"{"id": 1, "created_at": "2025-06-19T01:59:00Z"}"#,
        )
        .unwrap();
        assert!(incident.created_at.is_some());
    }

    #[test]
    fn missing_state_defaults_to_new() {
        let incident: Incident =
            serde_json::from_str(r#"{"id": 3, "confidence": 0.5}"#).unwrap();
        assert_eq!(incident.state, IncidentState::New);
        assert!(incident.created_at.is_none());
        assert!(incident.position().is_none());
    }

    #[test]
    fn ignores_unknown_fields() {
        let incident: Incident = serde_json::from_str(
            r#"{"id": 4, "severity": 3, "description": "smoke column"}"#,
        )
        .unwrap();
        assert_eq!(incident.id, 4);
    }

    #[test]
    fn normalizes_percentage_confidence() {
        let incident: Incident =
            serde_json::from_str(r#"{"id": 5, "confidence": 87}"#).unwrap();
        assert!((incident.confidence_fraction() - 0.87).abs() < f64::EPSILON);
    }

    #[test]
    fn fractional_confidence_passes_through() {
        let incident: Incident =
            serde_json::from_str(r#"{"id": 5, "confidence": 0.87}"#).unwrap();
        assert!((incident.confidence_fraction() - 0.87).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_enveloped_create_frame() {
        let event = StreamEvent::parse_frame(
            r#"{"type": "create", "payload": {"id": 11, "confidence": 0.8}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::Created(incident) => assert_eq!(incident.id, 11),
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn parses_enveloped_update_frame() {
        let event = StreamEvent::parse_frame(
            r#"{"type": "update", "payload": {"id": 11, "state": "finished"}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::Updated(incident) => {
                assert_eq!(incident.state, IncidentState::Finished);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn parses_delete_frame_with_full_payload() {
        let event = StreamEvent::parse_frame(
            r#"{"type": "delete", "payload": {"id": 11, "lat": 43.6, "lon": 1.44}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::Deleted { id } => assert_eq!(id, 11),
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn bare_incident_frame_is_create() {
        let event =
            StreamEvent::parse_frame(r#"{"id": 42, "confidence": 0.7, "state": "new"}"#).unwrap();
        match event {
            StreamEvent::Created(ref incident) => assert_eq!(incident.id, 42),
            other => panic!("expected create, got {other:?}"),
        }
        assert_eq!(event.id(), 42);
    }

    #[test]
    fn rejects_malformed_frame() {
        assert!(StreamEvent::parse_frame("not json").is_err());
        assert!(StreamEvent::parse_frame(r#"{"type": "create"}"#).is_err());
        assert!(StreamEvent::parse_frame("[1, 2, 3]").is_err());
    }
}
