//! JSON encoding of frame events on the upstream topic.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::ingest::{FrameEvent, LogPosition};
use crate::publish::format_timestamp;
use crate::routing::RoutingKey;

/// Frame event as published by camera producers.
#[derive(Debug, Serialize, Deserialize)]
pub struct FrameEventMessage {
    pub plant_id: String,
    pub site_id: String,
    pub camera_code: String,
    pub timestamp: String,
    /// Base64 encoded image bytes.
    pub frame: String,
}

pub fn decode_frame_event(payload: &[u8], position: LogPosition) -> Result<FrameEvent, EngineError> {
    let msg: FrameEventMessage =
        serde_json::from_slice(payload).map_err(|e| EngineError::Decode(e.to_string()))?;
    let captured_at = parse_timestamp(&msg.timestamp)?;
    let frame = BASE64
        .decode(msg.frame.as_bytes())
        .map_err(|e| EngineError::Decode(format!("frame is not base64: {}", e)))?;
    Ok(FrameEvent {
        source: RoutingKey::new(msg.plant_id, msg.site_id, msg.camera_code),
        captured_at,
        payload: frame,
        position,
    })
}

pub fn encode_frame_event(
    source: &RoutingKey,
    captured_at: &DateTime<Utc>,
    frame: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let msg = FrameEventMessage {
        plant_id: source.source_group.clone(),
        site_id: source.source_subgroup.clone(),
        camera_code: source.source_id.clone(),
        timestamp: format_timestamp(captured_at),
        frame: BASE64.encode(frame),
    };
    Ok(serde_json::to_vec(&msg)?)
}

/// ISO-8601 with an offset, or without one (read as UTC).
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, EngineError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| EngineError::Decode(format!("bad timestamp {:?}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn decodes_producer_message() {
        let payload = br#"{"plant_id":"plantA","site_id":"site1","camera_code":"CAM01",
            "timestamp":"2024-05-01T13:45:00.250","frame":"/9j/AA=="}"#;
        let event = decode_frame_event(payload, LogPosition(3)).unwrap();
        assert_eq!(event.source, RoutingKey::new("plantA", "site1", "CAM01"));
        assert_eq!(event.captured_at.timestamp_millis() % 1000, 250);
        assert_eq!(event.payload, vec![0xff, 0xd8, 0xff, 0x00]);
        assert_eq!(event.position, LogPosition(3));
    }

    #[test]
    fn offset_timestamps_are_normalised_to_utc() {
        let ts = parse_timestamp("2024-05-01T15:45:00+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 0).unwrap());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_frame_event(b"not json", LogPosition(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);

        let bad_frame = br#"{"plant_id":"p","site_id":"s","camera_code":"c",
            "timestamp":"2024-05-01T13:45:00Z","frame":"***"}"#;
        let err = decode_frame_event(bad_frame, LogPosition(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn encoded_event_decodes_back() {
        let key = RoutingKey::new("plantA", "site1", "CAM01");
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 0).unwrap();
        let bytes = encode_frame_event(&key, &at, b"jpeg").unwrap();
        let event = decode_frame_event(&bytes, LogPosition(9)).unwrap();
        assert_eq!(event.source, key);
        assert_eq!(event.captured_at, at);
        assert_eq!(event.payload, b"jpeg");
    }
}
