//! Decoding of raw telemetry payloads into normalized records.

use base64::Engine;
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::io::Read;
use tracing::{debug, error};

use crate::model::{EngineStatus, TelemetryRecord};

const MAX_DECOMPRESSED_SIZE: usize = 10 * 1024 * 1024;

/// How a payload's bytes are wrapped on arrival.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Base64,
    Gzip,
}

impl ContentEncoding {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("base64") => ContentEncoding::Base64,
            Some("gzip") => ContentEncoding::Gzip,
            _ => ContentEncoding::Identity,
        }
    }
}

/// Metadata attached by the ingestion source.
#[derive(Clone, Debug, Default)]
pub struct ArrivalMetadata {
    pub sequence: Option<String>,
    pub arrived_at_ms: i64,
    pub encoding: ContentEncoding,
}

/// One undecoded telemetry payload.
#[derive(Clone, Debug)]
pub struct RawTelemetry {
    pub data: Bytes,
    pub arrival: ArrivalMetadata,
}

impl RawTelemetry {
    pub fn json(data: impl Into<Bytes>, arrived_at_ms: i64) -> Self {
        Self {
            data: data.into(),
            arrival: ArrivalMetadata {
                sequence: None,
                arrived_at_ms,
                encoding: ContentEncoding::Identity,
            },
        }
    }

    pub fn with_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.arrival.encoding = encoding;
        self
    }

    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.arrival.sequence = Some(sequence.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("base64 error: {0}")]
    Base64(String),
    #[error("decompress error: {0}")]
    Decompress(String),
    #[error("invalid telemetry json: {0}")]
    Json(String),
    #[error("missing vehicleId")]
    MissingVehicleId,
    #[error("negative speed {0}")]
    NegativeSpeed(f64),
}

#[derive(Deserialize)]
struct WireTelemetry {
    #[serde(rename = "vehicleId")]
    vehicle_id: Option<String>,
    timestamp: Option<i64>,
    location: Option<JsonValue>,
    speed: Option<f64>,
    direction: Option<JsonValue>,
    cargo_temperature: Option<f64>,
    engine_status: Option<EngineStatus>,
}

/// Decode and normalize one payload. A missing timestamp is filled with `now_ms`.
pub fn decode_record(raw: &RawTelemetry, now_ms: i64) -> Result<TelemetryRecord, DecodeError> {
    let body = unwrap_payload(&raw.data, raw.arrival.encoding)?;

    let wire: WireTelemetry =
        serde_json::from_slice(&body).map_err(|e| DecodeError::Json(e.to_string()))?;

    let vehicle_id = wire
        .vehicle_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(DecodeError::MissingVehicleId)?;

    if let Some(speed) = wire.speed {
        if speed < 0.0 {
            return Err(DecodeError::NegativeSpeed(speed));
        }
    }

    Ok(TelemetryRecord {
        vehicle_id,
        timestamp: wire.timestamp.unwrap_or(now_ms),
        location: wire.location,
        speed: wire.speed,
        direction: wire.direction,
        cargo_temperature: wire.cargo_temperature,
        engine_status: wire.engine_status.unwrap_or_default(),
    })
}

fn unwrap_payload(data: &Bytes, encoding: ContentEncoding) -> Result<Bytes, DecodeError> {
    match encoding {
        ContentEncoding::Identity => Ok(data.clone()),
        ContentEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(data.as_ref())
            .map(Bytes::from)
            .map_err(|e| DecodeError::Base64(e.to_string())),
        ContentEncoding::Gzip => decompress_gzip(data.clone()),
    }
}

/// Inflate a gzip body, refusing anything larger than 10MB once decompressed.
pub(crate) fn decompress_gzip(body: Bytes) -> Result<Bytes, DecodeError> {
    debug!(compressed_size = body.len(), "decompressing gzipped body");
    let decoder = GzDecoder::new(body.as_ref());
    let mut decompressed = Vec::with_capacity(body.len().saturating_mul(2));
    let bytes_read = decoder
        .take((MAX_DECOMPRESSED_SIZE + 1) as u64)
        .read_to_end(&mut decompressed)
        .map_err(|e| {
            error!(error = %e, "gzip decompression failed");
            DecodeError::Decompress(e.to_string())
        })?;
    if bytes_read > MAX_DECOMPRESSED_SIZE {
        error!(
            bytes_read,
            max = MAX_DECOMPRESSED_SIZE,
            "decompressed size exceeds limit"
        );
        return Err(DecodeError::Decompress(format!(
            "exceeds {}MB limit",
            MAX_DECOMPRESSED_SIZE / 1024 / 1024
        )));
    }
    Ok(Bytes::from(decompressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn decodes_full_record() {
        let raw = RawTelemetry::json(
            r#"{"vehicleId":"T1","timestamp":1699999999000,"location":{"lat":40.7,"lon":-74.0},
                "speed":65.5,"direction":"N","cargo_temperature":4.5,"engine_status":"on"}"#,
            NOW,
        );
        let record = decode_record(&raw, NOW).unwrap();
        assert_eq!(record.vehicle_id, "T1");
        assert_eq!(record.timestamp, 1_699_999_999_000);
        assert_eq!(record.speed, Some(65.5));
        assert_eq!(record.cargo_temperature, Some(4.5));
        assert_eq!(record.engine_status, EngineStatus::On);
        assert_eq!(record.direction, Some(JsonValue::from("N")));
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let raw = RawTelemetry::json(r#"{"vehicleId":"T2"}"#, NOW);
        let record = decode_record(&raw, NOW).unwrap();
        assert_eq!(record.timestamp, NOW);
        assert_eq!(record.speed, None);
        assert_eq!(record.engine_status, EngineStatus::Unknown);
    }

    #[test]
    fn rejects_empty_vehicle_id() {
        let raw = RawTelemetry::json(r#"{"vehicleId":"  ","speed":3}"#, NOW);
        assert!(matches!(
            decode_record(&raw, NOW),
            Err(DecodeError::MissingVehicleId)
        ));

        let raw = RawTelemetry::json(r#"{"speed":3}"#, NOW);
        assert!(matches!(
            decode_record(&raw, NOW),
            Err(DecodeError::MissingVehicleId)
        ));
    }

    #[test]
    fn rejects_negative_speed() {
        let raw = RawTelemetry::json(r#"{"vehicleId":"T3","speed":-1}"#, NOW);
        assert!(matches!(
            decode_record(&raw, NOW),
            Err(DecodeError::NegativeSpeed(_))
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        let raw = RawTelemetry::json("{not json", NOW);
        assert!(matches!(decode_record(&raw, NOW), Err(DecodeError::Json(_))));
    }

    #[test]
    fn decodes_base64_payload() {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(r#"{"vehicleId":"B1","speed":10}"#);
        let raw = RawTelemetry::json(encoded, NOW).with_encoding(ContentEncoding::Base64);
        let record = decode_record(&raw, NOW).unwrap();
        assert_eq!(record.vehicle_id, "B1");
    }

    #[test]
    fn invalid_base64_is_a_decode_error() {
        let raw = RawTelemetry::json("***", NOW).with_encoding(ContentEncoding::Base64);
        assert!(matches!(
            decode_record(&raw, NOW),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn decodes_gzip_payload() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(br#"{"vehicleId":"G1","engine_status":"off"}"#)
            .unwrap();
        let compressed = encoder.finish().unwrap();
        let raw = RawTelemetry::json(compressed, NOW).with_encoding(ContentEncoding::Gzip);
        let record = decode_record(&raw, NOW).unwrap();
        assert_eq!(record.vehicle_id, "G1");
        assert_eq!(record.engine_status, EngineStatus::Off);
    }

    #[test]
    fn encoding_from_header() {
        assert_eq!(
            ContentEncoding::from_header(Some("GZIP")),
            ContentEncoding::Gzip
        );
        assert_eq!(
            ContentEncoding::from_header(Some("base64")),
            ContentEncoding::Base64
        );
        assert_eq!(ContentEncoding::from_header(None), ContentEncoding::Identity);
    }
}
