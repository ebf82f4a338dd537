//! Structured payloads exchanged over the data link
//!
//! Payloads are JSON objects discriminated by a `tag` field. A receiver
//! acts on the tag alone; tags it does not know are skipped.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

const KNOWN_TAGS: &[&str] = &["image", "marks", "clear", "measure"];

/// Point on the shared floor plan, in plan coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Closed, saved region (a room outline)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub points: Vec<Point>,
    pub color: String,
}

/// Live measurement state forwarded from the capturing side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSnapshot {
    /// Total length, already formatted (e.g. "3.42 m")
    pub total: String,
    /// Number of placed points
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<String>>,
    /// Whether measuring is currently in progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

/// Payload variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "lowercase")]
pub enum Payload {
    /// Floor plan image as a data URL
    Image { data: String },
    /// In-progress outline plus saved regions
    Marks {
        #[serde(default)]
        points: Vec<Point>,
        #[serde(default)]
        regions: Vec<Region>,
    },
    /// Clear all marks
    Clear,
    /// Live measurement snapshot
    Measure(MeasurementSnapshot),
}

impl Payload {
    /// Build an image payload from raw image bytes
    pub fn image(mime: &str, bytes: &[u8]) -> Self {
        Payload::Image {
            data: format!("data:{};base64,{}", mime, STANDARD.encode(bytes)),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Payload::Image { .. } => "image",
            Payload::Marks { .. } => "marks",
            Payload::Clear => "clear",
            Payload::Measure(_) => "measure",
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a received payload
    ///
    /// Returns `Ok(None)` for well-formed messages carrying an unknown tag.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let tag = value
            .get("tag")
            .and_then(|t| t.as_str())
            .ok_or_else(|| SessionError::Serialization("payload has no tag".to_string()))?;

        if !KNOWN_TAGS.contains(&tag) {
            return Ok(None);
        }

        Ok(Some(serde_json::from_value(value)?))
    }
}

/// Split an image data URL into its MIME type and decoded bytes
pub fn decode_image_data(data: &str) -> Result<(String, Vec<u8>)> {
    let rest = data
        .strip_prefix("data:")
        .ok_or_else(|| SessionError::Serialization("not a data URL".to_string()))?;
    let (mime, encoded) = rest
        .split_once(";base64,")
        .ok_or_else(|| SessionError::Serialization("data URL is not base64".to_string()))?;

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SessionError::Serialization(format!("invalid image data: {}", e)))?;

    Ok((mime.to_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        let marks = Payload::Marks {
            points: vec![Point::new(1.0, 2.5)],
            regions: vec![Region {
                points: vec![Point::new(0.0, 0.0), Point::new(4.0, 0.0)],
                color: "#ff0000".to_string(),
            }],
        };
        let json: serde_json::Value = serde_json::from_slice(&marks.encode().unwrap()).unwrap();
        assert_eq!(json["tag"], "marks");
        assert_eq!(json["points"][0]["y"], 2.5);
        assert_eq!(json["regions"][0]["color"], "#ff0000");

        let clear = serde_json::to_string(&Payload::Clear).unwrap();
        assert_eq!(clear, r#"{"tag":"clear"}"#);
    }

    #[test]
    fn test_measure_is_flat() {
        let payload = Payload::Measure(MeasurementSnapshot {
            total: "3.42 m".to_string(),
            count: 3,
            area: None,
            segments: Some(vec!["1.20 m".to_string(), "2.22 m".to_string()]),
            active: Some(true),
        });
        let json: serde_json::Value = serde_json::from_slice(&payload.encode().unwrap()).unwrap();
        assert_eq!(json["tag"], "measure");
        assert_eq!(json["total"], "3.42 m");
        assert_eq!(json["count"], 3);
        assert!(json.get("area").is_none());
    }

    #[test]
    fn test_decode_known_tags() {
        let decoded = Payload::decode(br#"{"tag":"measure","total":"0.00 m","count":0}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            decoded,
            Payload::Measure(MeasurementSnapshot {
                total: "0.00 m".to_string(),
                ..Default::default()
            })
        );

        let decoded = Payload::decode(br#"{"tag":"marks","points":[]}"#).unwrap().unwrap();
        assert_eq!(
            decoded,
            Payload::Marks {
                points: vec![],
                regions: vec![]
            }
        );
    }

    #[test]
    fn test_decode_unknown_tag_is_skipped() {
        assert_eq!(Payload::decode(br#"{"tag":"laser","x":1}"#).unwrap(), None);
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(Payload::decode(b"not json").is_err());
        assert!(Payload::decode(br#"{"kind":"clear"}"#).is_err());
    }

    #[test]
    fn test_image_data_url() {
        let payload = Payload::image("image/png", &[0x89, b'P', b'N', b'G']);
        let Payload::Image { data } = payload else {
            panic!("expected image payload");
        };
        assert!(data.starts_with("data:image/png;base64,"));

        let (mime, bytes) = decode_image_data(&data).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, vec![0x89, b'P', b'N', b'G']);
        assert!(decode_image_data("http://example.com/a.png").is_err());
    }
}
