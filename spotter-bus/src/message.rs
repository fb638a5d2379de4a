//! Detection publish message
//!
//! ```json
//! {
//!     "location": "lab",
//!     "detections": [
//!         {"labels": "person", "confidences": 0.9, "box": [166, 166, 83, 83]}
//!     ],
//!     "image": "<base64>"
//! }
//! ```
//!
//! Results without boxes (hybrid path) carry `"box": -1`.

use crate::error::BusError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use spotter_core::{DetectionResult, ImageSource};

const NO_BOX: i32 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoxField {
    Box([i32; 4]),
    Missing(i32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEntry {
    pub labels: String,
    pub confidences: f32,
    #[serde(rename = "box")]
    pub bbox: BoxField,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMessage {
    pub location: String,
    pub detections: Vec<DetectionEntry>,
    pub image: String,
}

impl DetectionMessage {
    /// Reads the image from disk for file sources.
    pub fn from_result(result: &DetectionResult, location: &str) -> Result<Self, BusError> {
        let image = match result.source() {
            ImageSource::File(path) => std::fs::read(path)?,
            ImageSource::Inline(bytes) => bytes.to_vec(),
        };

        let detections = result
            .labels()
            .iter()
            .zip(result.confidences())
            .enumerate()
            .map(|(i, (label, confidence))| DetectionEntry {
                labels: label.clone(),
                confidences: *confidence,
                bbox: match result.boxes() {
                    Some(boxes) => BoxField::Box(boxes[i].to_array()),
                    None => BoxField::Missing(NO_BOX),
                },
            })
            .collect();

        Ok(Self {
            location: location.to_string(),
            detections,
            image: STANDARD.encode(image),
        })
    }

    /// Pretty JSON with four space indentation
    pub fn to_json(&self) -> Result<Vec<u8>, BusError> {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.serialize(&mut serializer)?;
        Ok(buffer)
    }

    pub fn image_bytes(&self) -> Result<Vec<u8>, BusError> {
        STANDARD
            .decode(&self.image)
            .map_err(|e| BusError::Encoding(format!("image is not base64: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use spotter_core::BoxXywh;

    #[test]
    fn test_message_with_boxes() {
        let result = DetectionResult::new(
            vec!["person".to_string()],
            vec![0.5],
            Some(vec![BoxXywh::new(166, 166, 83, 83)]),
            ImageSource::Inline(Bytes::from_static(b"jpeg")),
        )
        .unwrap();

        let message = DetectionMessage::from_result(&result, "lab").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["location"], "lab");
        assert_eq!(value["detections"][0]["labels"], "person");
        assert_eq!(value["detections"][0]["confidences"], 0.5);
        assert_eq!(value["detections"][0]["box"], serde_json::json!([166, 166, 83, 83]));
        assert_eq!(value["image"], "anBlZw==");
    }

    #[test]
    fn test_message_without_boxes() {
        let result = DetectionResult::new(
            vec!["dog".to_string(), "cat".to_string()],
            vec![0.75, 0.25],
            None,
            ImageSource::Inline(Bytes::from_static(b"png")),
        )
        .unwrap();

        let message = DetectionMessage::from_result(&result, "hall").unwrap();
        let json = message.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["detections"][0]["box"], -1);
        assert_eq!(value["detections"][1]["box"], -1);
        assert_eq!(value["detections"][1]["labels"], "cat");
        assert!(String::from_utf8(json).unwrap().contains("\n    \"location\""));
    }

    #[test]
    fn test_message_reads_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame_hw_detection.png");
        std::fs::write(&path, b"\x89PNG").unwrap();
        let result =
            DetectionResult::new(vec!["car".to_string()], vec![0.9], None, ImageSource::File(path)).unwrap();

        let message = DetectionMessage::from_result(&result, "gate").unwrap();
        assert_eq!(message.image_bytes().unwrap(), b"\x89PNG");

        let parsed: DetectionMessage = serde_json::from_slice(&message.to_json().unwrap()).unwrap();
        assert_eq!(parsed.detections[0].bbox, BoxField::Missing(-1));
    }

    #[test]
    fn test_message_missing_file() {
        let result = DetectionResult::new(
            vec!["car".to_string()],
            vec![0.9],
            None,
            ImageSource::File("/nonexistent/frame.png".into()),
        )
        .unwrap();
        assert!(matches!(
            DetectionMessage::from_result(&result, "gate"),
            Err(BusError::Io(_))
        ));
    }
}
