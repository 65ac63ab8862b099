use std::io::Cursor;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use serde::Deserialize;

use crate::detect::{BBox, Detector, RawDetection};
use crate::error::DetectionError;
use crate::frame::Frame;

const UPLOAD_JPEG_QUALITY: u8 = 90;

/// Calls an external inference service over HTTP.
///
/// The frame is POSTed as `image/jpeg`; the service answers with a JSON
/// array of `{"label": "car" | "class_id": 2, "confidence": 0.87,
/// "bbox": [x, y, w, h]}`.
///
/// Uses the blocking client, so it must be built and used off the async
/// runtime (the producer thread).
pub struct HttpDetector {
    client: reqwest::blocking::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct WireDetection {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    class_id: Option<u32>,
    confidence: f32,
    bbox: [f32; 4],
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DetectionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl Detector for HttpDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, DetectionError> {
        let mut body = Cursor::new(Vec::with_capacity(64 * 1024));
        JpegEncoder::new_with_quality(&mut body, UPLOAD_JPEG_QUALITY).encode_image(&frame.pixels)?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body.into_inner())
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectionError::Status(status.as_u16()));
        }

        let bytes = response.bytes()?;
        parse_response(&bytes)
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn parse_response(bytes: &[u8]) -> Result<Vec<RawDetection>, DetectionError> {
    let wire: Vec<WireDetection> =
        serde_json::from_slice(bytes).map_err(|err| DetectionError::Malformed(err.to_string()))?;

    wire.into_iter()
        .map(|d| {
            let label = match (d.label, d.class_id) {
                (Some(label), _) => label,
                (None, Some(id)) => id.to_string(),
                (None, None) => {
                    return Err(DetectionError::Malformed(
                        "detection has neither label nor class_id".into(),
                    ));
                }
            };
            let [x, y, w, h] = d.bbox;
            Ok(RawDetection {
                label,
                confidence: d.confidence,
                bbox: BBox::new(x, y, w, h),
            })
        })
        .collect()
}
